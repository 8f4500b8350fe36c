//! Trade-offer reconciliation
//!
//! Multiplexes external poll-based trade-offer events to registered
//! handlers, and short-circuits the slow poll cycle when a side-channel
//! signal (a mobile confirmation) says an offer just changed: fetch the
//! authoritative state directly, diff it against the poller's cache, and
//! synthesize the same change event the poller would eventually emit.

use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::handlers::{Disposition, ExpiringHandlerRegistry};
use crate::poller::{OfferFilter, OfferPoller};
use crate::types::{
    ConfirmationEvent, OfferAsset, OfferDirection, OfferEvent, OfferId, OfferState, TradeOffer,
};

/// How long a fetched active-offers set absorbs repeat requests
const ACTIVE_OFFERS_DECAY: Duration = Duration::from_secs(4);

/// Items currently locked in escrow across all offers
#[derive(Debug, Clone, Default)]
pub struct EscrowSnapshot {
    pub to_give: Vec<OfferAsset>,
    pub to_receive: Vec<OfferAsset>,
}

impl EscrowSnapshot {
    pub fn counted(&self) -> (usize, usize) {
        (self.to_give.len(), self.to_receive.len())
    }
}

struct ActiveOffersCache {
    sent: Vec<TradeOffer>,
    received: Vec<TradeOffer>,
    fetched_at: Instant,
}

/// Bridges the poller with same-session fast paths and owns the two
/// expiring notification registries.
pub struct TradeOfferReconciler<P> {
    poller: P,
    offer_handlers: ExpiringHandlerRegistry<OfferId, OfferEvent>,
    confirmation_handlers: ExpiringHandlerRegistry<OfferId, ConfirmationEvent>,
    escrow: EscrowSnapshot,
    active_cache: Option<ActiveOffersCache>,
}

impl<P: OfferPoller> TradeOfferReconciler<P> {
    pub fn new(poller: P) -> Self {
        Self {
            poller,
            offer_handlers: ExpiringHandlerRegistry::new("offer-change"),
            confirmation_handlers: ExpiringHandlerRegistry::new("confirmation"),
            escrow: EscrowSnapshot::default(),
            active_cache: None,
        }
    }

    pub fn poller(&self) -> &P {
        &self.poller
    }

    /// Subscribe to state changes of one offer
    pub fn on_offer_change<F>(&mut self, offer_id: OfferId, callback: F)
    where
        F: FnMut(&OfferEvent) -> Disposition + Send + 'static,
    {
        self.offer_handlers.register(offer_id, callback);
    }

    pub fn offer_has_listener(&self, offer_id: OfferId) -> bool {
        self.offer_handlers.has_listener(&offer_id)
    }

    pub fn remove_offer_listener(&mut self, offer_id: OfferId) {
        self.offer_handlers.unregister(&offer_id);
    }

    /// Subscribe to the confirmation outcome of one offer
    pub fn on_confirmation<F>(&mut self, offer_id: OfferId, callback: F)
    where
        F: FnMut(&ConfirmationEvent) -> Disposition + Send + 'static,
    {
        self.confirmation_handlers.register(offer_id, callback);
    }

    pub fn remove_confirmation_listener(&mut self, offer_id: OfferId) {
        self.confirmation_handlers.unregister(&offer_id);
    }

    /// Dispatch a poller-emitted (or synthesized) change event. Handlers
    /// must be idempotent: the poller may re-emit a change the bypass path
    /// already delivered.
    pub fn handle_offer_event(&mut self, event: &OfferEvent) {
        self.offer_handlers.dispatch(&event.offer.id, event);
    }

    /// Route a confirmation outcome: a successful confirmation bypasses the
    /// poll cycle for that offer before its waiters are notified.
    pub async fn handle_confirmation(&mut self, event: ConfirmationEvent) {
        match &event.error {
            None => {
                debug!(offer = event.offer_id, "trade confirmed");
                self.bypass(event.offer_id).await;
            }
            Some(e) => error!(offer = event.offer_id, "confirming trade failed: {e}"),
        }
        self.confirmation_handlers.dispatch(&event.offer_id, &event);
    }

    /// Short-circuit the poll cycle for one offer. Emits at most one
    /// synthesized change event per call; on fetch failure nothing is
    /// emitted and the cache is left for the regular poll to catch up.
    pub async fn bypass(&mut self, offer_id: OfferId) -> Option<OfferEvent> {
        let state_handle = self.poller.poll_state();
        for direction in OfferDirection::BOTH {
            let cached = {
                let state = state_handle.lock().expect("poll state poisoned");
                state.bucket(direction).get(&offer_id).copied()
            };
            let Some(old_state) = cached else {
                continue;
            };

            let offer = match self.poller.get_offer(offer_id).await {
                Ok(offer) => offer,
                Err(e) => {
                    error!("wasn't able to fetch offer {offer_id} to bypass polling: {e}");
                    return None;
                }
            };

            // Emit only if the poll cycle hasn't already caught this change
            let changed = {
                let mut state = state_handle.lock().expect("poll state poisoned");
                let bucket = state.bucket_mut(direction);
                if bucket.get(&offer_id).copied() != Some(offer.state) {
                    bucket.insert(offer_id, offer.state);
                    true
                } else {
                    false
                }
            };
            if changed {
                debug!(
                    offer = offer_id,
                    from = ?old_state,
                    to = ?offer.state,
                    "bypassing poll cycle"
                );
                let event = OfferEvent {
                    direction,
                    offer,
                    old_state: Some(old_state),
                };
                self.handle_offer_event(&event);
                return Some(event);
            }
        }
        None
    }

    /// Rebuild the escrow snapshot from every offer the external system
    /// still reports.
    pub async fn refresh_escrow(&mut self) -> anyhow::Result<()> {
        let (sent, received) = match self.poller.get_offers(OfferFilter::All).await {
            Ok(offers) => offers,
            Err(e) => {
                warn!("wasn't able to fetch items in escrow: {e}");
                return Err(e);
            }
        };
        let mut snapshot = EscrowSnapshot::default();
        for offer in sent.iter().chain(received.iter()) {
            if offer.state == OfferState::InEscrow {
                snapshot.to_give.extend(offer.items_to_give.iter().cloned());
                snapshot
                    .to_receive
                    .extend(offer.items_to_receive.iter().cloned());
            }
        }
        self.escrow = snapshot;
        Ok(())
    }

    pub fn escrow(&self) -> &EscrowSnapshot {
        &self.escrow
    }

    /// Active offers with a short decay window to absorb request bursts
    pub async fn active_offers(&mut self) -> anyhow::Result<(Vec<TradeOffer>, Vec<TradeOffer>)> {
        if let Some(cache) = &self.active_cache {
            if cache.fetched_at.elapsed() < ACTIVE_OFFERS_DECAY {
                return Ok((cache.sent.clone(), cache.received.clone()));
            }
        }
        let (sent, received) = self.poller.get_offers(OfferFilter::ActiveOnly).await?;
        self.active_cache = Some(ActiveOffersCache {
            sent: sent.clone(),
            received: received.clone(),
            fetched_at: Instant::now(),
        });
        Ok((sent, received))
    }
}
