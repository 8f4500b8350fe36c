//! Trade-offer poller collaborator
//!
//! The external trade system is poll-based and eventually consistent. The
//! poller keeps a last-seen-state cache per offer (the poll state), emits a
//! change event whenever a fetched offer differs from the cache, and
//! persists the cache to disk so a restart resumes from the last known
//! cursor instead of replaying every historical offer.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::client::WebSession;
use crate::types::{OfferDirection, OfferEvent, OfferId, OfferState, TradeOffer};

/// Which offers a fetch should cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferFilter {
    ActiveOnly,
    /// Every offer the external system still reports, regardless of age
    All,
}

/// Last-seen offer states, keyed by direction then offer id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollState {
    #[serde(default)]
    pub sent: HashMap<OfferId, OfferState>,
    #[serde(default)]
    pub received: HashMap<OfferId, OfferState>,
}

impl PollState {
    pub fn bucket(&self, direction: OfferDirection) -> &HashMap<OfferId, OfferState> {
        match direction {
            OfferDirection::Sent => &self.sent,
            OfferDirection::Received => &self.received,
        }
    }

    pub fn bucket_mut(&mut self, direction: OfferDirection) -> &mut HashMap<OfferId, OfferState> {
        match direction {
            OfferDirection::Sent => &mut self.sent,
            OfferDirection::Received => &mut self.received,
        }
    }
}

/// Contract the reconciler and runner need from the polling subsystem
#[async_trait]
pub trait OfferPoller: Send + Sync {
    /// Authoritative fetch of a single offer
    async fn get_offer(&self, id: OfferId) -> anyhow::Result<TradeOffer>;

    /// Fetch (sent, received) offers matching the filter
    async fn get_offers(
        &self,
        filter: OfferFilter,
    ) -> anyhow::Result<(Vec<TradeOffer>, Vec<TradeOffer>)>;

    /// Shared last-seen state; the bypass path reads and updates it
    fn poll_state(&self) -> Arc<Mutex<PollState>>;
}

/// Poller backed by the local protocol gateway's offers endpoints. Clones
/// share the poll state.
#[derive(Clone)]
pub struct GatewayOfferPoller {
    http: Client,
    base_url: String,
    state: Arc<Mutex<PollState>>,
}

#[derive(Debug, Deserialize)]
struct OffersResponse {
    sent: Vec<TradeOffer>,
    received: Vec<TradeOffer>,
}

impl GatewayOfferPoller {
    pub fn new(base_url: &str, initial_state: PollState) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building poller HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            state: Arc::new(Mutex::new(initial_state)),
        })
    }

    /// Hand the poller the authenticated web session. The gateway needs it
    /// before offer endpoints return anything useful.
    pub async fn set_web_session(&self, session: &WebSession) -> anyhow::Result<()> {
        let response = self
            .http
            .post(format!("{}/offers/session", self.base_url))
            .json(session)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow!("offer session setup failed: {}", response.status()))
        }
    }

    /// One poll cycle: fetch active offers, diff against the last-seen
    /// cache, update the cache, and return the change events in fetch
    /// order. New offers are reported with `old_state = None`.
    pub async fn poll_once(&self) -> anyhow::Result<Vec<OfferEvent>> {
        let (sent, received) = self.get_offers(OfferFilter::ActiveOnly).await?;
        let mut events = Vec::new();
        let mut state = self.state.lock().expect("poll state poisoned");
        for (direction, offers) in [
            (OfferDirection::Sent, sent),
            (OfferDirection::Received, received),
        ] {
            let bucket = state.bucket_mut(direction);
            for offer in offers {
                let old_state = bucket.get(&offer.id).copied();
                if old_state != Some(offer.state) {
                    bucket.insert(offer.id, offer.state);
                    debug!(
                        offer = offer.id,
                        ?direction,
                        ?old_state,
                        new_state = ?offer.state,
                        "offer changed"
                    );
                    events.push(OfferEvent {
                        direction,
                        offer,
                        old_state,
                    });
                }
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl OfferPoller for GatewayOfferPoller {
    async fn get_offer(&self, id: OfferId) -> anyhow::Result<TradeOffer> {
        let response = self
            .http
            .get(format!("{}/offers/{id}", self.base_url))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json::<TradeOffer>().await?)
        } else {
            Err(anyhow!("offer {id} fetch failed: {}", response.status()))
        }
    }

    async fn get_offers(
        &self,
        filter: OfferFilter,
    ) -> anyhow::Result<(Vec<TradeOffer>, Vec<TradeOffer>)> {
        let scope = match filter {
            OfferFilter::ActiveOnly => "active",
            OfferFilter::All => "all",
        };
        let response = self
            .http
            .get(format!("{}/offers?scope={scope}", self.base_url))
            .send()
            .await?;
        if response.status().is_success() {
            let body = response.json::<OffersResponse>().await?;
            Ok((body.sent, body.received))
        } else {
            Err(anyhow!("offers fetch failed: {}", response.status()))
        }
    }

    fn poll_state(&self) -> Arc<Mutex<PollState>> {
        self.state.clone()
    }
}

/// Poll-resume cursor persisted as JSON.
///
/// Reads tolerate a missing or corrupt file (fresh default); writes are
/// best-effort and skipped while a previous write is still in flight.
pub struct PollCursorFile {
    path: PathBuf,
    writing: Arc<AtomicBool>,
}

impl PollCursorFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn read(&self) -> PollState {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %self.path.display(), "corrupt poll cursor, starting fresh: {e}");
                    PollState::default()
                }
            },
            Err(_) => PollState::default(),
        }
    }

    /// Write the cursor unless a write is already in flight
    pub async fn write(&self, state: &PollState) {
        if self.writing.swap(true, Ordering::SeqCst) {
            debug!("poll cursor write already in flight, skipping");
            return;
        }
        let payload = match serde_json::to_vec(state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("poll cursor serialization failed: {e}");
                self.writing.store(false, Ordering::SeqCst);
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&self.path, payload).await {
            warn!(path = %self.path.display(), "poll cursor write failed: {e}");
        }
        self.writing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let dir = tempdir().unwrap();
        let cursor = PollCursorFile::new(dir.path().join("cursor.json"));

        let mut state = PollState::default();
        state.sent.insert(42, OfferState::Active);
        state.received.insert(7, OfferState::InEscrow);
        cursor.write(&state).await;

        let restored = cursor.read().await;
        assert_eq!(restored.sent.get(&42), Some(&OfferState::Active));
        assert_eq!(restored.received.get(&7), Some(&OfferState::InEscrow));
    }

    #[tokio::test]
    async fn test_cursor_defaults_on_missing_or_corrupt_file() {
        let dir = tempdir().unwrap();
        let cursor = PollCursorFile::new(dir.path().join("absent.json"));
        let state = cursor.read().await;
        assert!(state.sent.is_empty() && state.received.is_empty());

        let path = dir.path().join("corrupt.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let cursor = PollCursorFile::new(path);
        let state = cursor.read().await;
        assert!(state.sent.is_empty() && state.received.is_empty());
    }
}
