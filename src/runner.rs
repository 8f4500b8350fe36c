//! Shop runner - main orchestration loop
//!
//! Wires the session machine, the offer poller/reconciler, the market
//! ledger, and the contact roster together, and drives them from one
//! select loop: gateway push events, the poll cycle, the login retry
//! timer, and the periodic maintenance tasks (currency refresh, escrow
//! snapshot, drift repair).

use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::client::GatewayClient;
use crate::config::{Credentials, Settings};
use crate::contacts::{Contact, ContactRoster};
use crate::ledger::{DriftReport, InventorySnapshot, ItemStatus, MarketLedger, SlotInfo};
use crate::poller::{GatewayOfferPoller, OfferPoller, PollCursorFile};
use crate::pricing::{CurrencyFeed, GatewayCurrencyFeed, Price};
use crate::reconciler::TradeOfferReconciler;
use crate::session::{Session, SessionNotice};
use crate::storage::{self, PgStore};
use crate::types::{ClientEvent, ConfirmationEvent, OfferEvent, OfferState};

/// The assembled runner
pub struct ShopRunner {
    settings: Settings,
    session: Session<GatewayClient, GatewayClient>,
    client_events: tokio::sync::mpsc::Receiver<ClientEvent>,
    reconciler: TradeOfferReconciler<GatewayOfferPoller>,
    poller: GatewayOfferPoller,
    ledger: MarketLedger<PgStore, PgStore>,
    roster: ContactRoster,
    currency_feed: GatewayCurrencyFeed,
    cursor: PollCursorFile,
    gateway: GatewayClient,
}

impl ShopRunner {
    /// Connect the durable store and assemble every component
    pub async fn build(settings: Settings) -> anyhow::Result<Self> {
        let pool = storage::init_db(&settings.database_url).await?;
        let store = PgStore::new(pool);
        let ledger = MarketLedger::new(store.clone(), store, settings.market.clone());

        let gateway = GatewayClient::new(&settings.gateway_url)?;
        let client_events = gateway.spawn_event_pump();
        let credentials = Credentials::load(&settings);
        let session = Session::new(gateway.clone(), gateway.clone(), credentials)
            .with_retry_base(Duration::from_secs(settings.login_retry_secs));

        let cursor_path = settings.poll_cursor_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join(".shop-runner")
                .join("poll-cursor.json")
        });
        let cursor = PollCursorFile::new(cursor_path);
        let resumed = cursor.read().await;
        let poller = GatewayOfferPoller::new(&settings.gateway_url, resumed)?;
        let reconciler = TradeOfferReconciler::new(poller.clone());
        let currency_feed = GatewayCurrencyFeed::new(&settings.gateway_url);

        Ok(Self {
            roster: ContactRoster::new(),
            settings,
            session,
            client_events,
            reconciler,
            poller,
            ledger,
            currency_feed,
            cursor,
            gateway,
        })
    }

    /// Run until the gateway event stream ends
    pub async fn run(self) -> anyhow::Result<()> {
        let ShopRunner {
            settings,
            mut session,
            mut client_events,
            mut reconciler,
            poller,
            mut ledger,
            mut roster,
            currency_feed,
            cursor,
            gateway,
        } = self;

        info!(account = %session.account(), "shop runner starting");
        ledger.load().await?;

        match gateway.fetch_contacts().await {
            Ok(contacts) => roster.seed(
                contacts
                    .into_iter()
                    .map(|c| Contact {
                        account: c.account,
                        since: c.since,
                    })
                    .collect(),
            ),
            Err(e) => warn!("wasn't able to fetch the contact roster: {e}"),
        }

        refresh_currency(&currency_feed, &mut ledger).await;
        session.login().await;

        let mut poll_interval = interval(Duration::from_millis(settings.poll_interval_ms));
        let mut escrow_interval = interval(Duration::from_secs(settings.escrow_refresh_secs));
        let mut currency_interval = interval(Duration::from_secs(settings.currency_refresh_secs));
        let mut drift_interval = interval(Duration::from_secs(settings.drift_repair_secs));
        let mut polling = false;

        loop {
            let retry_at = session.retry_deadline();
            tokio::select! {
                maybe_event = client_events.recv() => {
                    let Some(event) = maybe_event else {
                        error!("gateway event stream ended");
                        return Err(anyhow::anyhow!("gateway event stream ended"));
                    };
                    match event {
                        ClientEvent::Confirmation { offer_id, error } => {
                            reconciler
                                .handle_confirmation(ConfirmationEvent { offer_id, error })
                                .await;
                        }
                        ClientEvent::ContactRequest { account } => {
                            debug!(account = %account, "accepting contact request");
                            roster.add(&account);
                        }
                        ClientEvent::ContactRemoved { account } => {
                            roster.remove(&account);
                        }
                        ClientEvent::Message { account, text } => {
                            if text.is_empty() {
                                warn!(account = %account, "dropping empty message");
                            } else {
                                info!(account = %account, "message received: {text}");
                            }
                        }
                        session_event => {
                            if let Some(SessionNotice::LoggedIn(web)) =
                                session.handle_client_event(session_event).await
                            {
                                if let Err(e) = poller.set_web_session(&web).await {
                                    warn!("offer session setup failed: {e}");
                                } else if !polling {
                                    info!("trade-offer polling started");
                                    polling = true;
                                }
                            }
                        }
                    }
                }
                _ = poll_interval.tick(), if polling => {
                    poll_cycle(&poller, &mut reconciler, &mut ledger, &cursor).await;
                }
                _ = escrow_interval.tick(), if polling => {
                    if let Err(e) = reconciler.refresh_escrow().await {
                        warn!("escrow refresh failed: {e}");
                    } else {
                        let (to_give, to_receive) = reconciler.escrow().counted();
                        debug!(to_give, to_receive, "escrow snapshot refreshed");
                    }
                }
                _ = currency_interval.tick() => {
                    refresh_currency(&currency_feed, &mut ledger).await;
                }
                _ = drift_interval.tick(), if polling => {
                    drift_cycle(&gateway, &mut ledger).await;
                }
                _ = sleep_until_deadline(retry_at) => {
                    session.resume_login().await;
                }
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

async fn refresh_currency(feed: &GatewayCurrencyFeed, ledger: &mut MarketLedger<PgStore, PgStore>) {
    match feed.fetch().await {
        Ok(table) => {
            debug!(?table, "currency table refreshed");
            ledger.set_currency(table);
        }
        Err(e) => warn!("currency refresh failed: {e}"),
    }
}

/// One poll cycle: diff external offers against the last-seen cache,
/// dispatch the changes, react on the ledger, and persist the cursor.
async fn poll_cycle(
    poller: &GatewayOfferPoller,
    reconciler: &mut TradeOfferReconciler<GatewayOfferPoller>,
    ledger: &mut MarketLedger<PgStore, PgStore>,
    cursor: &PollCursorFile,
) {
    let events = match poller.poll_once().await {
        Ok(events) => events,
        Err(e) => {
            debug!("offer poll failed: {e}");
            return;
        }
    };
    if events.is_empty() {
        return;
    }
    for event in &events {
        reconciler.handle_offer_event(event);
        apply_offer_outcome(ledger, event).await;
    }
    let snapshot = {
        let state = poller.poll_state();
        let state = state.lock().expect("poll state poisoned");
        state.clone()
    };
    cursor.write(&snapshot).await;
}

/// Ledger reaction to offer-state changes: incoming marketed items that
/// arrive become available, failed transfers are cancelled.
async fn apply_offer_outcome(ledger: &mut MarketLedger<PgStore, PgStore>, event: &OfferEvent) {
    match event.offer.state {
        OfferState::Accepted => {
            let mut arrivals = Vec::new();
            for asset in &event.offer.items_to_receive {
                if let Some(item) = ledger.find_by_id(asset.item_id) {
                    if item.status == ItemStatus::InTransit {
                        arrivals.push((item.shop_id, item.item_id));
                    }
                }
            }
            for (shop_id, item_id) in arrivals {
                info!(item_id, "marketed item arrived, now available");
                ledger.set_as_available(shop_id, item_id).await;
            }
        }
        OfferState::Canceled
        | OfferState::Declined
        | OfferState::Expired
        | OfferState::InvalidItems
        | OfferState::CanceledBySecondFactor => {
            let cancelled: Vec<i64> = event
                .offer
                .items_to_receive
                .iter()
                .filter_map(|asset| {
                    ledger
                        .find_by_id(asset.item_id)
                        .filter(|item| item.status == ItemStatus::InTransit)
                        .map(|item| item.item_id)
                })
                .collect();
            if !cancelled.is_empty() {
                ledger.cancel_in_transit(&cancelled).await;
            }
        }
        _ => {}
    }
}

/// Fetch the current inventory, push the link snapshot into storage, and
/// repair whatever drifted.
async fn drift_cycle(gateway: &GatewayClient, ledger: &mut MarketLedger<PgStore, PgStore>) {
    let slots = match gateway.fetch_inventory().await {
        Ok(slots) => slots,
        Err(e) => {
            warn!("inventory fetch failed, skipping drift repair: {e}");
            return;
        }
    };
    let mut snapshot = InventorySnapshot::default();
    for slot in slots {
        snapshot.insert(
            slot.shop_id,
            SlotInfo {
                original_id: slot.original_id,
                minimum_price: Price::from_scrap(slot.minimum_price_scrap),
            },
        );
    }
    if let Err(e) = ledger.sync_inventory(&snapshot).await {
        error!("inventory link sync failed: {e}");
        return;
    }
    match ledger.reconcile_drift().await {
        Ok(report) => {
            if report != DriftReport::default() {
                info!(
                    relinked = report.relinked,
                    sold = report.sold,
                    withdrawn = report.withdrawn,
                    unresolved = report.unresolved,
                    failed = report.failed,
                    "drift repair pass finished"
                );
            }
        }
        Err(e) => error!("drift repair failed: {e}"),
    }
}
