//! Shop Runner Library
//!
//! Trading agent that operates an automated item shop against a
//! third-party gaming network: session lifecycle, trade-offer
//! reconciliation, and the persisted market ledger.

pub mod changelog;
pub mod client;
pub mod config;
pub mod contacts;
pub mod handlers;
pub mod ledger;
pub mod poller;
pub mod pricing;
pub mod reconciler;
pub mod runner;
pub mod session;
pub mod storage;
pub mod types;

// Re-export main types for convenience
pub use changelog::{ChangeCommit, ChangeLog};
pub use config::{Credentials, MarketSettings, Settings};
pub use handlers::{Disposition, ExpiringHandlerRegistry, HANDLER_TTL};
pub use ledger::{
    DriftReport, ImportItem, InventorySnapshot, InventoryView, ItemStatus, MarketItem,
    MarketLedger, SlotInfo,
};
pub use poller::{GatewayOfferPoller, OfferFilter, OfferPoller, PollCursorFile, PollState};
pub use pricing::{taxed_price, CurrencyFeed, CurrencyTable, Price};
pub use reconciler::{EscrowSnapshot, TradeOfferReconciler};
pub use runner::ShopRunner;
pub use session::{retry_interval, Phase, Session, SessionNotice};
pub use storage::{ItemHistorian, LedgerStore, MarketItemRow, OwnershipRecord, PgStore, StaleLink};
pub use types::{
    ClientEvent, ConfirmationEvent, LogonOutcome, MarketError, MarketResult, OfferDirection,
    OfferEvent, OfferId, OfferState, TradeOffer,
};
