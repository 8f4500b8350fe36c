//! Core types shared across the runner
//!
//! These types define the contract between shop-runner and the local
//! protocol gateway, plus the domain error surface returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade-offer identifier assigned by the external trade system
pub type OfferId = u64;

/// External inventory slot id for an item (mutable across reshuffles)
pub type ShopId = i64;

/// Identifier of the concrete item instance
pub type ItemId = i64;

/// Cross-transfer-stable item identity; NOT guaranteed unique
pub type OriginalId = i64;

/// Remote account identity (bot or counterparty)
pub type AccountId = String;

/// Trade offer state as reported by the external trade system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    Active,
    Accepted,
    Countered,
    Expired,
    Canceled,
    Declined,
    InvalidItems,
    NeedsConfirmation,
    CanceledBySecondFactor,
    InEscrow,
}

impl OfferState {
    /// Numeric code used by the external system and the poll-cursor file
    pub fn as_code(&self) -> i16 {
        match self {
            OfferState::Active => 2,
            OfferState::Accepted => 3,
            OfferState::Countered => 4,
            OfferState::Expired => 5,
            OfferState::Canceled => 6,
            OfferState::Declined => 7,
            OfferState::InvalidItems => 8,
            OfferState::NeedsConfirmation => 9,
            OfferState::CanceledBySecondFactor => 10,
            OfferState::InEscrow => 11,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            2 => OfferState::Active,
            3 => OfferState::Accepted,
            4 => OfferState::Countered,
            5 => OfferState::Expired,
            6 => OfferState::Canceled,
            7 => OfferState::Declined,
            8 => OfferState::InvalidItems,
            9 => OfferState::NeedsConfirmation,
            10 => OfferState::CanceledBySecondFactor,
            11 => OfferState::InEscrow,
            _ => return None,
        })
    }
}

/// Item asset as carried inside a trade offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferAsset {
    pub item_id: ItemId,
    pub original_id: OriginalId,
    /// Display name, informational only
    #[serde(default)]
    pub name: Option<String>,
}

/// A trade offer as reported by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOffer {
    pub id: OfferId,
    pub partner: AccountId,
    pub state: OfferState,
    #[serde(default)]
    pub items_to_give: Vec<OfferAsset>,
    #[serde(default)]
    pub items_to_receive: Vec<OfferAsset>,
    pub updated_at: DateTime<Utc>,
}

/// Which side of the poll cache an offer lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferDirection {
    Sent,
    Received,
}

impl OfferDirection {
    pub const BOTH: [OfferDirection; 2] = [OfferDirection::Sent, OfferDirection::Received];
}

/// Offer change as emitted by the poller or synthesized by the bypass path
#[derive(Debug, Clone)]
pub struct OfferEvent {
    pub direction: OfferDirection,
    pub offer: TradeOffer,
    /// State the offer had before this change, when known
    pub old_state: Option<OfferState>,
}

/// Outcome of a mobile trade confirmation attempt
#[derive(Debug, Clone)]
pub struct ConfirmationEvent {
    pub offer_id: OfferId,
    pub error: Option<String>,
}

/// Result codes for a logon attempt, decoded from the remote response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogonOutcome {
    Ok,
    /// Remote wants a guard code we did not supply
    Denied,
    InvalidAuthCode,
    TwoFactorMismatch,
    Other(i32),
}

/// Push events delivered by the network client.
///
/// The gateway tags each event with a `type` field; keeping these as one
/// closed enum means an unknown event is a deserialization error instead of
/// a silently dropped string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Connected,
    TransportError { message: String },
    LoggedOff,
    LogOnResponse { outcome: LogonOutcome },
    /// Server pushed new machine-auth (sentry) material to persist
    MachineAuth { payload: Vec<u8> },
    Confirmation { offer_id: OfferId, error: Option<String> },
    ContactRequest { account: AccountId },
    ContactRemoved { account: AccountId },
    Message { account: AccountId, text: String },
}

/// Errors surfaced to immediate callers of the market API
#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("item not found")]
    ItemNotFound,

    #[error("requester is not the marketer of this item")]
    NotMarketer,

    #[error("market price below the item minimum")]
    PriceTooLow,

    #[error("market price above the key-price cap")]
    PriceTooHigh,

    #[error("price edit on cooldown, {remaining_secs}s remaining")]
    EditCooldown { remaining_secs: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("ledger data inconsistency: {0}")]
    Inconsistency(String),
}

/// Result type for market operations
pub type MarketResult<T> = std::result::Result<T, MarketError>;
