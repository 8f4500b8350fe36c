//! Price and currency conversion
//!
//! Prices are denominated in scrap, the smallest native unit of the item
//! economy (9 scrap = 1 refined metal). The conversion table is an
//! explicitly constructed value passed to price-dependent components and
//! refreshed by the runner on a schedule; nothing here is global state.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub const SCRAP_PER_METAL: i64 = 9;

/// Exchange rates for the item economy's currencies
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CurrencyTable {
    /// USD value of one refined metal
    pub usd_per_metal: Decimal,
    /// Refined metal value of one key
    pub metal_per_key: Decimal,
}

impl CurrencyTable {
    pub fn new(usd_per_metal: Decimal, metal_per_key: Decimal) -> Self {
        Self {
            usd_per_metal,
            metal_per_key,
        }
    }

    fn scrap_per_key(&self) -> Decimal {
        self.metal_per_key * Decimal::from(SCRAP_PER_METAL)
    }
}

impl Default for CurrencyTable {
    fn default() -> Self {
        // Conservative bootstrap rates, replaced on the first feed refresh
        Self {
            usd_per_metal: Decimal::new(5, 2),
            metal_per_key: Decimal::from(50),
        }
    }
}

/// Source of fresh currency rates (web API collaborator)
#[async_trait]
pub trait CurrencyFeed: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<CurrencyTable>;
}

/// Currency rates served by the local protocol gateway
pub struct GatewayCurrencyFeed {
    http: reqwest::Client,
    base_url: String,
}

impl GatewayCurrencyFeed {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CurrencyFeed for GatewayCurrencyFeed {
    async fn fetch(&self) -> anyhow::Result<CurrencyTable> {
        let response = self
            .http
            .get(format!("{}/currency", self.base_url))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json::<CurrencyTable>().await?)
        } else {
            anyhow::bail!("currency fetch failed: {}", response.status());
        }
    }
}

/// An item price in scrap units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(pub i64);

impl Price {
    pub fn from_scrap(scrap: i64) -> Self {
        Price(scrap)
    }

    pub fn from_keys(keys: Decimal, table: &CurrencyTable) -> Self {
        let scrap = keys * table.metal_per_key * Decimal::from(SCRAP_PER_METAL);
        Price(scrap.round().to_i64().unwrap_or(0))
    }

    pub fn to_scrap(&self) -> i64 {
        self.0
    }

    pub fn to_metal(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(SCRAP_PER_METAL)
    }

    pub fn to_keys(&self, table: &CurrencyTable) -> Decimal {
        let per_key = table.scrap_per_key();
        if per_key.is_zero() {
            return Decimal::ZERO;
        }
        (Decimal::from(self.0) / per_key).round_dp(2)
    }

    pub fn to_usd(&self, table: &CurrencyTable) -> Decimal {
        self.to_metal() * table.usd_per_metal
    }
}

/// Compute the seller-side price after the shop's market cut.
///
/// Mirrors the shop's historical rounding: scale by (1 - ratio) and round
/// half-up in scrap units.
pub fn taxed_price(market_price: Price, market_ratio: Decimal) -> Price {
    let scaled = Decimal::from(market_price.to_scrap()) * (Decimal::ONE - market_ratio)
        + Decimal::new(5, 1);
    Price(scaled.floor().to_i64().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_scrap_metal_key_conversions() {
        let table = CurrencyTable::new(Decimal::new(5, 2), Decimal::from(50));
        let price = Price::from_scrap(900);

        assert_eq!(price.to_metal(), Decimal::from(100));
        assert_eq!(price.to_keys(&table), Decimal::from(2));

        let two_keys = Price::from_keys(Decimal::from(2), &table);
        assert_eq!(two_keys.to_scrap(), 900);
    }

    #[test]
    fn test_taxed_price_rounds_half_up() {
        // 100 scrap at a 5% cut: 95.5 rounds to 95
        let taxed = taxed_price(Price::from_scrap(100), Decimal::new(5, 2));
        assert_eq!(taxed.to_scrap(), 95);

        // 10 scrap at a 5% cut: 9.5 + 0.5 = 10
        let taxed = taxed_price(Price::from_scrap(10), Decimal::new(5, 2));
        assert_eq!(taxed.to_scrap(), 10);
    }
}
