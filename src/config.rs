//! Runner configuration
//!
//! Settings are layered: an optional `shop-runner.toml` file, overridden by
//! `SHOP_RUNNER_*` environment variables. Account credentials carry the
//! persisted machine-auth (sentry) material alongside the password-based
//! secrets.

use anyhow::Context;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::types::AccountId;

fn default_gateway_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_500
}

fn default_login_retry_secs() -> u64 {
    15
}

fn default_escrow_refresh_secs() -> u64 {
    300
}

fn default_currency_refresh_secs() -> u64 {
    1_800
}

fn default_drift_repair_secs() -> u64 {
    3_600
}

fn default_items_limit() -> usize {
    12
}

fn default_max_key_price() -> Decimal {
    Decimal::from(30)
}

fn default_market_ratio() -> Decimal {
    // 5% shop cut on marketed items
    Decimal::new(5, 2)
}

/// Top-level settings for one runner process
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Local protocol gateway base URL
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Postgres connection string
    pub database_url: String,

    /// Account this runner operates
    pub account: AccountSettings,

    /// Where the poll-resume cursor is persisted
    #[serde(default)]
    pub poll_cursor_path: Option<PathBuf>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_login_retry_secs")]
    pub login_retry_secs: u64,

    #[serde(default = "default_escrow_refresh_secs")]
    pub escrow_refresh_secs: u64,

    #[serde(default = "default_currency_refresh_secs")]
    pub currency_refresh_secs: u64,

    #[serde(default = "default_drift_repair_secs")]
    pub drift_repair_secs: u64,

    #[serde(default)]
    pub market: MarketSettings,
}

/// Market/ledger tunables
#[derive(Debug, Clone, Deserialize)]
pub struct MarketSettings {
    /// Max items one user may have marketed at a time
    #[serde(default = "default_items_limit")]
    pub items_limit: usize,

    /// Cap on a single item's market price, in keys
    #[serde(default = "default_max_key_price")]
    pub max_key_price: Decimal,

    /// Shop cut applied to marketed items
    #[serde(default = "default_market_ratio")]
    pub market_ratio: Decimal,

    /// Operator-controlled transit accounts, recognized during the
    /// drift-repair ownership walk
    #[serde(default)]
    pub bot_ids: HashSet<AccountId>,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            items_limit: default_items_limit(),
            max_key_price: default_max_key_price(),
            market_ratio: default_market_ratio(),
            bot_ids: HashSet::new(),
        }
    }
}

/// Credential material for the operated account
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSettings {
    pub id: AccountId,
    pub username: String,
    pub password: String,

    /// Machine-auth sentry file; created/updated on server push
    #[serde(default)]
    pub sentry_path: Option<PathBuf>,

    /// One-shot guard code, used only until a sentry file exists
    #[serde(default)]
    pub guard_code: Option<String>,

    /// Mobile two-factor code provider value; attached to every logon when
    /// configured
    #[serde(default)]
    pub two_factor_code: Option<String>,
}

impl Settings {
    /// Load from `shop-runner.toml` (optional) overlaid with
    /// `SHOP_RUNNER_*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("shop-runner").required(false))
            .add_source(
                config::Environment::with_prefix("SHOP_RUNNER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble configuration")?;

        let settings: Settings = settings
            .try_deserialize()
            .context("invalid configuration")?;
        info!(
            account = %settings.account.id,
            gateway = %settings.gateway_url,
            "configuration loaded"
        );
        Ok(settings)
    }

    pub fn default_sentry_path(&self) -> PathBuf {
        self.account.sentry_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".shop-runner")
                .join(format!("{}.sentry", self.account.id))
        })
    }
}

/// Runtime credential state, including the loaded sentry hash
#[derive(Debug, Clone)]
pub struct Credentials {
    pub account: AccountId,
    pub username: String,
    pub password: String,
    sentry_path: PathBuf,
    sentry_sha: Option<Vec<u8>>,
    guard_code: Option<String>,
    two_factor_code: Option<String>,
}

impl Credentials {
    /// Build from settings, hashing the sentry file if one exists on disk
    pub fn load(settings: &Settings) -> Self {
        let sentry_path = settings.default_sentry_path();
        let sentry_sha = match std::fs::read(&sentry_path) {
            Ok(bytes) => {
                debug!(path = %sentry_path.display(), "sentry file loaded");
                Some(Sha256::digest(&bytes).to_vec())
            }
            Err(_) => None,
        };
        Self {
            account: settings.account.id.clone(),
            username: settings.account.username.clone(),
            password: settings.account.password.clone(),
            sentry_path,
            sentry_sha,
            guard_code: settings.account.guard_code.clone(),
            two_factor_code: settings.account.two_factor_code.clone(),
        }
    }

    pub fn sentry_sha(&self) -> Option<&[u8]> {
        self.sentry_sha.as_deref()
    }

    pub fn guard_code(&self) -> Option<&str> {
        self.guard_code.as_deref()
    }

    pub fn two_factor_code(&self) -> Option<&str> {
        self.two_factor_code.as_deref()
    }

    /// Persist a server-pushed sentry payload and refresh the cached hash.
    /// Returns the new hash for the acknowledgement.
    pub fn save_sentry(&mut self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        if let Some(parent) = self.sentry_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&self.sentry_path, payload)
            .with_context(|| format!("writing {}", self.sentry_path.display()))?;
        let sha = Sha256::digest(payload).to_vec();
        self.sentry_sha = Some(sha.clone());
        info!(path = %self.sentry_path.display(), "sentry file updated");
        Ok(sha)
    }

    #[cfg(test)]
    pub fn for_tests(account: &str) -> Self {
        Self {
            account: account.to_string(),
            username: format!("{account}-user"),
            password: "secret".to_string(),
            sentry_path: std::env::temp_dir().join(format!("{account}.sentry")),
            sentry_sha: None,
            guard_code: None,
            two_factor_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_sentry_updates_hash() {
        let dir = tempdir().unwrap();
        let mut creds = Credentials::for_tests("bot-a");
        creds.sentry_path = dir.path().join("bot-a.sentry");

        assert!(creds.sentry_sha().is_none());
        let sha = creds.save_sentry(b"machine-auth-material").unwrap();
        assert_eq!(creds.sentry_sha().unwrap(), sha.as_slice());
        assert_eq!(sha.len(), 32);
        assert!(creds.sentry_path.exists());
    }
}
