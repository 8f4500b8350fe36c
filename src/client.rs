//! Network client collaborator
//!
//! The wire protocol for the gaming network lives in a separate local
//! gateway process; this module defines the contract the session machine
//! needs from it and the HTTP implementation that drives the gateway.

use async_trait::async_trait;
use anyhow::{anyhow, Context};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::types::ClientEvent;

/// Timeout for gateway control requests
const GATEWAY_TIMEOUT_SECS: u64 = 30;

/// Capacity of the client event channel
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Logon request assembled by the session machine
#[derive(Debug, Clone, Serialize)]
pub struct LogonRequest {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentry_sha: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub two_factor_code: Option<String>,
}

/// Result of the secondary web-session authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSession {
    pub session_id: String,
    pub cookies: Vec<String>,
}

/// Transport control surface of the external network client
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn connect(&self) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn log_on(&self, request: LogonRequest) -> anyhow::Result<()>;
    /// Acknowledge persisted machine-auth material with its hash
    async fn ack_machine_auth(&self, sentry_sha: Vec<u8>) -> anyhow::Result<()>;
    fn is_connected(&self) -> bool;
}

/// Secondary web-session authentication collaborator
#[async_trait]
pub trait WebSessionBridge: Send + Sync {
    async fn web_log_on(&self) -> anyhow::Result<WebSession>;
}

/// A contact as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct ContactDto {
    pub account: String,
    pub since: chrono::DateTime<chrono::Utc>,
}

/// One inventory slot as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct InventorySlotDto {
    pub shop_id: i64,
    pub original_id: i64,
    pub minimum_price_scrap: i64,
}

/// HTTP client for the local protocol gateway. Clones share the connected
/// flag, so the session machine and the runner observe the same transport
/// state.
#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    base_url: String,
    connected: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl GatewayClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(GATEWAY_TIMEOUT_SECS))
            .build()
            .context("building gateway HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            connected: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_empty(&self, path: &str) -> anyhow::Result<()> {
        let response = self.http.post(self.url(path)).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow!("{path} failed: {status} - {text}"))
        }
    }

    /// Current contact roster known to the gateway
    pub async fn fetch_contacts(&self) -> anyhow::Result<Vec<ContactDto>> {
        let response = self.http.get(self.url("/contacts")).send().await?;
        if response.status().is_success() {
            Ok(response.json::<Vec<ContactDto>>().await?)
        } else {
            Err(anyhow!("contacts fetch failed: {}", response.status()))
        }
    }

    /// Current inventory snapshot (shop slots with identity and price floor)
    pub async fn fetch_inventory(&self) -> anyhow::Result<Vec<InventorySlotDto>> {
        let response = self.http.get(self.url("/inventory")).send().await?;
        if response.status().is_success() {
            Ok(response.json::<Vec<InventorySlotDto>>().await?)
        } else {
            Err(anyhow!("inventory fetch failed: {}", response.status()))
        }
    }

    /// Spawn the event pump: long-polls the gateway's event feed and
    /// forwards each event into the returned channel. The pump ends when
    /// the receiver is dropped.
    pub fn spawn_event_pump(&self) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let http = self.http.clone();
        let url = self.url("/events");
        tokio::spawn(async move {
            loop {
                let batch = match http.get(&url).send().await {
                    Ok(response) if response.status().is_success() => {
                        response.json::<Vec<ClientEvent>>().await
                    }
                    Ok(response) => {
                        warn!(status = %response.status(), "gateway event poll rejected");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    Err(e) => {
                        debug!("gateway event poll error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                match batch {
                    Ok(events) => {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                info!("client event receiver dropped, stopping pump");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error!("undecodable gateway event batch: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        rx
    }
}

#[async_trait]
impl NetworkClient for GatewayClient {
    async fn connect(&self) -> anyhow::Result<()> {
        self.post_empty("/connect").await?;
        self.connected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.post_empty("/disconnect").await
    }

    async fn log_on(&self, request: LogonRequest) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.url("/logon"))
            .json(&request)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            Err(anyhow!("logon dispatch failed: {status}"))
        }
    }

    async fn ack_machine_auth(&self, sentry_sha: Vec<u8>) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct Ack {
            sentry_sha: Vec<u8>,
        }
        let response = self
            .http
            .post(self.url("/machine-auth/ack"))
            .json(&Ack { sentry_sha })
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow!("machine-auth ack failed: {}", response.status()))
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl WebSessionBridge for GatewayClient {
    async fn web_log_on(&self) -> anyhow::Result<WebSession> {
        let response = self.http.post(self.url("/web-logon")).send().await?;
        if response.status().is_success() {
            Ok(response.json::<WebSession>().await?)
        } else {
            Err(anyhow!("web logon failed: {}", response.status()))
        }
    }
}
