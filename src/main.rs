//! Shop Runner - automated marketplace trading agent
//!
//! 1. Keeps an authenticated session to the gaming network alive
//! 2. Polls and reconciles trade-offer state
//! 3. Maintains the persisted market ledger and repairs id drift
//! 4. Tracks contacts and confirmation outcomes

use tracing::info;

use shop_runner::config::Settings;
use shop_runner::runner::ShopRunner;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("starting shop runner...");

    let settings = Settings::load()?;
    let runner = ShopRunner::build(settings).await?;
    runner.run().await
}
