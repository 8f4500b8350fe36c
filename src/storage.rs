//! Durable storage collaborators
//!
//! The ledger persists marketed items to Postgres and consults an item
//! ownership-history table during drift repair. Both surfaces are traits so
//! the ledger logic can run against in-memory doubles in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub type Db = PgPool;

pub async fn init_db(database_url: &str) -> anyhow::Result<Db> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Persisted form of a marketed item
#[derive(Debug, Clone, FromRow)]
pub struct MarketItemRow {
    pub shop_id: i64,
    pub item_id: i64,
    pub original_id: i64,
    pub owner: String,
    pub market_price: i32,
    pub taxed_price: i32,
    pub status: i16,
    pub last_update: DateTime<Utc>,
}

/// A ledger entry whose shop id no longer resolves in the inventory-link
/// table, with the replacement id when one exists for the same original id
#[derive(Debug, Clone, FromRow)]
pub struct StaleLink {
    pub shop_id: i64,
    pub item_id: i64,
    pub original_id: i64,
    pub owner: String,
    pub current_shop_id: Option<i64>,
}

/// One step in an item's ownership-transfer history
#[derive(Debug, Clone, FromRow)]
pub struct OwnershipRecord {
    pub owner: String,
    pub record_id: i64,
    pub at: DateTime<Utc>,
}

/// Durable store the market ledger writes through
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn ensure_schema(&self) -> anyhow::Result<()>;

    /// Load entries still relevant at startup (available or in transit)
    async fn load_active(&self) -> anyhow::Result<Vec<MarketItemRow>>;

    /// Insert-or-update a batch within one transaction
    async fn upsert_items(&self, rows: &[MarketItemRow]) -> anyhow::Result<()>;

    async fn update_status(&self, shop_id: i64, item_id: i64, status: i16) -> anyhow::Result<()>;

    async fn update_price(
        &self,
        shop_id: i64,
        market_price: i32,
        taxed_price: i32,
    ) -> anyhow::Result<()>;

    async fn update_shop_id(&self, old_shop_id: i64, new_shop_id: i64) -> anyhow::Result<()>;

    /// Mark in-transit items as cancelled, by item id
    async fn cancel_items(&self, item_ids: &[i64], status: i16) -> anyhow::Result<()>;

    /// Ledger entries whose shop id is absent from the inventory links
    async fn stale_links(&self) -> anyhow::Result<Vec<StaleLink>>;

    /// Replace the inventory-link snapshot (shop id -> original id)
    async fn sync_inventory_links(&self, links: &[(i64, i64)]) -> anyhow::Result<()>;

    /// Credit a marketer's wallet after a sale
    async fn credit_wallet(&self, owner: &str, amount_scrap: i64) -> anyhow::Result<()>;
}

/// Ownership-history collaborator consulted by drift repair
#[async_trait]
pub trait ItemHistorian: Send + Sync {
    /// Chronological ownership records for one original item identity
    async fn ownership_history(&self, original_id: i64) -> anyhow::Result<Vec<OwnershipRecord>>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: Db,
}

impl PgStore {
    pub fn new(pool: Db) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS marketed_items (
                shop_id     BIGINT NOT NULL,
                item_id     BIGINT NOT NULL,
                original_id BIGINT NOT NULL,
                owner       VARCHAR(32) NOT NULL,
                market_price INT NOT NULL,
                taxed_price  INT NOT NULL,
                status      SMALLINT NOT NULL,
                last_update TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (shop_id, item_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS marketed_items_owner ON marketed_items (owner)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS marketed_items_original ON marketed_items (original_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inventory_links (
                shop_id     BIGINT PRIMARY KEY,
                original_id BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_credits (
                id      UUID PRIMARY KEY,
                owner   VARCHAR(32) NOT NULL,
                amount  BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_active(&self) -> anyhow::Result<Vec<MarketItemRow>> {
        let rows = sqlx::query_as::<_, MarketItemRow>(
            r#"
            SELECT shop_id, item_id, original_id, owner, market_price, taxed_price,
                   status, last_update
            FROM marketed_items
            WHERE status = $1 OR status = $2
            "#,
        )
        .bind(1_i16) // available
        .bind(2_i16) // in transit
        .fetch_all(&self.pool)
        .await?;
        debug!(count = rows.len(), "loaded active marketed items");
        Ok(rows)
    }

    async fn upsert_items(&self, rows: &[MarketItemRow]) -> anyhow::Result<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO marketed_items
                    (shop_id, item_id, original_id, owner, market_price, taxed_price,
                     status, last_update)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (shop_id, item_id) DO UPDATE SET
                    market_price = EXCLUDED.market_price,
                    taxed_price = EXCLUDED.taxed_price,
                    status = EXCLUDED.status,
                    last_update = EXCLUDED.last_update
                "#,
            )
            .bind(row.shop_id)
            .bind(row.item_id)
            .bind(row.original_id)
            .bind(&row.owner)
            .bind(row.market_price)
            .bind(row.taxed_price)
            .bind(row.status)
            .bind(row.last_update)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_status(&self, shop_id: i64, item_id: i64, status: i16) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE marketed_items SET status = $1, last_update = $2 \
             WHERE shop_id = $3 AND item_id = $4",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(shop_id)
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_price(
        &self,
        shop_id: i64,
        market_price: i32,
        taxed_price: i32,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE marketed_items SET market_price = $1, taxed_price = $2, last_update = $3 \
             WHERE shop_id = $4",
        )
        .bind(market_price)
        .bind(taxed_price)
        .bind(Utc::now())
        .bind(shop_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_shop_id(&self, old_shop_id: i64, new_shop_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE marketed_items SET shop_id = $1 WHERE shop_id = $2")
            .bind(new_shop_id)
            .bind(old_shop_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancel_items(&self, item_ids: &[i64], status: i16) -> anyhow::Result<()> {
        if item_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE marketed_items SET status = $1 WHERE item_id = ANY($2)")
            .bind(status)
            .bind(item_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stale_links(&self) -> anyhow::Result<Vec<StaleLink>> {
        // Available items whose shop id no longer appears in the inventory
        // links; a current id for the same original identity rides along
        // when the inventory still knows the item under a new slot.
        let rows = sqlx::query_as::<_, StaleLink>(
            r#"
            SELECT m.shop_id, m.item_id, m.original_id, m.owner,
                   cur.shop_id AS current_shop_id
            FROM marketed_items m
            LEFT JOIN inventory_links stale ON stale.shop_id = m.shop_id
            LEFT JOIN inventory_links cur ON cur.original_id = m.original_id
            WHERE m.status = $1 AND stale.shop_id IS NULL
            ORDER BY m.last_update
            "#,
        )
        .bind(1_i16) // available
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn sync_inventory_links(&self, links: &[(i64, i64)]) -> anyhow::Result<()> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;
        sqlx::query("DELETE FROM inventory_links")
            .execute(&mut *tx)
            .await?;
        for (shop_id, original_id) in links {
            sqlx::query("INSERT INTO inventory_links (shop_id, original_id) VALUES ($1, $2)")
                .bind(shop_id)
                .bind(original_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn credit_wallet(&self, owner: &str, amount_scrap: i64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO wallet_credits (id, owner, amount, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(owner)
        .bind(amount_scrap)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ItemHistorian for PgStore {
    async fn ownership_history(&self, original_id: i64) -> anyhow::Result<Vec<OwnershipRecord>> {
        let rows = sqlx::query_as::<_, OwnershipRecord>(
            "SELECT owner, record_id, at FROM item_ownership \
             WHERE original_id = $1 ORDER BY at",
        )
        .bind(original_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
