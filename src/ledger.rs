//! Market ledger
//!
//! In-memory plus persisted record of items marketed for sale. Identity is
//! tracked across two id spaces: the external inventory slot id (shop id,
//! which can go stale when the inventory reshuffles) and the item instance
//! id, with the cross-transfer-stable original id as a non-unique fallback
//! matching key. Memory is the freshness authority: mutations land in
//! memory first and durable writes are fire-and-log, with the periodic
//! drift repair as the safety net for divergence.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::changelog::ChangeLog;
use crate::config::MarketSettings;
use crate::pricing::{taxed_price, CurrencyTable, Price};
use crate::storage::{ItemHistorian, LedgerStore, MarketItemRow, StaleLink};
use crate::types::{AccountId, ItemId, MarketError, MarketResult, OriginalId, ShopId};

/// Minimum wait between price edits on the same item
pub const EDIT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Retained history steps in the shop-visibility change log
const CHANGE_LOG_SIZE: usize = 100;

/// Lifecycle of a marketed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    /// Sold through the shop
    Sold,
    /// Available in the shop
    Available,
    /// Being transferred from the user to the shop
    InTransit,
    /// User cancelled while marketing
    Cancelled,
    /// Withdrawn from the shop by its marketer
    Withdrawn,
}

impl ItemStatus {
    pub fn as_code(&self) -> i16 {
        match self {
            ItemStatus::Sold => 0,
            ItemStatus::Available => 1,
            ItemStatus::InTransit => 2,
            ItemStatus::Cancelled => 3,
            ItemStatus::Withdrawn => 4,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Some(match code {
            0 => ItemStatus::Sold,
            1 => ItemStatus::Available,
            2 => ItemStatus::InTransit,
            3 => ItemStatus::Cancelled,
            4 => ItemStatus::Withdrawn,
            _ => return None,
        })
    }
}

/// One marketed item
#[derive(Debug, Clone)]
pub struct MarketItem {
    pub shop_id: ShopId,
    pub item_id: ItemId,
    pub original_id: OriginalId,
    pub owner: AccountId,
    pub market_price: Price,
    pub taxed_price: Price,
    pub status: ItemStatus,
    pub last_update: DateTime<Utc>,
    last_price_edit: Option<Instant>,
}

impl MarketItem {
    fn from_row(row: &MarketItemRow) -> Option<Self> {
        let status = match ItemStatus::from_code(row.status) {
            Some(status) => status,
            None => {
                error!(
                    shop_id = row.shop_id,
                    code = row.status,
                    "unknown item status in storage, skipping record"
                );
                return None;
            }
        };
        Some(Self {
            shop_id: row.shop_id,
            item_id: row.item_id,
            original_id: row.original_id,
            owner: row.owner.clone(),
            market_price: Price::from_scrap(row.market_price as i64),
            taxed_price: Price::from_scrap(row.taxed_price as i64),
            status,
            last_update: row.last_update,
            last_price_edit: None,
        })
    }

    fn to_row(&self) -> MarketItemRow {
        MarketItemRow {
            shop_id: self.shop_id,
            item_id: self.item_id,
            original_id: self.original_id,
            owner: self.owner.clone(),
            market_price: self.market_price.to_scrap() as i32,
            taxed_price: self.taxed_price.to_scrap() as i32,
            status: self.status.as_code(),
            last_update: self.last_update,
        }
    }

    /// Remaining price-edit cooldown, if still armed
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let last = self.last_price_edit?;
        let elapsed = last.elapsed();
        if elapsed > EDIT_COOLDOWN {
            None
        } else {
            Some(EDIT_COOLDOWN - elapsed)
        }
    }
}

/// Asset handed to the ledger when a marketing trade completes
#[derive(Debug, Clone)]
pub struct ImportItem {
    pub shop_id: ShopId,
    pub item_id: ItemId,
    pub original_id: OriginalId,
    pub owner: AccountId,
    pub market_price: Price,
}

/// Read-only view of the current external inventory snapshot
pub trait InventoryView {
    fn contains_shop_id(&self, shop_id: ShopId) -> bool;
    /// Floor for a marketed price in this slot, in scrap
    fn minimum_price(&self, shop_id: ShopId) -> Option<Price>;
}

/// Concrete snapshot assembled by the runner from gateway inventory data
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    slots: HashMap<ShopId, SlotInfo>,
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub original_id: OriginalId,
    pub minimum_price: Price,
}

impl InventorySnapshot {
    pub fn insert(&mut self, shop_id: ShopId, info: SlotInfo) {
        self.slots.insert(shop_id, info);
    }

    /// (shop id, original id) pairs for the stale-link join
    pub fn links(&self) -> Vec<(ShopId, OriginalId)> {
        self.slots
            .iter()
            .map(|(shop_id, info)| (*shop_id, info.original_id))
            .collect()
    }
}

impl InventoryView for InventorySnapshot {
    fn contains_shop_id(&self, shop_id: ShopId) -> bool {
        self.slots.contains_key(&shop_id)
    }

    fn minimum_price(&self, shop_id: ShopId) -> Option<Price> {
        self.slots.get(&shop_id).map(|info| info.minimum_price)
    }
}

/// Outcome of one drift-repair pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriftReport {
    pub relinked: usize,
    pub sold: usize,
    pub withdrawn: usize,
    pub unresolved: usize,
    pub failed: usize,
}

enum StaleResolution {
    Sold,
    Withdrawn,
    /// History never left the bot transit; nothing to conclude yet
    Unresolved,
}

/// The ledger proper
pub struct MarketLedger<S, H> {
    store: S,
    historian: H,
    settings: MarketSettings,
    currency: CurrencyTable,
    items: Vec<MarketItem>,
    changes: ChangeLog<ShopId>,
}

impl<S: LedgerStore, H: ItemHistorian> MarketLedger<S, H> {
    pub fn new(store: S, historian: H, settings: MarketSettings) -> Self {
        Self {
            store,
            historian,
            settings,
            currency: CurrencyTable::default(),
            items: Vec::new(),
            changes: ChangeLog::new(CHANGE_LOG_SIZE, "market"),
        }
    }

    /// Shop-visibility deltas for sync consumers ("everything since my
    /// last sync point")
    pub fn changes(&self) -> &ChangeLog<ShopId> {
        &self.changes
    }

    /// Ensure the schema exists and load still-relevant records
    pub async fn load(&mut self) -> anyhow::Result<()> {
        self.store.ensure_schema().await?;
        let rows = self.store.load_active().await?;
        self.items = rows.iter().filter_map(MarketItem::from_row).collect();
        info!(count = self.items.len(), "market ledger loaded");
        Ok(())
    }

    pub fn set_currency(&mut self, table: CurrencyTable) {
        self.currency = table;
    }

    pub fn items(&self) -> &[MarketItem] {
        &self.items
    }

    pub fn marketer_exists(&self, owner: &str) -> bool {
        self.items.iter().any(|item| item.owner == owner)
    }

    /// Whether `owner` is below the per-user marketed-items limit
    pub fn can_market_more(&self, owner: &str) -> bool {
        let count = self
            .items
            .iter()
            .filter(|item| {
                item.owner == owner
                    && matches!(item.status, ItemStatus::Available | ItemStatus::InTransit)
            })
            .count();
        count < self.settings.items_limit
    }

    /// Look up by raw id: the unique item id first, the shop id as backup
    /// (shop ids are not guaranteed unique after drift).
    pub fn find_by_id(&self, id: i64) -> Option<&MarketItem> {
        self.items
            .iter()
            .find(|item| item.item_id == id)
            .or_else(|| self.items.iter().find(|item| item.shop_id == id))
    }

    /// Look up by an item-bearing key: the shop id first; on miss, fall
    /// back to the original id, which is not unique — among candidates,
    /// prefer one whose shop id also matches, else the most recently
    /// updated.
    pub fn find_for_item(&self, shop_id: ShopId, original_id: OriginalId) -> Option<&MarketItem> {
        if let Some(item) = self.items.iter().find(|item| item.shop_id == shop_id) {
            return Some(item);
        }
        let mut candidates: Vec<&MarketItem> = Vec::new();
        for item in &self.items {
            if item.original_id == original_id {
                if item.shop_id == shop_id {
                    return Some(item);
                }
                warn!(
                    original_id,
                    shop_id = item.shop_id,
                    "shop id didn't match but original id did, using fallback match"
                );
                candidates.push(item);
            }
        }
        candidates.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        candidates.first().copied()
    }

    /// Bulk insert/upsert a completed marketing batch. The whole batch
    /// becomes visible to readers at once: memory is updated in one
    /// non-suspending span before the durable write.
    pub async fn import_items(&mut self, assets: Vec<ImportItem>, status: Option<ItemStatus>) {
        if assets.is_empty() {
            return;
        }
        let status = status.unwrap_or(ItemStatus::Available);
        debug!(
            count = assets.len(),
            owner = %assets[0].owner,
            "importing assets to market"
        );
        let now = Utc::now();
        let mut rows = Vec::with_capacity(assets.len());
        for asset in &assets {
            let item = MarketItem {
                shop_id: asset.shop_id,
                item_id: asset.item_id,
                original_id: asset.original_id,
                owner: asset.owner.clone(),
                market_price: asset.market_price,
                taxed_price: taxed_price(asset.market_price, self.settings.market_ratio),
                status,
                last_update: now,
                last_price_edit: None,
            };
            rows.push(item.to_row());
            match self
                .items
                .iter()
                .position(|i| i.shop_id == item.shop_id && i.item_id == item.item_id)
            {
                Some(existing) => self.items[existing] = item,
                None => self.items.push(item),
            }
        }
        if status == ItemStatus::Available {
            // In-transit imports only become visible on arrival
            self.changes
                .add(assets.iter().map(|a| a.shop_id).collect(), vec![], None);
        }
        if let Err(e) = self.store.upsert_items(&rows).await {
            error!("market import persist failed: {e}");
        }
    }

    /// Update a record's status: memory first, then a logged best-effort
    /// durable write. A missing in-memory record is an error log, not a
    /// failure — the store may still know the row.
    pub async fn set_status(&mut self, shop_id: ShopId, item_id: ItemId, status: ItemStatus) {
        match self
            .items
            .iter_mut()
            .find(|item| item.shop_id == shop_id && item.item_id == item_id)
        {
            Some(item) => {
                debug!(shop_id, item_id, ?status, "item status updated");
                let old_status = item.status;
                item.status = status;
                item.last_update = Utc::now();
                if status == ItemStatus::Available && old_status != ItemStatus::Available {
                    self.changes.add(vec![shop_id], vec![], None);
                } else if status != ItemStatus::Available && old_status == ItemStatus::Available {
                    self.changes.add(vec![], vec![shop_id], None);
                }
            }
            None => {
                error!(shop_id, item_id, "no in-memory item to update status on");
            }
        }
        if let Err(e) = self
            .store
            .update_status(shop_id, item_id, status.as_code())
            .await
        {
            error!(shop_id, item_id, "status persist failed: {e}");
        }
    }

    /// Mark as sold and credit the marketer's wallet with the taxed price.
    /// Requires the item to currently be available.
    pub async fn set_as_sold(&mut self, shop_id: ShopId, item_id: ItemId) {
        let (owner, credit) = match self
            .items
            .iter()
            .find(|item| item.shop_id == shop_id && item.item_id == item_id)
        {
            Some(item) if item.status == ItemStatus::Available => {
                (item.owner.clone(), item.taxed_price.to_scrap())
            }
            Some(item) => {
                error!(
                    shop_id,
                    status = ?item.status,
                    "trying to set item as sold but it is not available"
                );
                return;
            }
            None => {
                error!(shop_id, item_id, "no in-memory item to mark as sold");
                return;
            }
        };
        self.set_status(shop_id, item_id, ItemStatus::Sold).await;
        if let Err(e) = self.store.credit_wallet(&owner, credit).await {
            error!(owner = %owner, "wallet credit persist failed: {e}");
        }
    }

    pub async fn set_as_withdrawn(&mut self, shop_id: ShopId, item_id: ItemId) {
        self.set_status(shop_id, item_id, ItemStatus::Withdrawn).await;
    }

    pub async fn set_as_available(&mut self, shop_id: ShopId, item_id: ItemId) {
        self.set_status(shop_id, item_id, ItemStatus::Available).await;
    }

    /// Drop in-transit records whose marketing trade fell through
    pub async fn cancel_in_transit(&mut self, item_ids: &[ItemId]) {
        debug!(count = item_ids.len(), "cancelling in-transit items");
        for item_id in item_ids {
            if let Some(pos) = self.items.iter().position(|item| item.item_id == *item_id) {
                if self.items[pos].status != ItemStatus::InTransit {
                    error!(item_id, "item to cancel is not marked as in transit");
                } else {
                    self.items.remove(pos);
                }
            }
        }
        if item_ids.is_empty() {
            return;
        }
        if let Err(e) = self
            .store
            .cancel_items(item_ids, ItemStatus::Cancelled.as_code())
            .await
        {
            error!("cancel persist failed: {e}");
        }
    }

    /// Market prices for a set of item ids, for trade assembly
    pub fn trade_prices(&self, item_ids: &[ItemId]) -> HashMap<ItemId, Price> {
        let mut prices = HashMap::new();
        for item_id in item_ids {
            if let Some(item) = self.items.iter().find(|item| item.item_id == *item_id) {
                prices.insert(*item_id, item.market_price);
            }
        }
        prices
    }

    /// Change an item's market price. Validation failures come back as
    /// typed rejections for the caller; a success recomputes the taxed
    /// price, persists, and arms the per-item cooldown.
    pub async fn edit_price<I: InventoryView>(
        &mut self,
        shop_id: ShopId,
        new_price: Price,
        requester: &str,
        inventory: &I,
    ) -> MarketResult<()> {
        let idx = self
            .items
            .iter()
            .position(|item| item.shop_id == shop_id)
            .ok_or(MarketError::ItemNotFound)?;
        if self.items[idx].owner != requester {
            return Err(MarketError::NotMarketer);
        }
        let minimum = inventory
            .minimum_price(shop_id)
            .ok_or(MarketError::ItemNotFound)?;
        let taxed = taxed_price(new_price, self.settings.market_ratio);
        if taxed <= minimum {
            return Err(MarketError::PriceTooLow);
        }
        if new_price.to_keys(&self.currency) >= self.settings.max_key_price {
            return Err(MarketError::PriceTooHigh);
        }
        if let Some(remaining) = self.items[idx].cooldown_remaining() {
            return Err(MarketError::EditCooldown {
                remaining_secs: remaining.as_secs(),
            });
        }

        let item = &mut self.items[idx];
        debug!(shop_id, price = new_price.to_scrap(), "editing item price");
        item.market_price = new_price;
        item.taxed_price = taxed;
        item.last_update = Utc::now();
        item.last_price_edit = Some(Instant::now());
        let (market, taxed) = (
            item.market_price.to_scrap() as i32,
            item.taxed_price.to_scrap() as i32,
        );
        // Remove-then-add forces sync consumers to refresh the entry
        self.changes.add(vec![shop_id], vec![shop_id], None);
        if let Err(e) = self.store.update_price(shop_id, market, taxed).await {
            error!(shop_id, "price persist failed: {e}");
        }
        Ok(())
    }

    /// Availability check with escrow-release promotion: an in-transit
    /// record whose slot reappeared in the inventory is promoted back to
    /// available before the check.
    pub async fn is_available<I: InventoryView>(&mut self, shop_id: ShopId, inventory: &I) -> bool {
        let Some(idx) = self.items.iter().position(|item| item.shop_id == shop_id) else {
            return false;
        };
        let present = inventory.contains_shop_id(shop_id);
        if self.items[idx].status == ItemStatus::InTransit && present {
            warn!(
                shop_id,
                "transit item is present in inventory, promoting to available; probably was in escrow"
            );
            let item_id = self.items[idx].item_id;
            self.set_status(shop_id, item_id, ItemStatus::Available).await;
        }
        self.items[idx].status == ItemStatus::Available && present
    }

    /// Push the current inventory snapshot into storage so the stale-link
    /// query sees it
    pub async fn sync_inventory(&self, snapshot: &InventorySnapshot) -> anyhow::Result<()> {
        self.store.sync_inventory_links(&snapshot.links()).await
    }

    /// Repair divergence between the ledger and the external inventory.
    ///
    /// Cheap case: the item still exists under a new shop id for the same
    /// original identity, so the link is rewritten in place. Otherwise the
    /// item's ownership history decides: after the run of operator-bot
    /// transit hops, return to the original marketer means withdrawn, a
    /// new owner means sold. Inconsistent histories are logged and left
    /// untouched for review.
    pub async fn reconcile_drift(&mut self) -> anyhow::Result<DriftReport> {
        let stale = self.store.stale_links().await?;
        let mut report = DriftReport::default();
        if stale.is_empty() {
            debug!("drift check: all good");
            return Ok(report);
        }
        warn!(count = stale.len(), "found ledger entries with stale shop links");
        for link in stale {
            match link.current_shop_id {
                Some(new_shop_id) => {
                    self.repair_shop_id(&link, new_shop_id).await;
                    report.relinked += 1;
                }
                None => match self.resolve_stale_status(&link).await {
                    Ok(StaleResolution::Sold) => {
                        info!(
                            original_id = link.original_id,
                            "item passed to a new owner, considering as sold"
                        );
                        self.set_as_sold(link.shop_id, link.item_id).await;
                        report.sold += 1;
                    }
                    Ok(StaleResolution::Withdrawn) => {
                        info!(
                            original_id = link.original_id,
                            "item returned to its marketer, considering as withdrawn"
                        );
                        self.set_as_withdrawn(link.shop_id, link.item_id).await;
                        report.withdrawn += 1;
                    }
                    Ok(StaleResolution::Unresolved) => {
                        debug!(
                            original_id = link.original_id,
                            "ownership history still in bot transit, leaving as is"
                        );
                        report.unresolved += 1;
                    }
                    Err(e) => {
                        error!(original_id = link.original_id, "drift resolution failed: {e}");
                        report.failed += 1;
                    }
                },
            }
        }
        Ok(report)
    }

    async fn repair_shop_id(&mut self, link: &StaleLink, new_shop_id: ShopId) {
        warn!(
            old = link.shop_id,
            new = new_shop_id,
            "outdated shop id, relinking"
        );
        if let Some(item) = self
            .items
            .iter_mut()
            .find(|item| item.shop_id == link.shop_id)
        {
            item.shop_id = new_shop_id;
        }
        if let Err(e) = self.store.update_shop_id(link.shop_id, new_shop_id).await {
            error!(old = link.shop_id, "shop id relink persist failed: {e}");
        }
    }

    /// Walk the ownership history of a stale item. Aborts (without partial
    /// recovery) when the recorded starting point does not belong to the
    /// expected marketer.
    async fn resolve_stale_status(&self, link: &StaleLink) -> anyhow::Result<StaleResolution> {
        let history = self.historian.ownership_history(link.original_id).await?;
        if history.is_empty() {
            anyhow::bail!("no ownership records for original id {}", link.original_id);
        }
        let start = history
            .iter()
            .position(|record| record.record_id == link.item_id)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no starting point for item {} in history of original {}",
                    link.item_id,
                    link.original_id
                )
            })?;
        if history[start].owner != link.owner {
            anyhow::bail!(
                "starting point owner {} does not match recorded marketer {} (original {})",
                history[start].owner,
                link.owner,
                link.original_id
            );
        }
        let mut bot_steps = 0usize;
        for record in &history[start + 1..] {
            if self.settings.bot_ids.contains(&record.owner) {
                bot_steps += 1;
                continue;
            }
            if bot_steps == 0 {
                anyhow::bail!(
                    "owner {} follows the starting point with no bot transit (record {})",
                    record.owner,
                    record.record_id
                );
            }
            return Ok(if record.owner == link.owner {
                StaleResolution::Withdrawn
            } else {
                StaleResolution::Sold
            });
        }
        Ok(StaleResolution::Unresolved)
    }

    #[cfg(test)]
    fn item_mut(&mut self, shop_id: ShopId) -> &mut MarketItem {
        self.items
            .iter_mut()
            .find(|item| item.shop_id == shop_id)
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct NoopStore;

    #[async_trait]
    impl LedgerStore for NoopStore {
        async fn ensure_schema(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn load_active(&self) -> anyhow::Result<Vec<MarketItemRow>> {
            Ok(vec![])
        }
        async fn upsert_items(&self, _rows: &[MarketItemRow]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn update_status(
            &self,
            _shop_id: i64,
            _item_id: i64,
            _status: i16,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn update_price(
            &self,
            _shop_id: i64,
            _market_price: i32,
            _taxed_price: i32,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn update_shop_id(&self, _old: i64, _new: i64) -> anyhow::Result<()> {
            Ok(())
        }
        async fn cancel_items(&self, _item_ids: &[i64], _status: i16) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stale_links(&self) -> anyhow::Result<Vec<StaleLink>> {
            Ok(vec![])
        }
        async fn sync_inventory_links(&self, _links: &[(i64, i64)]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn credit_wallet(&self, _owner: &str, _amount: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NoopHistorian;

    #[async_trait]
    impl ItemHistorian for NoopHistorian {
        async fn ownership_history(
            &self,
            _original_id: i64,
        ) -> anyhow::Result<Vec<crate::storage::OwnershipRecord>> {
            Ok(vec![])
        }
    }

    fn ledger() -> MarketLedger<NoopStore, NoopHistorian> {
        MarketLedger::new(NoopStore, NoopHistorian, MarketSettings::default())
    }

    fn asset(shop_id: i64, item_id: i64, original_id: i64, owner: &str) -> ImportItem {
        ImportItem {
            shop_id,
            item_id,
            original_id,
            owner: owner.to_string(),
            market_price: Price::from_scrap(90),
        }
    }

    fn inventory(slots: &[(i64, i64)]) -> InventorySnapshot {
        let mut snapshot = InventorySnapshot::default();
        for (shop_id, original_id) in slots {
            snapshot.insert(
                *shop_id,
                SlotInfo {
                    original_id: *original_id,
                    minimum_price: Price::from_scrap(10),
                },
            );
        }
        snapshot
    }

    #[tokio::test]
    async fn test_import_defaults_to_available_and_taxes_price() {
        let mut ledger = ledger();
        ledger
            .import_items(vec![asset(1, 100, 1000, "user-a")], None)
            .await;

        let item = ledger.find_by_id(100).unwrap();
        assert_eq!(item.status, ItemStatus::Available);
        // 90 scrap at the default 5% cut
        assert_eq!(item.taxed_price.to_scrap(), 86);
    }

    #[tokio::test]
    async fn test_find_by_id_prefers_item_id_over_shop_id() {
        let mut ledger = ledger();
        // shop id of the first record collides with the item id of the second
        ledger
            .import_items(
                vec![asset(100, 7, 1000, "user-a"), asset(2, 100, 2000, "user-b")],
                None,
            )
            .await;

        let found = ledger.find_by_id(100).unwrap();
        assert_eq!(found.owner, "user-b");

        // No item-id match falls back to shop id
        let found = ledger.find_by_id(2).unwrap();
        assert_eq!(found.owner, "user-b");
    }

    #[tokio::test]
    async fn test_find_for_item_falls_back_to_original_id() {
        let mut ledger = ledger();
        ledger
            .import_items(vec![asset(1, 100, 1000, "user-a")], None)
            .await;

        // Shop id went stale (inventory reshuffle); original id still matches
        let found = ledger.find_for_item(999, 1000).unwrap();
        assert_eq!(found.item_id, 100);

        assert!(ledger.find_for_item(999, 9999).is_none());
    }

    #[tokio::test]
    async fn test_find_for_item_tie_break_prefers_most_recent() {
        let mut ledger = ledger();
        // Two historical records share the original id
        ledger
            .import_items(vec![asset(1, 100, 1000, "user-a")], None)
            .await;
        ledger
            .import_items(vec![asset(2, 200, 1000, "user-a")], None)
            .await;
        ledger.item_mut(1).last_update = Utc::now() - chrono::Duration::hours(1);

        let found = ledger.find_for_item(999, 1000).unwrap();
        assert_eq!(found.item_id, 200);
    }

    #[tokio::test]
    async fn test_edit_price_validation_chain() {
        let mut ledger = ledger();
        ledger
            .import_items(vec![asset(1, 100, 1000, "user-a")], None)
            .await;
        let inv = inventory(&[(1, 1000)]);

        assert!(matches!(
            ledger
                .edit_price(99, Price::from_scrap(90), "user-a", &inv)
                .await,
            Err(MarketError::ItemNotFound)
        ));
        assert!(matches!(
            ledger
                .edit_price(1, Price::from_scrap(90), "user-b", &inv)
                .await,
            Err(MarketError::NotMarketer)
        ));
        // Taxed price must clear the slot minimum of 10 scrap
        assert!(matches!(
            ledger
                .edit_price(1, Price::from_scrap(10), "user-a", &inv)
                .await,
            Err(MarketError::PriceTooLow)
        ));
        // Above the 30-key cap (default table: 450 scrap per key)
        assert!(matches!(
            ledger
                .edit_price(1, Price::from_keys(Decimal::from(31), &CurrencyTable::default()), "user-a", &inv)
                .await,
            Err(MarketError::PriceTooHigh)
        ));

        assert!(ledger
            .edit_price(1, Price::from_scrap(120), "user-a", &inv)
            .await
            .is_ok());
        let item = ledger.find_by_id(100).unwrap();
        assert_eq!(item.market_price.to_scrap(), 120);
        assert_eq!(item.taxed_price.to_scrap(), 114);
    }

    #[tokio::test]
    async fn test_edit_price_cooldown_reports_remaining_time() {
        let mut ledger = ledger();
        ledger
            .import_items(vec![asset(1, 100, 1000, "user-a")], None)
            .await;
        let inv = inventory(&[(1, 1000)]);

        ledger
            .edit_price(1, Price::from_scrap(120), "user-a", &inv)
            .await
            .unwrap();

        // Second edit right away: rejected with the full cooldown pending
        match ledger
            .edit_price(1, Price::from_scrap(130), "user-a", &inv)
            .await
        {
            Err(MarketError::EditCooldown { remaining_secs }) => {
                assert!(remaining_secs > 290 && remaining_secs <= 300);
            }
            other => panic!("expected cooldown rejection, got {other:?}"),
        }

        // Four minutes in: still on cooldown, about a minute left
        ledger.item_mut(1).last_price_edit =
            Some(Instant::now() - Duration::from_secs(4 * 60));
        match ledger
            .edit_price(1, Price::from_scrap(130), "user-a", &inv)
            .await
        {
            Err(MarketError::EditCooldown { remaining_secs }) => {
                assert!(remaining_secs > 50 && remaining_secs <= 60);
            }
            other => panic!("expected cooldown rejection, got {other:?}"),
        }

        // Past five minutes: the edit goes through
        ledger.item_mut(1).last_price_edit =
            Some(Instant::now() - Duration::from_secs(5 * 60 + 1));
        assert!(ledger
            .edit_price(1, Price::from_scrap(130), "user-a", &inv)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_in_transit_item_promoted_when_back_in_inventory() {
        let mut ledger = ledger();
        ledger
            .import_items(
                vec![asset(1, 100, 1000, "user-a")],
                Some(ItemStatus::InTransit),
            )
            .await;

        // Not in inventory yet: unavailable, still in transit
        let empty = inventory(&[]);
        assert!(!ledger.is_available(1, &empty).await);
        assert_eq!(ledger.find_by_id(100).unwrap().status, ItemStatus::InTransit);

        // Item reappeared (escrow released): promoted and available
        let inv = inventory(&[(1, 1000)]);
        assert!(ledger.is_available(1, &inv).await);
        assert_eq!(ledger.find_by_id(100).unwrap().status, ItemStatus::Available);
    }

    #[tokio::test]
    async fn test_sold_requires_available() {
        let mut ledger = ledger();
        ledger
            .import_items(
                vec![asset(1, 100, 1000, "user-a")],
                Some(ItemStatus::InTransit),
            )
            .await;

        ledger.set_as_sold(1, 100).await;
        assert_eq!(ledger.find_by_id(100).unwrap().status, ItemStatus::InTransit);

        ledger.set_as_available(1, 100).await;
        ledger.set_as_sold(1, 100).await;
        assert_eq!(ledger.find_by_id(100).unwrap().status, ItemStatus::Sold);
    }

    #[tokio::test]
    async fn test_cancel_in_transit_removes_only_transit_records() {
        let mut ledger = ledger();
        ledger
            .import_items(
                vec![asset(1, 100, 1000, "user-a")],
                Some(ItemStatus::InTransit),
            )
            .await;
        ledger
            .import_items(vec![asset(2, 200, 2000, "user-b")], None)
            .await;

        ledger.cancel_in_transit(&[100, 200]).await;
        assert!(ledger.find_by_id(100).is_none());
        // Available record survives (logged as inconsistency)
        assert!(ledger.find_by_id(200).is_some());
    }

    #[tokio::test]
    async fn test_change_log_tracks_shop_visibility() {
        let mut ledger = ledger();
        // In-transit imports are not visible yet
        ledger
            .import_items(
                vec![asset(1, 100, 1000, "user-a")],
                Some(ItemStatus::InTransit),
            )
            .await;
        assert!(ledger.changes().is_empty());

        ledger.set_as_available(1, 100).await;
        let latest = ledger.changes().latest();
        assert_eq!(latest.added, vec![1]);
        assert!(latest.removed.is_empty());

        // A price edit republishes the entry
        let inv = inventory(&[(1, 1000)]);
        ledger
            .edit_price(1, Price::from_scrap(120), "user-a", &inv)
            .await
            .unwrap();
        let latest = ledger.changes().latest();
        assert_eq!(latest.added, vec![1]);
        assert_eq!(latest.removed, vec![1]);

        ledger.set_as_sold(1, 100).await;
        let latest = ledger.changes().latest();
        assert_eq!(latest.removed, vec![1]);

        // A sync consumer folding from the start sees the whole journey
        let since = ledger.changes().oldest().at;
        let folded = ledger.changes().get(Some(since)).unwrap();
        assert_eq!(folded.added, vec![1, 1]);
        assert_eq!(folded.removed, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_marketer_limit() {
        let mut ledger = ledger();
        let assets: Vec<ImportItem> = (0..12i64)
            .map(|i| asset(i, 100 + i, 1000 + i, "user-a"))
            .collect();
        ledger.import_items(assets, None).await;

        assert!(!ledger.can_market_more("user-a"));
        assert!(ledger.can_market_more("user-b"));
        assert!(ledger.marketer_exists("user-a"));
        assert!(!ledger.marketer_exists("user-b"));

        let prices = ledger.trade_prices(&[100, 101, 999]);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&100].to_scrap(), 90);
    }
}
