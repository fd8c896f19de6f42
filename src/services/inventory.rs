use crate::{
    db::DbPool,
    entities::inventory_record::{
        self, encode_size_map, total_of, Entity as InventoryRecordEntity,
        SizeMap,
    },
    errors::ServiceError,
    events::{publish_all, Event, EventSender},
    ids::{ProductId, SupplierId},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub type StockKey = (SupplierId, ProductId);

/// Per-(supplier, product) async locks serializing read-modify-write of stock maps.
#[derive(Debug, Default)]
pub struct StockLocks {
    locks: DashMap<StockKey, Arc<Mutex<()>>>,
}

/// Held for the lifetime of a stock mutation.
pub struct StockGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl StockLocks {
    /// Locks every key, in sorted order so concurrent callers cannot deadlock.
    pub async fn acquire(&self, keys: impl IntoIterator<Item = StockKey>) -> StockGuard {
        let mut keys: Vec<StockKey> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        self.prune();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self
                .locks
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        StockGuard { _guards: guards }
    }

    /// Drops locks nobody holds or waits on. Guards keep their `Arc` alive,
    /// so a strong count of one means the map is the only owner.
    fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of tracked keys, idle ones included until the next acquire.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Result of taking units out of one size bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decrement {
    pub before: i32,
    pub after: i32,
    /// Units requested beyond what was on hand.
    pub shortfall: i32,
}

/// Removes `quantity` units from `size`, never going below zero.
pub fn apply_decrement(stock: &mut SizeMap, size: &str, quantity: i32) -> Decrement {
    let before = stock.get(size).copied().unwrap_or(0).max(0);
    let after = before.saturating_sub(quantity).max(0);
    stock.insert(size.to_string(), after);
    Decrement {
        before,
        after,
        shortfall: quantity.saturating_sub(before).max(0),
    }
}

/// Adds `quantity` units to `size`, saturating at `i32::MAX`.
pub fn apply_increment(stock: &mut SizeMap, size: &str, quantity: i32) -> i32 {
    let entry = stock.entry(size.to_string()).or_insert(0);
    *entry = (*entry).max(0).saturating_add(quantity);
    *entry
}

/// What happened to one size bucket during a dispatch or restock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChange {
    pub supplier_id: SupplierId,
    pub product_id: ProductId,
    pub size: String,
    pub requested: i32,
    pub before: i32,
    pub after: i32,
    pub shortfall: i32,
    /// No ledger record existed, so nothing was written.
    pub record_missing: bool,
    pub low_stock_threshold: Option<i32>,
}

impl StockChange {
    pub fn is_insufficient(&self) -> bool {
        self.shortfall > 0 || self.record_missing
    }

    pub fn events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        if self.is_insufficient() {
            events.push(Event::InsufficientInventory {
                supplier_id: self.supplier_id,
                product_id: self.product_id,
                size: self.size.clone(),
                requested: self.requested,
                available: self.before,
            });
        }
        if let Some(threshold) = self.low_stock_threshold {
            events.push(Event::LowStock {
                supplier_id: self.supplier_id,
                product_id: self.product_id,
                size: self.size.clone(),
                remaining: self.after,
                threshold,
            });
        }
        events
    }
}

/// Non-blocking notice that a dispatch outran recorded stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryWarning {
    pub product_id: ProductId,
    pub size: String,
    pub requested: i32,
    pub available: i32,
    pub message: String,
}

impl From<&StockChange> for InventoryWarning {
    fn from(change: &StockChange) -> Self {
        let message = if change.record_missing {
            format!(
                "No inventory record for product {}; stock not adjusted",
                change.product_id
            )
        } else {
            format!(
                "Dispatched {} of size {} with only {} in stock",
                change.requested, change.size, change.before
            )
        };
        Self {
            product_id: change.product_id,
            size: change.size.clone(),
            requested: change.requested,
            available: change.before,
            message,
        }
    }
}

fn low_stock(thresholds: &SizeMap, size: &str, remaining: i32) -> Option<i32> {
    thresholds
        .get(size)
        .copied()
        .filter(|threshold| *threshold > 0 && remaining <= *threshold)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StockLevelUpdate {
    pub supplier_id: SupplierId,
    pub product_id: ProductId,
    #[validate(length(min = 1, max = 32, message = "Size is required"))]
    pub size: String,
    #[validate(range(min = 0, max = 1_000_000, message = "Stock level must be between 0 and 1000000"))]
    pub quantity: i32,
    #[validate(range(min = 0, max = 1_000_000))]
    #[serde(default)]
    pub low_stock_threshold: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryView {
    pub id: Uuid,
    pub supplier_id: SupplierId,
    pub product_id: ProductId,
    pub stock: SizeMap,
    pub low_stock_thresholds: SizeMap,
    pub total_stock: i32,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

impl From<inventory_record::Model> for InventoryView {
    fn from(record: inventory_record::Model) -> Self {
        Self {
            stock: record.stock_map(),
            low_stock_thresholds: record.threshold_map(),
            id: record.id,
            supplier_id: SupplierId::from(record.supplier_id),
            product_id: ProductId::from(record.product_id),
            total_stock: record.total_stock,
            version: record.version,
            updated_at: record.updated_at,
        }
    }
}

/// Size-keyed stock ledger per supplier and product.
#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DbPool>,
    locks: Arc<StockLocks>,
    event_sender: Option<Arc<EventSender>>,
}

impl InventoryService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            locks: Arc::new(StockLocks::default()),
            event_sender,
        }
    }

    pub fn locks(&self) -> &StockLocks {
        &self.locks
    }

    /// Sets the on-hand quantity of one size, creating the ledger record if needed.
    #[instrument(skip(self, update), fields(supplier_id = %update.supplier_id, product_id = %update.product_id, size = %update.size))]
    pub async fn set_stock_level(
        &self,
        update: StockLevelUpdate,
    ) -> Result<InventoryView, ServiceError> {
        update.validate()?;
        let size = update.size.trim().to_string();
        let _guard = self
            .locks
            .acquire([(update.supplier_id, update.product_id)])
            .await;

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start stock update transaction");
            ServiceError::DatabaseError(e)
        })?;

        let existing = find_record(&txn, update.supplier_id, update.product_id).await?;
        let (mut stock, mut thresholds) = existing
            .as_ref()
            .map(|r| (r.stock_map(), r.threshold_map()))
            .unwrap_or_default();
        stock.insert(size.clone(), update.quantity);
        if let Some(threshold) = update.low_stock_threshold {
            thresholds.insert(size.clone(), threshold);
        }

        let record = match existing {
            Some(current) => write_record(&txn, &current, &stock, Some(&thresholds)).await?,
            None => {
                insert_record(&txn, update.supplier_id, update.product_id, &stock, &thresholds)
                    .await?
            }
        };

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Failed to commit stock update");
            ServiceError::DatabaseError(e)
        })?;

        info!(quantity = update.quantity, total = record.total_stock, "Stock level set");
        if let Some(threshold) = low_stock(&thresholds, &size, update.quantity) {
            publish_all(
                self.event_sender.as_deref(),
                vec![Event::LowStock {
                    supplier_id: update.supplier_id,
                    product_id: update.product_id,
                    size,
                    remaining: update.quantity,
                    threshold,
                }],
            )
            .await;
        }
        Ok(record.into())
    }

    #[instrument(skip(self))]
    pub async fn get_inventory(
        &self,
        supplier_id: SupplierId,
        product_id: ProductId,
    ) -> Result<InventoryView, ServiceError> {
        let db = &*self.db_pool;
        find_record(db, supplier_id, product_id)
            .await?
            .map(InventoryView::from)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No inventory for supplier {} product {}",
                    supplier_id, product_id
                ))
            })
    }

    /// Takes dispatched units out of stock. Callers hold the key lock and own the transaction.
    pub(crate) async fn decrement_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        supplier_id: SupplierId,
        product_id: ProductId,
        size: &str,
        quantity: i32,
    ) -> Result<StockChange, ServiceError> {
        let Some(current) = find_record(conn, supplier_id, product_id).await? else {
            warn!(supplier_id = %supplier_id, product_id = %product_id, "Dispatch for product without inventory record");
            return Ok(StockChange {
                supplier_id,
                product_id,
                size: size.to_string(),
                requested: quantity,
                before: 0,
                after: 0,
                shortfall: quantity,
                record_missing: true,
                low_stock_threshold: None,
            });
        };

        let mut stock = current.stock_map();
        let decrement = apply_decrement(&mut stock, size, quantity);
        write_record(conn, &current, &stock, None).await?;

        if decrement.shortfall > 0 {
            warn!(
                supplier_id = %supplier_id,
                product_id = %product_id,
                size = size,
                requested = quantity,
                available = decrement.before,
                "Dispatch exceeds recorded stock; clamped at zero"
            );
        }
        debug!(size = size, before = decrement.before, after = decrement.after, "Stock decremented");

        Ok(StockChange {
            supplier_id,
            product_id,
            size: size.to_string(),
            requested: quantity,
            before: decrement.before,
            after: decrement.after,
            shortfall: decrement.shortfall,
            record_missing: false,
            low_stock_threshold: low_stock(&current.threshold_map(), size, decrement.after),
        })
    }

    /// Puts returned units back into stock, creating the record if none exists.
    pub(crate) async fn increment_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        supplier_id: SupplierId,
        product_id: ProductId,
        size: &str,
        quantity: i32,
    ) -> Result<StockChange, ServiceError> {
        let existing = find_record(conn, supplier_id, product_id).await?;
        let mut stock = existing.as_ref().map(|r| r.stock_map()).unwrap_or_default();
        let before = stock.get(size).copied().unwrap_or(0).max(0);
        let after = apply_increment(&mut stock, size, quantity);

        match existing {
            Some(current) => {
                write_record(conn, &current, &stock, None).await?;
            }
            None => {
                insert_record(conn, supplier_id, product_id, &stock, &SizeMap::new()).await?;
            }
        }
        info!(supplier_id = %supplier_id, product_id = %product_id, size = size, quantity, "Stock restocked");

        Ok(StockChange {
            supplier_id,
            product_id,
            size: size.to_string(),
            requested: quantity,
            before,
            after,
            shortfall: 0,
            record_missing: false,
            low_stock_threshold: None,
        })
    }
}

async fn find_record<C: ConnectionTrait>(
    conn: &C,
    supplier_id: SupplierId,
    product_id: ProductId,
) -> Result<Option<inventory_record::Model>, ServiceError> {
    InventoryRecordEntity::find()
        .filter(inventory_record::Column::SupplierId.eq(supplier_id.as_uuid()))
        .filter(inventory_record::Column::ProductId.eq(product_id.as_uuid()))
        .one(conn)
        .await
        .map_err(ServiceError::DatabaseError)
}

async fn insert_record<C: ConnectionTrait>(
    conn: &C,
    supplier_id: SupplierId,
    product_id: ProductId,
    stock: &SizeMap,
    thresholds: &SizeMap,
) -> Result<inventory_record::Model, ServiceError> {
    let now = Utc::now();
    inventory_record::ActiveModel {
        id: Set(Uuid::new_v4()),
        supplier_id: Set(supplier_id.as_uuid()),
        product_id: Set(product_id.as_uuid()),
        stock: Set(encode_size_map(stock)),
        low_stock_thresholds: Set(encode_size_map(thresholds)),
        total_stock: Set(total_of(stock)),
        version: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await
    .map_err(|e| {
        if ServiceError::is_unique_violation(&e) {
            ServiceError::ConcurrentModification(product_id.as_uuid())
        } else {
            error!(error = %e, "Failed to create inventory record");
            ServiceError::DatabaseError(e)
        }
    })
}

/// Writes a new stock map, failing if the record changed since it was read.
async fn write_record<C: ConnectionTrait>(
    conn: &C,
    current: &inventory_record::Model,
    stock: &SizeMap,
    thresholds: Option<&SizeMap>,
) -> Result<inventory_record::Model, ServiceError> {
    let mut changes = current.clone().into_active_model();
    changes.stock = Set(encode_size_map(stock));
    changes.total_stock = Set(total_of(stock));
    if let Some(thresholds) = thresholds {
        changes.low_stock_thresholds = Set(encode_size_map(thresholds));
    }
    changes.version = Set(current.version + 1);
    changes.updated_at = Set(Utc::now());

    InventoryRecordEntity::update(changes)
        .filter(inventory_record::Column::Version.eq(current.version))
        .exec(conn)
        .await
        .map_err(|e| match e {
            DbErr::RecordNotUpdated => ServiceError::ConcurrentModification(current.id),
            other => {
                error!(error = %other, inventory_record_id = %current.id, "Failed to update inventory record");
                ServiceError::DatabaseError(other)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decrement_clamps_at_zero_and_reports_shortfall() {
        let mut stock = SizeMap::from([("M".to_string(), 3)]);
        let result = apply_decrement(&mut stock, "M", 5);
        assert_eq!(
            result,
            Decrement {
                before: 3,
                after: 0,
                shortfall: 2
            }
        );
        assert_eq!(stock["M"], 0);
    }

    #[test]
    fn decrement_of_unknown_size_starts_from_zero() {
        let mut stock = SizeMap::new();
        let result = apply_decrement(&mut stock, "XS", 1);
        assert_eq!(result.before, 0);
        assert_eq!(result.shortfall, 1);
        assert_eq!(stock["XS"], 0);
    }

    #[test]
    fn low_stock_needs_a_positive_threshold() {
        let thresholds = SizeMap::from([("M".to_string(), 2), ("L".to_string(), 0)]);
        assert_eq!(low_stock(&thresholds, "M", 2), Some(2));
        assert_eq!(low_stock(&thresholds, "M", 3), None);
        assert_eq!(low_stock(&thresholds, "L", 0), None);
        assert_eq!(low_stock(&thresholds, "S", 0), None);
    }

    #[tokio::test]
    async fn locks_on_the_same_key_serialize() {
        let locks = Arc::new(StockLocks::default());
        let key = (SupplierId::new(), ProductId::new());

        let guard = locks.acquire([key]).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire([key]).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn idle_locks_are_pruned() {
        let locks = StockLocks::default();
        for _ in 0..50 {
            let _guard = locks
                .acquire([(SupplierId::new(), ProductId::new())])
                .await;
        }
        assert_eq!(locks.len(), 1);

        let held = (SupplierId::new(), ProductId::new());
        let _guard = locks.acquire([held]).await;
        let _other = locks
            .acquire([(SupplierId::new(), ProductId::new())])
            .await;
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn increments_saturate_at_the_i32_ceiling() {
        let mut stock = SizeMap::from([("M".to_string(), i32::MAX - 1)]);
        assert_eq!(apply_increment(&mut stock, "M", 5), i32::MAX);
        assert_eq!(apply_increment(&mut stock, "L", 3), 3);
        assert_eq!(total_of(&stock), i32::MAX);

        let mut negative = SizeMap::from([("S".to_string(), -2)]);
        assert_eq!(apply_increment(&mut negative, "S", 1), 1);
    }

    proptest! {
        #[test]
        fn stock_never_goes_negative(start in 0i32..500, takes in proptest::collection::vec(0i32..200, 0..20)) {
            let mut stock = SizeMap::from([("M".to_string(), start)]);
            let mut on_hand = start;
            for take in takes {
                let d = apply_decrement(&mut stock, "M", take);
                prop_assert!(d.after >= 0);
                prop_assert_eq!(d.before, on_hand);
                prop_assert_eq!(d.after, (on_hand - take).max(0));
                prop_assert_eq!(d.shortfall, (take - on_hand).max(0));
                on_hand = d.after;
            }
            prop_assert_eq!(total_of(&stock), on_hand);
        }
    }
}
