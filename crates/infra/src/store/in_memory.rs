use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

use stockledger_core::{OrderId, VariantId, WarehouseId};
use stockledger_inventory::{
    EntryId, LedgerEntry, NewLedgerEntry, StockKey, Variant, Warehouse, resolve_default,
};
use stockledger_orders::Order;

use super::query::{LedgerPage, Pagination, StockLevel};
use super::r#trait::{InventoryStore, StockTransaction};
use crate::error::StoreError;

#[derive(Debug, Copy, Clone)]
struct StockRow {
    quantity: i64,
    updated_at: DateTime<Utc>,
}

/// Committed state.
#[derive(Debug, Default)]
struct Committed {
    warehouses: Vec<Warehouse>,
    variants: Vec<Variant>,
    stock: HashMap<StockKey, StockRow>,
    /// Per key, ascending id.
    ledger: HashMap<StockKey, Vec<LedgerEntry>>,
    effects: HashSet<NewLedgerEntry>,
    orders: HashMap<OrderId, Order>,
}

type LockTable<K> = Arc<Mutex<HashMap<K, Arc<RowMutex<()>>>>>;

/// Exclusive per-row locks, created on first use and held by transactions.
///
/// Releasing the last guard of a row that nobody waits for removes its slot.
#[derive(Debug)]
struct RowLocks<K> {
    slots: LockTable<K>,
}

impl<K> Default for RowLocks<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> RowLocks<K>
where
    K: Copy + Eq + Hash,
{
    /// Waits until the row is free. The wait itself is unbounded; callers
    /// bound the whole transaction instead.
    async fn acquire(&self, key: K) -> Result<RowGuard<K>, StoreError> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| StoreError::Backend("lock table poisoned".to_string()))?;
            Arc::clone(slots.entry(key).or_default())
        };

        let guard = slot.lock_owned().await;
        Ok(RowGuard {
            key,
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// A held row lock. Dropping it releases the row.
#[derive(Debug)]
struct RowGuard<K: Copy + Eq + Hash> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slots: LockTable<K>,
}

impl<K: Copy + Eq + Hash> Drop for RowGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table's own handle left: nobody holds or waits for the row.
        if let Ok(mut slots) = self.slots.lock() {
            if slots
                .get(&self.key)
                .is_some_and(|slot| Arc::strong_count(slot) == 1)
            {
                slots.remove(&self.key);
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: RwLock<Committed>,
    stock_locks: RowLocks<StockKey>,
    order_locks: RowLocks<OrderId>,
    next_entry_id: AtomicU64,
}

impl Shared {
    fn read(&self) -> Result<RwLockReadGuard<'_, Committed>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Committed>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn quantity(&self, key: StockKey) -> Result<i64, StoreError> {
        Ok(self.read()?.stock.get(&key).map(|r| r.quantity).unwrap_or(0))
    }

    fn has_stock_row(&self, key: StockKey) -> Result<bool, StoreError> {
        Ok(self.read()?.stock.contains_key(&key))
    }

    fn contains_effect(&self, entry: &NewLedgerEntry) -> Result<bool, StoreError> {
        Ok(self.read()?.effects.contains(entry))
    }

    fn order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.read()?.orders.get(&id).cloned())
    }

    fn variant(&self, id: VariantId) -> Result<Option<Variant>, StoreError> {
        Ok(self.read()?.variants.iter().find(|v| v.id == id).cloned())
    }

    fn warehouse(&self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        Ok(self.read()?.warehouses.iter().find(|w| w.id == id).cloned())
    }

    fn default_warehouse(&self, codes: &[String]) -> Result<Option<Warehouse>, StoreError> {
        Ok(resolve_default(&self.read()?.warehouses, codes).cloned())
    }
}

/// In-memory inventory store.
///
/// Intended for tests, development and embedding. Row locking follows the
/// same rules as the Postgres backend: a transaction that locks a stock or
/// order row keeps it until commit or rollback, and other transactions wait
/// for it for as long as their caller lets them.
#[derive(Debug, Clone)]
pub struct InMemoryInventoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryInventoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(Committed::default()),
                stock_locks: RowLocks::default(),
                order_locks: RowLocks::default(),
                next_entry_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of rows with a live lock slot.
    #[cfg(test)]
    pub(crate) fn lock_slots(&self) -> usize {
        self.shared.stock_locks.len() + self.shared.order_locks.len()
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTransaction::new(Arc::clone(&self.shared)))
    }

    async fn get_on_hand(&self, key: StockKey) -> Result<i64, StoreError> {
        self.shared.quantity(key)
    }

    async fn ledger_page(&self, key: StockKey, page: Pagination) -> Result<LedgerPage, StoreError> {
        let state = self.shared.read()?;
        let entries = state
            .ledger
            .get(&key)
            .map(|stream| {
                stream
                    .iter()
                    .rev()
                    .filter(|e| page.before.is_none_or(|before| e.id < before))
                    .take(page.limit as usize + 1)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(LedgerPage::from_overfetch(entries, page.limit))
    }

    async fn ledger_sum(&self, key: StockKey) -> Result<i64, StoreError> {
        let state = self.shared.read()?;
        Ok(state
            .ledger
            .get(&key)
            .map(|stream| stockledger_inventory::net_change(stream))
            .unwrap_or(0))
    }

    async fn list_stock(&self, warehouse_id: WarehouseId) -> Result<Vec<StockLevel>, StoreError> {
        let state = self.shared.read()?;
        let mut levels: Vec<StockLevel> = state
            .stock
            .iter()
            .filter(|(key, _)| key.warehouse_id == warehouse_id)
            .map(|(key, row)| StockLevel {
                key: *key,
                quantity: row.quantity,
                updated_at: row.updated_at,
            })
            .collect();
        levels.sort_by_key(|l| l.key);
        Ok(levels)
    }

    async fn warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
        let mut all = self.shared.read()?.warehouses.clone();
        all.sort_by_key(|w| (w.created_at, w.id));
        Ok(all)
    }

    async fn create_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        let mut state = self.shared.write()?;
        if state.warehouses.iter().any(|w| w.code == warehouse.code) {
            return Err(StoreError::Duplicate(format!(
                "warehouse code '{}' already exists",
                warehouse.code
            )));
        }
        if state.warehouses.iter().any(|w| w.id == warehouse.id) {
            return Err(StoreError::Duplicate(format!(
                "warehouse {} already exists",
                warehouse.id
            )));
        }
        state.warehouses.push(warehouse.clone());
        Ok(())
    }

    async fn set_warehouse_active(&self, id: WarehouseId, active: bool) -> Result<(), StoreError> {
        let mut state = self.shared.write()?;
        let warehouse = state
            .warehouses
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("warehouse {id}")))?;
        warehouse.active = active;
        Ok(())
    }

    async fn register_variant(&self, variant: &Variant) -> Result<(), StoreError> {
        let mut state = self.shared.write()?;
        if state
            .variants
            .iter()
            .any(|v| v.sku == variant.sku || v.id == variant.id)
        {
            return Err(StoreError::Duplicate(format!(
                "variant '{}' already exists",
                variant.sku
            )));
        }
        state.variants.push(variant.clone());
        Ok(())
    }

    async fn variants(&self) -> Result<Vec<Variant>, StoreError> {
        Ok(self.shared.read()?.variants.clone())
    }

    async fn set_variant_active(&self, id: VariantId, active: bool) -> Result<(), StoreError> {
        let mut state = self.shared.write()?;
        let variant = state
            .variants
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("variant {id}")))?;
        variant.active = active;
        Ok(())
    }

    async fn find_variant(&self, id: VariantId) -> Result<Option<Variant>, StoreError> {
        self.shared.variant(id)
    }

    async fn load_order(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.shared.order(id)
    }
}

/// Transaction over [`InMemoryInventoryStore`].
///
/// Writes are staged here and published under the state write lock on commit,
/// before the row locks are released.
#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    stock_guards: HashMap<StockKey, RowGuard<StockKey>>,
    order_guards: HashMap<OrderId, RowGuard<OrderId>>,
    stock: HashMap<StockKey, i64>,
    ledger: Vec<LedgerEntry>,
    effects: HashSet<NewLedgerEntry>,
    orders: HashMap<OrderId, Order>,
}

impl InMemoryTransaction {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            stock_guards: HashMap::new(),
            order_guards: HashMap::new(),
            stock: HashMap::new(),
            ledger: Vec::new(),
            effects: HashSet::new(),
            orders: HashMap::new(),
        }
    }

    fn require_stock_lock(&self, key: StockKey) -> Result<(), StoreError> {
        if self.stock_guards.contains_key(&key) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!(
                "stock row {key} is not locked by this transaction"
            )))
        }
    }

    async fn acquire_order(&mut self, id: OrderId) -> Result<(), StoreError> {
        if !self.order_guards.contains_key(&id) {
            let guard = self.shared.order_locks.acquire(id).await?;
            self.order_guards.insert(id, guard);
        }
        Ok(())
    }
}

#[async_trait]
impl StockTransaction for InMemoryTransaction {
    async fn lock_stock(&mut self, key: StockKey) -> Result<i64, StoreError> {
        if !self.stock_guards.contains_key(&key) {
            let guard = self.shared.stock_locks.acquire(key).await?;
            self.stock_guards.insert(key, guard);
        }
        if let Some(quantity) = self.stock.get(&key) {
            return Ok(*quantity);
        }
        let quantity = self.shared.quantity(key)?;
        self.stock.insert(key, quantity);
        Ok(quantity)
    }

    async fn ensure_stock_row(&mut self, key: StockKey) -> Result<bool, StoreError> {
        let staged_before = self.stock.contains_key(&key);
        self.lock_stock(key).await?;
        Ok(!staged_before && !self.shared.has_stock_row(key)?)
    }

    async fn ledger_contains(&mut self, entry: &NewLedgerEntry) -> Result<bool, StoreError> {
        Ok(self.effects.contains(entry) || self.shared.contains_effect(entry)?)
    }

    async fn append(&mut self, entry: NewLedgerEntry) -> Result<EntryId, StoreError> {
        self.require_stock_lock(entry.key)?;
        if self.ledger_contains(&entry).await? {
            return Err(StoreError::Duplicate(format!(
                "{} {} for {}/{} on {}",
                entry.entry_type,
                entry.qty_change,
                entry.reference.reference_type,
                entry.reference.reference_id,
                entry.key
            )));
        }

        let id = EntryId(self.shared.next_entry_id.fetch_add(1, Ordering::SeqCst));
        self.effects.insert(entry.clone());
        self.ledger.push(LedgerEntry::from_new(id, entry, Utc::now()));
        Ok(id)
    }

    async fn apply_delta(&mut self, key: StockKey, delta: i64) -> Result<i64, StoreError> {
        self.require_stock_lock(key)?;
        let current = match self.stock.get(&key) {
            Some(q) => *q,
            None => self.shared.quantity(key)?,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::Conflict(format!("quantity overflow on {key}")))?;
        if next < 0 {
            return Err(StoreError::Conflict(format!(
                "quantity on {key} cannot go below zero ({current} {delta:+})"
            )));
        }
        self.stock.insert(key, next);
        Ok(next)
    }

    async fn find_variant(&mut self, id: VariantId) -> Result<Option<Variant>, StoreError> {
        self.shared.variant(id)
    }

    async fn warehouse(&mut self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        self.shared.warehouse(id)
    }

    async fn default_warehouse(&mut self, codes: &[String]) -> Result<Option<Warehouse>, StoreError> {
        self.shared.default_warehouse(codes)
    }

    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.acquire_order(id).await?;
        if let Some(order) = self.orders.get(&id) {
            return Ok(Some(order.clone()));
        }
        self.shared.order(id)
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let id = order.id_typed();
        self.acquire_order(id).await?;
        if self.orders.contains_key(&id) || self.shared.order(id)?.is_some() {
            return Err(StoreError::Duplicate(format!("order {id} already exists")));
        }
        self.orders.insert(id, order.clone());
        Ok(())
    }

    async fn update_order_status(&mut self, order: &Order) -> Result<(), StoreError> {
        let id = order.id_typed();
        if !self.order_guards.contains_key(&id) {
            return Err(StoreError::Conflict(format!(
                "order {id} is not locked by this transaction"
            )));
        }
        if !self.orders.contains_key(&id) && self.shared.order(id)?.is_none() {
            return Err(StoreError::NotFound(format!("order {id}")));
        }
        self.orders.insert(id, order.clone());
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let InMemoryTransaction {
            shared,
            stock_guards,
            order_guards,
            stock,
            ledger,
            effects,
            orders,
        } = self;

        {
            let mut state = shared.write()?;
            let now = Utc::now();
            for (key, quantity) in stock {
                state
                    .stock
                    .entry(key)
                    .and_modify(|row| {
                        if row.quantity != quantity {
                            row.quantity = quantity;
                            row.updated_at = now;
                        }
                    })
                    .or_insert(StockRow {
                        quantity,
                        updated_at: now,
                    });
            }
            for entry in ledger {
                state.ledger.entry(entry.key).or_default().push(entry);
            }
            state.effects.extend(effects);
            state.orders.extend(orders);
        }

        // Row locks are released only after the new state is visible.
        drop(stock_guards);
        drop(order_guards);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
