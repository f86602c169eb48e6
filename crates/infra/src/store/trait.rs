use async_trait::async_trait;

use stockledger_core::{OrderId, VariantId, WarehouseId};
use stockledger_inventory::{EntryId, NewLedgerEntry, StockKey, Variant, Warehouse};
use stockledger_orders::Order;

use super::query::{LedgerPage, Pagination, StockLevel};
use crate::error::StoreError;

/// Ledger, projection, catalog and order storage.
///
/// Reads on the store itself see committed state only. Every write that
/// touches stock or orders goes through a [`StockTransaction`] obtained from
/// [`InventoryStore::begin`].
///
/// ## Consistency
///
/// A committed reader never observes a projection row that disagrees with the
/// ledger: both are published together when the transaction commits.
///
/// ## Catalog writes
///
/// Warehouses and variants are operator data and are written outside stock
/// transactions.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    type Tx: StockTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Committed on-hand quantity; 0 if no row exists.
    async fn get_on_hand(&self, key: StockKey) -> Result<i64, StoreError>;

    async fn ledger_page(&self, key: StockKey, page: Pagination) -> Result<LedgerPage, StoreError>;

    /// Σ `qty_change` over the key's ledger stream.
    async fn ledger_sum(&self, key: StockKey) -> Result<i64, StoreError>;

    /// All projection rows of a warehouse.
    async fn list_stock(&self, warehouse_id: WarehouseId) -> Result<Vec<StockLevel>, StoreError>;

    /// All warehouses, oldest first.
    async fn warehouses(&self) -> Result<Vec<Warehouse>, StoreError>;

    /// Fails with `Duplicate` if the code is taken.
    async fn create_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError>;

    async fn set_warehouse_active(&self, id: WarehouseId, active: bool) -> Result<(), StoreError>;

    /// Fails with `Duplicate` if the sku is taken.
    async fn register_variant(&self, variant: &Variant) -> Result<(), StoreError>;

    async fn variants(&self) -> Result<Vec<Variant>, StoreError>;

    /// An inactive variant stays in the catalog but takes no new stock
    /// movements or orders.
    async fn set_variant_active(&self, id: VariantId, active: bool) -> Result<(), StoreError>;

    async fn find_variant(&self, id: VariantId) -> Result<Option<Variant>, StoreError>;

    async fn load_order(&self, id: OrderId) -> Result<Option<Order>, StoreError>;
}

/// One all-or-nothing unit of work.
///
/// Row locks taken here are held until the transaction ends. Dropping a
/// transaction without calling [`StockTransaction::commit`] rolls it back, so a
/// cancelled or timed-out future leaves no trace.
#[async_trait]
pub trait StockTransaction: Send {
    /// Lock the projection row exclusively, creating it at 0 if absent, and
    /// return its current quantity.
    ///
    /// Waits while another transaction holds the row, for as long as the
    /// enclosing transaction's timeout allows.
    async fn lock_stock(&mut self, key: StockKey) -> Result<i64, StoreError>;

    /// Create the projection row at 0 if absent. Returns whether it was created.
    async fn ensure_stock_row(&mut self, key: StockKey) -> Result<bool, StoreError>;

    /// Whether the ledger already records this effect (committed or staged here).
    async fn ledger_contains(&mut self, entry: &NewLedgerEntry) -> Result<bool, StoreError>;

    /// Append a ledger entry. Fails with `Duplicate` if the idempotency tuple
    /// (key, qty_change, type, reference) already exists.
    async fn append(&mut self, entry: NewLedgerEntry) -> Result<EntryId, StoreError>;

    /// Add `delta` to a row locked by this transaction and return the new quantity.
    async fn apply_delta(&mut self, key: StockKey, delta: i64) -> Result<i64, StoreError>;

    async fn find_variant(&mut self, id: VariantId) -> Result<Option<Variant>, StoreError>;

    async fn warehouse(&mut self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError>;

    /// The default warehouse by reserved-code precedence; see
    /// [`stockledger_inventory::resolve_default`].
    async fn default_warehouse(&mut self, codes: &[String]) -> Result<Option<Warehouse>, StoreError>;

    /// Lock an order row exclusively and load it.
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError>;

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;

    /// Persist status and version of an order locked by this transaction.
    async fn update_order_status(&mut self, order: &Order) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
