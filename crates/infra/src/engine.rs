//! Inventory operations engine: the only writer of the stock projection.
//!
//! Every stock operation runs this pipeline inside one store transaction:
//!
//! ```text
//! resolve warehouse (explicit, or the default by reserved-code precedence)
//!   ↓
//! lock the (warehouse, variant) projection row, creating it at 0 if absent
//!   ↓
//! idempotency check on (key, qty_change, type, reference)
//!   ↓
//! decide: the movement against the locked on-hand quantity
//!   ↓
//! append the ledger entry, apply the delta to the projection
//!   ↓
//! commit (or roll back everything on any failure)
//! ```
//!
//! The whole pipeline, lock waits included, is bounded by
//! [`EngineConfig::transaction_timeout`]. On timeout the in-flight transaction
//! is dropped, which rolls it back.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use stockledger_core::{ProductId, Quantity, VariantId, WarehouseId};
use stockledger_inventory::{
    EntryId, LedgerEntry, Reference, StockKey, StockMovement, Variant, Warehouse,
};

use crate::config::EngineConfig;
use crate::error::{InventoryError, StoreError};
use crate::ledger_scan::LedgerScan;
use crate::store::{InMemoryInventoryStore, InventoryStore, StockLevel, StockTransaction};

/// Outcome of one applied movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChange {
    pub key: StockKey,
    pub entry_id: EntryId,
    /// On-hand quantity after the movement.
    pub on_hand: i64,
}

/// Projection vs. ledger comparison for one stock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub key: StockKey,
    pub projected: i64,
    pub ledger_sum: i64,
}

impl Reconciliation {
    pub fn drift(&self) -> i64 {
        self.projected - self.ledger_sum
    }

    pub fn is_consistent(&self) -> bool {
        self.drift() == 0
    }
}

/// Stock operations over an [`InventoryStore`].
///
/// Cheap to clone; clones share the store.
#[derive(Debug)]
pub struct InventoryEngine<S> {
    store: Arc<S>,
    config: Arc<EngineConfig>,
}

impl<S> Clone for InventoryEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S> InventoryEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    pub fn from_shared(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl InventoryEngine<InMemoryInventoryStore> {
    /// Engine over a fresh in-memory store.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(InMemoryInventoryStore::new(), config)
    }
}

impl<S: InventoryStore> InventoryEngine<S> {
    /// `PURCHASE_IN`: +quantity, always allowed.
    pub async fn receive(
        &self,
        warehouse: Option<WarehouseId>,
        variant: VariantId,
        quantity: Quantity,
        reference: Reference,
    ) -> Result<i64, InventoryError> {
        self.apply(warehouse, variant, StockMovement::Receive(quantity), reference)
            .await
            .map(|c| c.on_hand)
    }

    /// `SALE_OUT`: -quantity; `InsufficientStock` if on-hand is below quantity.
    pub async fn sell(
        &self,
        warehouse: Option<WarehouseId>,
        variant: VariantId,
        quantity: Quantity,
        reference: Reference,
    ) -> Result<i64, InventoryError> {
        self.apply(warehouse, variant, StockMovement::Sell(quantity), reference)
            .await
            .map(|c| c.on_hand)
    }

    /// `RESERVE`: -quantity, same stock pool and check as [`Self::sell`].
    pub async fn reserve(
        &self,
        warehouse: Option<WarehouseId>,
        variant: VariantId,
        quantity: Quantity,
        reference: Reference,
    ) -> Result<i64, InventoryError> {
        self.apply(warehouse, variant, StockMovement::Reserve(quantity), reference)
            .await
            .map(|c| c.on_hand)
    }

    /// `RELEASE`: +quantity, reverses a reservation.
    pub async fn release(
        &self,
        warehouse: Option<WarehouseId>,
        variant: VariantId,
        quantity: Quantity,
        reference: Reference,
    ) -> Result<i64, InventoryError> {
        self.apply(warehouse, variant, StockMovement::Release(quantity), reference)
            .await
            .map(|c| c.on_hand)
    }

    /// `RETURN`: +quantity.
    pub async fn return_stock(
        &self,
        warehouse: Option<WarehouseId>,
        variant: VariantId,
        quantity: Quantity,
        reference: Reference,
    ) -> Result<i64, InventoryError> {
        self.apply(warehouse, variant, StockMovement::Return(quantity), reference)
            .await
            .map(|c| c.on_hand)
    }

    /// `ADJUST`: signed correction. Zero is rejected; a negative delta larger
    /// than on-hand fails with `InsufficientStock`.
    pub async fn adjust(
        &self,
        warehouse: Option<WarehouseId>,
        variant: VariantId,
        delta: i64,
        reference: Reference,
    ) -> Result<i64, InventoryError> {
        self.apply(warehouse, variant, StockMovement::Adjust(delta), reference)
            .await
            .map(|c| c.on_hand)
    }

    /// Apply one movement in its own transaction.
    #[instrument(
        skip(self, reference),
        fields(
            warehouse_id = ?warehouse,
            variant_id = %variant,
            entry_type = %movement.entry_type(),
            delta = movement.delta(),
            reference_type = %reference.reference_type,
            reference_id = %reference.reference_id
        ),
        err
    )]
    pub async fn apply(
        &self,
        warehouse: Option<WarehouseId>,
        variant: VariantId,
        movement: StockMovement,
        reference: Reference,
    ) -> Result<StockChange, InventoryError> {
        self.bounded(async {
            let mut tx = self.store.begin().await?;
            let result = async {
                let warehouse = self.resolve_warehouse(&mut tx, warehouse).await?;
                match tx.find_variant(variant).await? {
                    Some(v) if v.active => {}
                    _ => return Err(InventoryError::UnknownVariant(variant)),
                }
                let key = StockKey::new(warehouse.id, variant);
                self.apply_in(&mut tx, key, movement, reference).await
            }
            .await;
            finish(tx, result).await
        })
        .await
    }

    /// Committed on-hand quantity; 0 when the row does not exist.
    pub async fn get_on_hand(
        &self,
        warehouse: WarehouseId,
        variant: VariantId,
    ) -> Result<i64, InventoryError> {
        Ok(self
            .store
            .get_on_hand(StockKey::new(warehouse, variant))
            .await?)
    }

    /// Lazy newest-first walk over the key's ledger.
    pub fn scan_ledger(&self, warehouse: WarehouseId, variant: VariantId) -> LedgerScan<'_, S> {
        LedgerScan::new(
            &*self.store,
            StockKey::new(warehouse, variant),
            self.config.effective_page_size(),
        )
    }

    /// Full ledger of a key, newest first.
    pub async fn list_ledger(
        &self,
        warehouse: WarehouseId,
        variant: VariantId,
    ) -> Result<Vec<LedgerEntry>, InventoryError> {
        Ok(self
            .scan_ledger(warehouse, variant)
            .collect_remaining()
            .await?)
    }

    pub async fn list_stock(&self, warehouse: WarehouseId) -> Result<Vec<StockLevel>, InventoryError> {
        Ok(self.store.list_stock(warehouse).await?)
    }

    /// Compare the projection row with the ledger sum under the row lock.
    #[instrument(skip(self), fields(warehouse_id = %warehouse, variant_id = %variant), err)]
    pub async fn reconcile(
        &self,
        warehouse: WarehouseId,
        variant: VariantId,
    ) -> Result<Reconciliation, InventoryError> {
        let key = StockKey::new(warehouse, variant);
        let report = self
            .bounded(async {
                let mut tx = self.store.begin().await?;
                let projected = tx.lock_stock(key).await?;
                let ledger_sum = self.store.ledger_sum(key).await?;
                tx.rollback().await?;
                Ok::<_, InventoryError>(Reconciliation {
                    key,
                    projected,
                    ledger_sum,
                })
            })
            .await?;

        if !report.is_consistent() {
            warn!(%key, projected = report.projected, ledger_sum = report.ledger_sum, "projection drift detected");
        }
        Ok(report)
    }

    /// Create a zero-quantity row for every registered variant in the
    /// warehouse. Returns how many rows were created; no ledger entries.
    #[instrument(skip(self), fields(warehouse_id = ?warehouse), err)]
    pub async fn init_inventory(&self, warehouse: Option<WarehouseId>) -> Result<usize, InventoryError> {
        let mut variant_ids: Vec<VariantId> = self
            .store
            .variants()
            .await?
            .into_iter()
            .filter(|v| v.active)
            .map(|v| v.id)
            .collect();
        variant_ids.sort();

        let created = self
            .bounded(async {
                let mut tx = self.store.begin().await?;
                let result = async {
                    let warehouse = self.resolve_warehouse(&mut tx, warehouse).await?;
                    let mut created = 0;
                    for variant_id in &variant_ids {
                        if tx
                            .ensure_stock_row(StockKey::new(warehouse.id, *variant_id))
                            .await?
                        {
                            created += 1;
                        }
                    }
                    Ok::<_, InventoryError>(created)
                }
                .await;
                finish(tx, result).await
            })
            .await?;

        info!(created, variants = variant_ids.len(), "inventory rows initialised");
        Ok(created)
    }

    /// The warehouse used when callers do not name one.
    pub async fn default_warehouse(&self) -> Result<Warehouse, InventoryError> {
        let mut tx = self.store.begin().await?;
        let result = self.resolve_warehouse(&mut tx, None).await;
        finish(tx, result).await
    }

    pub async fn warehouses(&self) -> Result<Vec<Warehouse>, InventoryError> {
        Ok(self.store.warehouses().await?)
    }

    #[instrument(skip(self, name), err)]
    pub async fn create_warehouse(
        &self,
        code: &str,
        name: &str,
    ) -> Result<Warehouse, InventoryError> {
        let warehouse = Warehouse::new(code, name, Utc::now())
            .map_err(|e| InventoryError::Validation(e.to_string()))?;
        self.store
            .create_warehouse(&warehouse)
            .await
            .map_err(duplicate_as_validation)?;
        info!(warehouse_id = %warehouse.id, code = %warehouse.code, "warehouse created");
        Ok(warehouse)
    }

    pub async fn set_warehouse_active(
        &self,
        warehouse: WarehouseId,
        active: bool,
    ) -> Result<(), InventoryError> {
        match self.store.set_warehouse_active(warehouse, active).await {
            Err(StoreError::NotFound(_)) => Err(InventoryError::UnknownWarehouse(warehouse)),
            other => Ok(other?),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn register_variant(
        &self,
        product_id: ProductId,
        sku: &str,
        price: u64,
    ) -> Result<Variant, InventoryError> {
        let variant = Variant::new(product_id, sku, price)
            .map_err(|e| InventoryError::Validation(e.to_string()))?;
        self.store
            .register_variant(&variant)
            .await
            .map_err(duplicate_as_validation)?;
        Ok(variant)
    }

    pub async fn variants(&self) -> Result<Vec<Variant>, InventoryError> {
        Ok(self.store.variants().await?)
    }

    /// Deactivated variants are treated as unknown by stock operations and
    /// order placement until reactivated.
    pub async fn set_variant_active(
        &self,
        variant: VariantId,
        active: bool,
    ) -> Result<(), InventoryError> {
        match self.store.set_variant_active(variant, active).await {
            Err(StoreError::NotFound(_)) => Err(InventoryError::UnknownVariant(variant)),
            other => {
                other?;
                info!(variant_id = %variant, active, "variant activation changed");
                Ok(())
            }
        }
    }

    /// Explicit warehouse (must exist and be active) or the default one.
    pub(crate) async fn resolve_warehouse(
        &self,
        tx: &mut S::Tx,
        requested: Option<WarehouseId>,
    ) -> Result<Warehouse, InventoryError> {
        match requested {
            Some(id) => match tx.warehouse(id).await? {
                Some(w) if w.active => Ok(w),
                _ => Err(InventoryError::UnknownWarehouse(id)),
            },
            None => tx
                .default_warehouse(&self.config.default_warehouse_codes)
                .await?
                .ok_or(InventoryError::NoWarehouseConfigured),
        }
    }

    /// Lock → idempotency check → decide → append → apply, inside `tx`.
    ///
    /// Callers are responsible for commit or rollback.
    pub(crate) async fn apply_in(
        &self,
        tx: &mut S::Tx,
        key: StockKey,
        movement: StockMovement,
        reference: Reference,
    ) -> Result<StockChange, InventoryError> {
        let on_hand = tx.lock_stock(key).await?;
        let entry = movement.to_entry(key, reference);

        if tx.ledger_contains(&entry).await? {
            return Err(InventoryError::DuplicateEffect(Box::new(entry)));
        }

        let expected = movement.decide(on_hand).map_err(|e| {
            let err = InventoryError::for_stock(key, e);
            if let InventoryError::InsufficientStock { requested, .. } = &err {
                warn!(%key, on_hand, requested, entry_type = %movement.entry_type(), "insufficient stock");
            }
            err
        })?;

        let entry_id = match tx.append(entry.clone()).await {
            Ok(id) => id,
            Err(StoreError::Duplicate(_)) => {
                return Err(InventoryError::DuplicateEffect(Box::new(entry)));
            }
            Err(e) => return Err(e.into()),
        };

        let on_hand = tx.apply_delta(key, movement.delta()).await?;
        if on_hand != expected {
            return Err(StoreError::Conflict(format!(
                "projection for {key} moved to {on_hand}, expected {expected}"
            ))
            .into());
        }

        debug!(
            %key,
            entry_id = %entry_id,
            entry_type = %entry.entry_type,
            qty_change = entry.qty_change,
            on_hand,
            "ledger entry appended"
        );
        Ok(StockChange {
            key,
            entry_id,
            on_hand,
        })
    }

    /// Run `operation` under the transaction timeout.
    pub(crate) async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, InventoryError>>,
    ) -> Result<T, InventoryError> {
        let limit = self.config.transaction_timeout;
        match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis() as u64, "operation timed out, rolled back");
                Err(InventoryError::Timeout(limit))
            }
        }
    }
}

/// Commit on success, roll back on failure.
pub(crate) async fn finish<Tx, T>(tx: Tx, result: Result<T, InventoryError>) -> Result<T, InventoryError>
where
    Tx: StockTransaction,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

fn duplicate_as_validation(err: StoreError) -> InventoryError {
    match err {
        StoreError::Duplicate(msg) => InventoryError::Validation(msg),
        other => other.into(),
    }
}
