//! Error taxonomy for the engine and the fulfillment orchestrator.
//!
//! Two layers:
//!
//! - [`StoreError`]: storage failures (duplicate keys, lock waits, backend errors).
//!   Both backends map their native failures into it.
//! - [`InventoryError`]: what callers of the engine and orchestrator see. Domain
//!   rule violations (insufficient stock, illegal transitions) are translated here
//!   with the context (stock key, order id) the pure domain layer does not carry.

use std::time::Duration;

use thiserror::Error;

use stockledger_core::{DomainError, OrderId, VariantId, WarehouseId};
use stockledger_inventory::{NewLedgerEntry, StockKey};

/// Storage operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness guarantee rejected the write (idempotency tuple, warehouse code, sku).
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Waiting for a row lock exceeded the configured bound.
    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The store refused the operation in its current state (e.g. a write to an unlocked row).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Error returned by [`crate::engine::InventoryEngine`] and
/// [`crate::fulfillment::OrderFulfillment`].
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("insufficient stock for {key}: on hand {on_hand}, requested {requested}")]
    InsufficientStock {
        key: StockKey,
        on_hand: i64,
        requested: i64,
    },

    #[error("order {order_id}: invalid transition from {from} to {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: String,
        to: String,
    },

    #[error("order {order_id}: line {line_no} does not reference a known variant")]
    MissingVariant { order_id: OrderId, line_no: u32 },

    #[error("no active warehouse is configured")]
    NoWarehouseConfigured,

    /// The same effect (key, change, type, reference) is already in the ledger.
    #[error("ledger already contains this effect: {} {} for {}/{} on {}", .0.entry_type, .0.qty_change, .0.reference.reference_type, .0.reference.reference_id, .0.key)]
    DuplicateEffect(Box<NewLedgerEntry>),

    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("unknown variant: {0}")]
    UnknownVariant(VariantId),

    #[error("unknown or inactive warehouse: {0}")]
    UnknownWarehouse(WarehouseId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InventoryError {
    /// Whether the caller may retry the same request unchanged.
    ///
    /// Retries are always safe: a repeated effect is caught by the ledger's
    /// idempotency tuple.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InventoryError::Timeout(_)
                | InventoryError::Store(StoreError::LockTimeout(_))
                | InventoryError::Store(StoreError::Conflict(_))
        )
    }

    /// Whether the failure is a business rule the end user can act on.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            InventoryError::InsufficientStock { .. } | InventoryError::Validation(_)
        )
    }

    /// Translate a domain error raised for a stock row.
    pub(crate) fn for_stock(key: StockKey, err: DomainError) -> Self {
        match err {
            DomainError::InsufficientStock { on_hand, requested } => {
                InventoryError::InsufficientStock {
                    key,
                    on_hand,
                    requested,
                }
            }
            other => InventoryError::Validation(other.to_string()),
        }
    }

    /// Translate a domain error raised by the order aggregate.
    pub(crate) fn for_order(order_id: OrderId, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to } => InventoryError::InvalidTransition {
                order_id,
                from,
                to,
            },
            DomainError::MissingVariant { line_no } => {
                InventoryError::MissingVariant { order_id, line_no }
            }
            DomainError::NotFound => InventoryError::OrderNotFound(order_id),
            other => InventoryError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_pick_up_context() {
        let key = StockKey::new(WarehouseId::new(), VariantId::new());
        let err = InventoryError::for_stock(key, DomainError::insufficient_stock(2, 5));
        assert!(matches!(
            err,
            InventoryError::InsufficientStock { on_hand: 2, requested: 5, key: k } if k == key
        ));
        assert!(err.is_user_correctable());
        assert!(!err.is_retryable());

        let order_id = OrderId::new();
        let err = InventoryError::for_order(
            order_id,
            DomainError::invalid_transition("CANCELLED", "PAID"),
        );
        assert!(matches!(
            &err,
            InventoryError::InvalidTransition { from, to, .. } if from == "CANCELLED" && to == "PAID"
        ));
        assert!(err.to_string().contains(&order_id.to_string()));

        let err = InventoryError::for_order(order_id, DomainError::MissingVariant { line_no: 2 });
        assert!(matches!(err, InventoryError::MissingVariant { line_no: 2, .. }));
    }

    #[test]
    fn lock_waits_are_retryable() {
        let err = InventoryError::from(StoreError::LockTimeout("stock row".into()));
        assert!(err.is_retryable());
        assert!(!err.is_user_correctable());
    }
}
