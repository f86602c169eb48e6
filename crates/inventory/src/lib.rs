//! Inventory ledger domain module.
//!
//! Business rules for per-warehouse, per-variant stock, implemented purely as
//! deterministic domain logic (no IO, no locking, no storage). Stock is never
//! stored as ground truth: it is the sum of immutable ledger entries, and the
//! rules here decide which entry a movement produces and whether it is allowed.

pub mod ledger;
pub mod movement;
pub mod variant;
pub mod warehouse;

pub use ledger::{
    EntryId, LedgerEntry, LedgerEntryType, NewLedgerEntry, Reference, StockKey, net_change,
};
pub use movement::StockMovement;
pub use variant::Variant;
pub use warehouse::{DEFAULT_WAREHOUSE_CODES, Warehouse, resolve_default};
