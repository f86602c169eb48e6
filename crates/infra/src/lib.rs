//! Infrastructure layer: stock storage, the inventory engine and order fulfillment.
//!
//! Domain crates stay pure; everything that touches a transaction, a lock or
//! a clock lives here.

pub mod config;
pub mod engine;
pub mod error;
pub mod fulfillment;
pub mod ledger_scan;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, EngineConfig};
pub use engine::{InventoryEngine, Reconciliation, StockChange};
pub use error::{InventoryError, StoreError};
pub use fulfillment::{OrderFulfillment, StockSnapshot, TransitionOutcome};
pub use ledger_scan::LedgerScan;
pub use store::{
    InMemoryInventoryStore, InventoryStore, LedgerPage, Pagination, PostgresInventoryStore,
    StockLevel, StockTransaction,
};
