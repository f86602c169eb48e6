//! Storage for the ledger, the stock projection, the catalog and orders.
//!
//! Two backends implement the same transactional contract:
//!
//! - [`InMemoryInventoryStore`]: process-local, for tests and embedding.
//! - [`PostgresInventoryStore`]: `sqlx`/PostgreSQL, row locks via `SELECT ... FOR UPDATE`.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::{InMemoryInventoryStore, InMemoryTransaction};
pub use postgres::{PostgresInventoryStore, PostgresTransaction};
pub use query::{LedgerPage, Pagination, StockLevel};
pub use r#trait::{InventoryStore, StockTransaction};
