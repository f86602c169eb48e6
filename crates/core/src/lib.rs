//! Domain foundation: typed ids, quantities, errors and aggregate traits.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, quantities, the domain error model and the aggregate traits
//! shared by the inventory and order crates.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot};
pub use error::{DomainError, DomainResult};
pub use id::{OrderId, ProductId, VariantId, WarehouseId};
pub use value_object::{Quantity, ValueObject};
