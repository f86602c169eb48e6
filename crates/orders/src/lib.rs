//! Order fulfillment domain module.
//!
//! The `Order` aggregate owns the status state machine
//! (`PENDING → PAID → SHIPPED`, with cancellation from `PENDING` or `PAID`) and
//! decides, per transition, which stock movements its warehouse lines require.
//! Executing those movements is left to the infrastructure layer.

pub mod order;

pub use order::{
    CancelPath, Customer, FulfillmentType, NewOrderLine, Order, OrderCancelled, OrderCommand,
    OrderConfirmed, OrderEvent, OrderLine, OrderPlaced, OrderShipped, OrderStatus, PlaceOrder, StockStep,
    reference_types,
};
