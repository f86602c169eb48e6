//! Order fulfillment orchestrator.
//!
//! Owns order status transitions and delegates every stock side effect to the
//! [`InventoryEngine`]. One transition is one store transaction:
//!
//! ```text
//! lock the order row
//!   ↓
//! Order::handle + apply (pure; an empty event list means "already there")
//!   ↓
//! lock the affected stock rows in key order
//!   ↓
//! engine.apply_in per stock step (reference = transition tag / order id)
//!   ↓
//! persist the new status, commit
//! ```
//!
//! Any failure rolls back the whole transition: no partial reservation,
//! release or sale is ever committed. Stock rows are always locked in
//! ascending key order, so two transitions touching overlapping rows cannot
//! deadlock each other.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use stockledger_core::aggregate::execute;
use stockledger_core::{OrderId, VariantId};
use stockledger_inventory::{Reference, StockKey};
use stockledger_orders::{
    CancelPath, Customer, NewOrderLine, Order, OrderCommand, OrderEvent, OrderStatus, PlaceOrder,
};

use crate::engine::{InventoryEngine, StockChange, finish};
use crate::error::InventoryError;
use crate::store::{InventoryStore, StockTransaction};

/// On-hand quantity of one stock row after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub key: StockKey,
    pub on_hand: i64,
}

/// Result of an order transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub order_id: OrderId,
    pub status: OrderStatus,
    /// `false` when the order was already in the target state.
    pub applied: bool,
    /// Stock rows the transition moved (for confirm: every warehouse line's row).
    pub stock: Vec<StockSnapshot>,
}

/// Drives orders through `PENDING → PAID → SHIPPED` (or `CANCELLED`).
#[derive(Debug)]
pub struct OrderFulfillment<S> {
    engine: InventoryEngine<S>,
}

impl<S> Clone for OrderFulfillment<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<S> OrderFulfillment<S> {
    pub fn new(engine: InventoryEngine<S>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &InventoryEngine<S> {
        &self.engine
    }
}

impl<S: InventoryStore> OrderFulfillment<S> {
    /// Place an order in the default warehouse and reserve every warehouse line.
    ///
    /// Fails as a whole if any reservation fails.
    #[instrument(skip(self, customer, lines), fields(line_count = lines.len()), err)]
    pub async fn create_order(
        &self,
        customer: Customer,
        lines: Vec<NewOrderLine>,
    ) -> Result<OrderId, InventoryError> {
        let order_id = OrderId::new();
        let order = self
            .engine
            .bounded(async {
                let mut tx = self.engine.store().begin().await?;
                let result = self.place_in(&mut tx, order_id, customer, lines).await;
                finish(tx, result).await
            })
            .await?;

        info!(
            %order_id,
            warehouse_id = ?order.warehouse_id(),
            total_price = order.total_price(),
            "order created"
        );
        Ok(order_id)
    }

    /// `PENDING → PAID`. Re-checks that every line references a registered
    /// variant and reports the current on-hand of each warehouse line.
    pub async fn confirm_order(&self, order_id: OrderId) -> Result<TransitionOutcome, InventoryError> {
        self.transition(
            order_id,
            OrderCommand::Confirm {
                occurred_at: Utc::now(),
            },
        )
        .await
    }

    /// Cancel from `PENDING` (releases the reservation) or `PAID` (returns stock).
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<TransitionOutcome, InventoryError> {
        self.transition(
            order_id,
            OrderCommand::Cancel {
                path: CancelPath::Customer,
                occurred_at: Utc::now(),
            },
        )
        .await
    }

    /// Back-office cancel: only a `PAID` order, with stock returned.
    pub async fn admin_cancel_order(
        &self,
        order_id: OrderId,
    ) -> Result<TransitionOutcome, InventoryError> {
        self.transition(
            order_id,
            OrderCommand::Cancel {
                path: CancelPath::Admin,
                occurred_at: Utc::now(),
            },
        )
        .await
    }

    /// `PAID → SHIPPED`: release the reservation, then record the sale.
    pub async fn ship_order(&self, order_id: OrderId) -> Result<TransitionOutcome, InventoryError> {
        self.transition(
            order_id,
            OrderCommand::Ship {
                occurred_at: Utc::now(),
            },
        )
        .await
    }

    pub async fn get_order(&self, order_id: OrderId) -> Result<Order, InventoryError> {
        self.engine
            .store()
            .load_order(order_id)
            .await?
            .ok_or(InventoryError::OrderNotFound(order_id))
    }

    #[instrument(skip(self, command), fields(order_id = %order_id), err)]
    async fn transition(
        &self,
        order_id: OrderId,
        command: OrderCommand,
    ) -> Result<TransitionOutcome, InventoryError> {
        self.engine
            .bounded(async {
                let mut tx = self.engine.store().begin().await?;
                let result = self.transition_in(&mut tx, order_id, &command).await;
                finish(tx, result).await
            })
            .await
    }

    async fn place_in(
        &self,
        tx: &mut S::Tx,
        order_id: OrderId,
        customer: Customer,
        lines: Vec<NewOrderLine>,
    ) -> Result<Order, InventoryError> {
        let warehouse = self.engine.resolve_warehouse(tx, None).await?;

        for (idx, line) in lines.iter().enumerate() {
            if let Some(variant_id) = line.variant_id {
                if !is_orderable(&mut *tx, variant_id).await? {
                    return Err(InventoryError::MissingVariant {
                        order_id,
                        line_no: idx as u32 + 1,
                    });
                }
            }
        }

        let mut order = Order::empty(order_id);
        let command = OrderCommand::Place(PlaceOrder {
            order_id,
            warehouse_id: warehouse.id,
            customer,
            lines,
            occurred_at: Utc::now(),
        });
        let events =
            execute(&mut order, &command).map_err(|e| InventoryError::for_order(order_id, e))?;

        self.run_stock_steps(tx, &order, &events).await?;
        tx.insert_order(&order).await?;
        Ok(order)
    }

    async fn transition_in(
        &self,
        tx: &mut S::Tx,
        order_id: OrderId,
        command: &OrderCommand,
    ) -> Result<TransitionOutcome, InventoryError> {
        let mut order = tx
            .lock_order(order_id)
            .await?
            .ok_or(InventoryError::OrderNotFound(order_id))?;
        let previous = order.status();
        let confirming = matches!(command, OrderCommand::Confirm { .. });
        if confirming && previous == OrderStatus::Pending {
            self.check_variants(tx, &order).await?;
        }

        let events =
            execute(&mut order, command).map_err(|e| InventoryError::for_order(order_id, e))?;

        if events.is_empty() {
            info!(%order_id, status = %previous, "order already in target state");
            let stock = if confirming {
                self.line_stock(tx, &order).await?
            } else {
                Vec::new()
            };
            return Ok(TransitionOutcome {
                order_id,
                status: previous,
                applied: false,
                stock,
            });
        }

        let changes = self.run_stock_steps(tx, &order, &events).await?;
        tx.update_order_status(&order).await?;

        let stock = if confirming {
            self.line_stock(tx, &order).await?
        } else {
            snapshots(&changes)
        };

        info!(
            %order_id,
            event = events.first().map(OrderEvent::event_type).unwrap_or_default(),
            from = %previous,
            to = %order.status(),
            ledger_entries = changes.len(),
            "order transition applied"
        );
        Ok(TransitionOutcome {
            order_id,
            status: order.status(),
            applied: true,
            stock,
        })
    }

    /// Apply every stock step of `events` against the order's warehouse.
    ///
    /// Effects already in the ledger (a retried transition) are skipped.
    async fn run_stock_steps(
        &self,
        tx: &mut S::Tx,
        order: &Order,
        events: &[OrderEvent],
    ) -> Result<Vec<StockChange>, InventoryError> {
        let steps: Vec<_> = events
            .iter()
            .flat_map(|e| e.stock_steps(order.lines()))
            .collect();
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        let order_id = order.id_typed();
        let warehouse_id = order.warehouse_id().ok_or_else(|| {
            InventoryError::Validation(format!("order {order_id} has no fulfillment warehouse"))
        })?;

        let mut keys: Vec<StockKey> = steps
            .iter()
            .map(|s| StockKey::new(warehouse_id, s.variant_id))
            .collect();
        keys.sort();
        keys.dedup();
        for key in &keys {
            tx.lock_stock(*key).await?;
        }

        let mut changes = Vec::with_capacity(steps.len());
        for step in steps {
            let key = StockKey::new(warehouse_id, step.variant_id);
            let reference = Reference::new(step.reference_type, order_id);
            match self.engine.apply_in(tx, key, step.movement, reference).await {
                Ok(change) => changes.push(change),
                Err(InventoryError::DuplicateEffect(entry)) => {
                    warn!(
                        %order_id,
                        key = %entry.key,
                        entry_type = %entry.entry_type,
                        reference_type = %entry.reference.reference_type,
                        "stock effect already recorded, skipping"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(changes)
    }

    async fn check_variants(&self, tx: &mut S::Tx, order: &Order) -> Result<(), InventoryError> {
        for line in order.lines() {
            let known = match line.variant_id {
                Some(variant_id) => is_orderable(&mut *tx, variant_id).await?,
                None => false,
            };
            if !known {
                return Err(InventoryError::MissingVariant {
                    order_id: order.id_typed(),
                    line_no: line.line_no,
                });
            }
        }
        Ok(())
    }

    /// Locked on-hand of every stock row the order's warehouse lines use.
    async fn line_stock(
        &self,
        tx: &mut S::Tx,
        order: &Order,
    ) -> Result<Vec<StockSnapshot>, InventoryError> {
        let Some(warehouse_id) = order.warehouse_id() else {
            return Ok(Vec::new());
        };

        let mut keys: Vec<StockKey> = order
            .lines()
            .iter()
            .filter(|l| l.moves_stock())
            .filter_map(|l| l.variant_id)
            .map(|variant_id| StockKey::new(warehouse_id, variant_id))
            .collect();
        keys.sort();
        keys.dedup();

        let mut stock = Vec::with_capacity(keys.len());
        for key in keys {
            let on_hand = tx.lock_stock(key).await?;
            stock.push(StockSnapshot { key, on_hand });
        }
        Ok(stock)
    }
}

/// Registered and active.
async fn is_orderable<Tx: StockTransaction>(
    tx: &mut Tx,
    variant_id: VariantId,
) -> Result<bool, InventoryError> {
    Ok(tx
        .find_variant(variant_id)
        .await?
        .is_some_and(|v| v.active))
}

/// Final on-hand per key, in key order.
fn snapshots(changes: &[StockChange]) -> Vec<StockSnapshot> {
    let latest: BTreeMap<StockKey, i64> = changes.iter().map(|c| (c.key, c.on_hand)).collect();
    latest
        .into_iter()
        .map(|(key, on_hand)| StockSnapshot { key, on_hand })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::InMemoryInventoryStore;
    use stockledger_core::{ProductId, Quantity};
    use stockledger_inventory::{LedgerEntryType, Warehouse};
    use stockledger_orders::FulfillmentType;

    fn qty(n: i64) -> Quantity {
        Quantity::new(n).unwrap()
    }

    async fn setup(stock: i64) -> (OrderFulfillment<InMemoryInventoryStore>, Warehouse, VariantId) {
        let engine = InventoryEngine::in_memory(EngineConfig::default());
        let warehouse = engine.create_warehouse("MAIN", "Main").await.unwrap();
        let variant = engine
            .register_variant(ProductId::new(), "MUG-WHT", 900)
            .await
            .unwrap();
        engine
            .receive(None, variant.id, qty(stock), Reference::new("PO", "po-1"))
            .await
            .unwrap();
        (OrderFulfillment::new(engine), warehouse, variant.id)
    }

    #[tokio::test]
    async fn dropship_and_unresolved_lines_never_touch_stock() {
        let (orders, warehouse, variant) = setup(5).await;
        let dropship = orders
            .engine()
            .register_variant(ProductId::new(), "DROP-1", 100)
            .await
            .unwrap();

        let order_id = orders
            .create_order(
                Customer::default(),
                vec![
                    NewOrderLine::warehouse(variant, qty(2), 900),
                    NewOrderLine {
                        variant_id: Some(dropship.id),
                        quantity: qty(50),
                        unit_price: 100,
                        fulfillment: FulfillmentType::Dropship,
                    },
                ],
            )
            .await
            .unwrap();

        let engine = orders.engine();
        assert_eq!(engine.get_on_hand(warehouse.id, variant).await.unwrap(), 3);
        assert_eq!(engine.get_on_hand(warehouse.id, dropship.id).await.unwrap(), 0);
        assert!(engine.list_ledger(warehouse.id, dropship.id).await.unwrap().is_empty());

        let order = orders.get_order(order_id).await.unwrap();
        assert_eq!(order.total_price(), 2 * 900 + 50 * 100);
        assert_eq!(order.warehouse_id(), Some(warehouse.id));
    }

    #[tokio::test]
    async fn unknown_variant_fails_creation() {
        let (orders, warehouse, variant) = setup(5).await;
        let err = orders
            .create_order(
                Customer::default(),
                vec![
                    NewOrderLine::warehouse(variant, qty(1), 900),
                    NewOrderLine::warehouse(VariantId::new(), qty(1), 900),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::MissingVariant { line_no: 2, .. }));
        assert_eq!(orders.engine().get_on_hand(warehouse.id, variant).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn confirm_rejects_lines_without_variant() {
        let (orders, warehouse, variant) = setup(5).await;
        let order_id = orders
            .create_order(
                Customer::default(),
                vec![
                    NewOrderLine::warehouse(variant, qty(1), 900),
                    NewOrderLine {
                        variant_id: None,
                        quantity: qty(1),
                        unit_price: 500,
                        fulfillment: FulfillmentType::Warehouse,
                    },
                ],
            )
            .await
            .unwrap();

        let err = orders.confirm_order(order_id).await.unwrap_err();
        assert!(matches!(err, InventoryError::MissingVariant { line_no: 2, .. }));
        let order = orders.get_order(order_id).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(orders.engine().get_on_hand(warehouse.id, variant).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn confirm_reports_line_stock() {
        let (orders, warehouse, variant) = setup(10).await;
        let order_id = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(4), 900)])
            .await
            .unwrap();

        let outcome = orders.confirm_order(order_id).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.status, OrderStatus::Paid);
        assert_eq!(
            outcome.stock,
            vec![StockSnapshot {
                key: StockKey::new(warehouse.id, variant),
                on_hand: 6
            }]
        );

        let again = orders.confirm_order(order_id).await.unwrap();
        assert!(!again.applied);
        assert_eq!(again.stock, outcome.stock);
    }

    #[tokio::test]
    async fn admin_cancel_returns_stock_of_paid_orders_only() {
        let (orders, warehouse, variant) = setup(10).await;
        let pending = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(2), 900)])
            .await
            .unwrap();
        let err = orders.admin_cancel_order(pending).await.unwrap_err();
        assert!(matches!(err, InventoryError::InvalidTransition { .. }));

        orders.confirm_order(pending).await.unwrap();
        let outcome = orders.admin_cancel_order(pending).await.unwrap();
        assert_eq!(outcome.status, OrderStatus::Cancelled);
        assert_eq!(outcome.stock[0].on_hand, 10);

        let ledger = orders
            .engine()
            .list_ledger(warehouse.id, variant)
            .await
            .unwrap();
        assert_eq!(ledger[0].entry_type, LedgerEntryType::Return);
        assert_eq!(ledger[0].qty_change, 2);

        // Already cancelled: success without another entry.
        let again = orders.admin_cancel_order(pending).await.unwrap();
        assert!(!again.applied);
        assert_eq!(
            orders.engine().list_ledger(warehouse.id, variant).await.unwrap().len(),
            ledger.len()
        );
    }

    #[tokio::test]
    async fn ship_skips_effects_already_in_the_ledger() {
        let (orders, warehouse, variant) = setup(10).await;
        let order_id = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(3), 900)])
            .await
            .unwrap();
        orders.confirm_order(order_id).await.unwrap();

        // A retried ship whose release already landed.
        orders
            .engine()
            .release(
                None,
                variant,
                qty(3),
                Reference::new(stockledger_orders::reference_types::ORDER_SHIP, order_id),
            )
            .await
            .unwrap();

        let outcome = orders.ship_order(order_id).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.status, OrderStatus::Shipped);

        let ledger = orders
            .engine()
            .list_ledger(warehouse.id, variant)
            .await
            .unwrap();
        let ship_entries: Vec<_> = ledger
            .iter()
            .filter(|e| e.reference.reference_type == "ORDER_SHIP")
            .collect();
        assert_eq!(ship_entries.len(), 2);
        assert_eq!(
            ship_entries
                .iter()
                .filter(|e| e.entry_type == LedgerEntryType::Release)
                .count(),
            1
        );
        assert_eq!(ledger[0].entry_type, LedgerEntryType::SaleOut);
        assert_eq!(ledger[0].qty_change, -3);
        assert_eq!(orders.engine().get_on_hand(warehouse.id, variant).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn overflowing_total_fails_creation_without_reserving() {
        let (orders, warehouse, variant) = setup(5).await;
        let err = orders
            .create_order(
                Customer::default(),
                vec![
                    NewOrderLine::warehouse(variant, qty(1), u64::MAX),
                    NewOrderLine::warehouse(variant, qty(1), 1),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::Validation(_)));
        assert_eq!(orders.engine().get_on_hand(warehouse.id, variant).await.unwrap(), 5);
        assert_eq!(
            orders.engine().list_ledger(warehouse.id, variant).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn deactivated_variant_cannot_be_ordered_or_confirmed() {
        let (orders, warehouse, variant) = setup(5).await;
        let order_id = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(2), 900)])
            .await
            .unwrap();

        orders.engine().set_variant_active(variant, false).await.unwrap();
        let err = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(1), 900)])
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::MissingVariant { line_no: 1, .. }));

        let err = orders.confirm_order(order_id).await.unwrap_err();
        assert!(matches!(err, InventoryError::MissingVariant { line_no: 1, .. }));
        assert_eq!(orders.get_order(order_id).await.unwrap().status(), OrderStatus::Pending);

        // Releasing stock of an existing order still works.
        let outcome = orders.cancel_order(order_id).await.unwrap();
        assert_eq!(outcome.status, OrderStatus::Cancelled);
        assert_eq!(orders.engine().get_on_hand(warehouse.id, variant).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let (orders, _, _) = setup(1).await;
        let missing = OrderId::new();
        assert!(matches!(
            orders.ship_order(missing).await.unwrap_err(),
            InventoryError::OrderNotFound(id) if id == missing
        ));
        assert!(matches!(
            orders.get_order(missing).await.unwrap_err(),
            InventoryError::OrderNotFound(_)
        ));
    }

    #[tokio::test]
    async fn no_warehouse_fails_creation() {
        let engine = InventoryEngine::in_memory(EngineConfig::default());
        let variant = engine
            .register_variant(ProductId::new(), "MUG-WHT", 900)
            .await
            .unwrap();
        let orders = OrderFulfillment::new(engine);

        let err = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant.id, qty(1), 900)])
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NoWarehouseConfigured));
    }
}
