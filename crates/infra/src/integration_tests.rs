//! Integration tests for the full stock pipeline.
//!
//! Tests: OrderFulfillment → InventoryEngine → InventoryStore (in memory)
//!
//! Verifies:
//! - Order scenarios leave the expected ledger trail
//! - Concurrent callers never drive stock negative
//! - The projection always equals the ledger sum

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use stockledger_core::{ProductId, Quantity, VariantId};
    use stockledger_inventory::{LedgerEntryType, Reference, Warehouse, net_change};
    use stockledger_orders::{Customer, NewOrderLine, OrderStatus};

    use crate::config::EngineConfig;
    use crate::engine::InventoryEngine;
    use crate::error::InventoryError;
    use crate::fulfillment::OrderFulfillment;
    use crate::store::InMemoryInventoryStore;

    type Engine = InventoryEngine<InMemoryInventoryStore>;

    fn qty(n: i64) -> Quantity {
        Quantity::new(n).unwrap()
    }

    /// Warehouse W with 10 units of variant V, from one PURCHASE_IN of +10.
    async fn stocked(units: i64) -> (Engine, Warehouse, VariantId) {
        let engine = InventoryEngine::in_memory(EngineConfig::default());
        let warehouse = engine.create_warehouse("YYCOM_MAIN", "Main").await.unwrap();
        let variant = engine
            .register_variant(ProductId::new(), "TEE-BLK-M", 2500)
            .await
            .unwrap();
        engine
            .receive(None, variant.id, qty(units), Reference::new("PO", "po-100"))
            .await
            .unwrap();
        (engine, warehouse, variant.id)
    }

    async fn assert_projection_matches_ledger(engine: &Engine, warehouse: &Warehouse, variant: VariantId) {
        let on_hand = engine.get_on_hand(warehouse.id, variant).await.unwrap();
        let ledger = engine.list_ledger(warehouse.id, variant).await.unwrap();
        assert_eq!(on_hand, net_change(&ledger));
        assert!(on_hand >= 0);
    }

    fn ledger_shape(entries: &[stockledger_inventory::LedgerEntry]) -> Vec<(LedgerEntryType, i64)> {
        // Oldest first.
        entries.iter().rev().map(|e| (e.entry_type, e.qty_change)).collect()
    }

    #[tokio::test]
    async fn reservation_blocks_a_second_order_then_cancel_releases_it() {
        let (engine, warehouse, variant) = stocked(10).await;
        let orders = OrderFulfillment::new(engine.clone());

        let first = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(7), 2500)])
            .await
            .unwrap();
        assert_eq!(engine.get_on_hand(warehouse.id, variant).await.unwrap(), 3);

        let err = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(5), 2500)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InventoryError::InsufficientStock {
                on_hand: 3,
                requested: 5,
                ..
            }
        ));
        assert_eq!(engine.get_on_hand(warehouse.id, variant).await.unwrap(), 3);

        let ledger = engine.list_ledger(warehouse.id, variant).await.unwrap();
        assert_eq!(
            ledger_shape(&ledger),
            vec![(LedgerEntryType::PurchaseIn, 10), (LedgerEntryType::Reserve, -7)]
        );
        assert_eq!(ledger[0].reference.reference_type, "ORDER_RESERVE");
        assert_eq!(ledger[0].reference.reference_id, first.to_string());

        let outcome = orders.cancel_order(first).await.unwrap();
        assert_eq!(outcome.status, OrderStatus::Cancelled);
        assert_eq!(engine.get_on_hand(warehouse.id, variant).await.unwrap(), 10);

        let ledger = engine.list_ledger(warehouse.id, variant).await.unwrap();
        assert_eq!(ledger[0].entry_type, LedgerEntryType::Release);
        assert_eq!(ledger[0].qty_change, 7);
        assert_eq!(ledger[0].reference.reference_type, "ORDER_CANCEL");

        let err = orders.confirm_order(first).await.unwrap_err();
        match err {
            InventoryError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "CANCELLED");
                assert_eq!(to, "PAID");
            }
            other => panic!("expected InvalidTransition, got {other}"),
        }
        assert_projection_matches_ledger(&engine, &warehouse, variant).await;
    }

    #[tokio::test]
    async fn confirm_then_ship_records_reserve_release_sale() {
        let (engine, warehouse, variant) = stocked(10).await;
        let orders = OrderFulfillment::new(engine.clone());

        let order_id = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(3), 2500)])
            .await
            .unwrap();
        orders.confirm_order(order_id).await.unwrap();
        let shipped = orders.ship_order(order_id).await.unwrap();

        assert_eq!(shipped.status, OrderStatus::Shipped);
        assert_eq!(shipped.stock[0].on_hand, 7);
        assert_eq!(engine.get_on_hand(warehouse.id, variant).await.unwrap(), 7);

        let ledger = engine.list_ledger(warehouse.id, variant).await.unwrap();
        assert_eq!(
            ledger_shape(&ledger),
            vec![
                (LedgerEntryType::PurchaseIn, 10),
                (LedgerEntryType::Reserve, -3),
                (LedgerEntryType::Release, 3),
                (LedgerEntryType::SaleOut, -3),
            ]
        );

        // Terminal: a second ship is a no-op, cancel is refused.
        assert!(!orders.ship_order(order_id).await.unwrap().applied);
        assert!(matches!(
            orders.cancel_order(order_id).await.unwrap_err(),
            InventoryError::InvalidTransition { .. }
        ));
        assert_eq!(engine.list_ledger(warehouse.id, variant).await.unwrap().len(), 4);
        assert_projection_matches_ledger(&engine, &warehouse, variant).await;
    }

    #[tokio::test]
    async fn confirm_twice_leaves_identical_ledger() {
        let (engine, warehouse, variant) = stocked(10).await;
        let orders = OrderFulfillment::new(engine.clone());
        let order_id = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(2), 2500)])
            .await
            .unwrap();

        let first = orders.confirm_order(order_id).await.unwrap();
        let after_first = engine.list_ledger(warehouse.id, variant).await.unwrap();
        let second = orders.confirm_order(order_id).await.unwrap();
        let after_second = engine.list_ledger(warehouse.id, variant).await.unwrap();

        assert!(first.applied);
        assert!(!second.applied);
        assert_eq!(second.status, OrderStatus::Paid);
        assert_eq!(after_first, after_second);
        assert_eq!(orders.get_order(order_id).await.unwrap().status(), OrderStatus::Paid);
    }

    #[tokio::test]
    async fn reserve_then_release_round_trips() {
        let (engine, warehouse, variant) = stocked(10).await;
        let before = engine.get_on_hand(warehouse.id, variant).await.unwrap();
        let entries_before = engine.list_ledger(warehouse.id, variant).await.unwrap().len();

        let reference = Reference::new("HOLD", "hold-1");
        engine
            .reserve(None, variant, qty(4), reference.clone())
            .await
            .unwrap();
        let after = engine
            .release(None, variant, qty(4), reference)
            .await
            .unwrap();

        assert_eq!(after, before);
        let ledger = engine.list_ledger(warehouse.id, variant).await.unwrap();
        assert_eq!(ledger.len(), entries_before + 2);
        assert_eq!(net_change(&ledger[..2]), 0);
    }

    #[tokio::test]
    async fn multi_line_order_fails_as_a_whole() {
        let (engine, warehouse, plenty) = stocked(10).await;
        let scarce = engine
            .register_variant(ProductId::new(), "TEE-BLK-L", 2500)
            .await
            .unwrap()
            .id;
        engine
            .receive(None, scarce, qty(1), Reference::new("PO", "po-101"))
            .await
            .unwrap();
        let orders = OrderFulfillment::new(engine.clone());

        let err = orders
            .create_order(
                Customer::default(),
                vec![
                    NewOrderLine::warehouse(plenty, qty(2), 2500),
                    NewOrderLine::warehouse(scarce, qty(2), 2500),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::InsufficientStock { .. }));

        assert_eq!(engine.get_on_hand(warehouse.id, plenty).await.unwrap(), 10);
        assert_eq!(engine.get_on_hand(warehouse.id, scarce).await.unwrap(), 1);
        assert_eq!(engine.list_ledger(warehouse.id, plenty).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_variant_lines_reserve_their_total() {
        let (engine, warehouse, variant) = stocked(10).await;
        let orders = OrderFulfillment::new(engine.clone());

        let order_id = orders
            .create_order(
                Customer::default(),
                vec![
                    NewOrderLine::warehouse(variant, qty(2), 2500),
                    NewOrderLine::warehouse(variant, qty(2), 2000),
                ],
            )
            .await
            .unwrap();
        assert_eq!(engine.get_on_hand(warehouse.id, variant).await.unwrap(), 6);

        orders.confirm_order(order_id).await.unwrap();
        orders.ship_order(order_id).await.unwrap();
        let ledger = engine.list_ledger(warehouse.id, variant).await.unwrap();
        assert_eq!(
            ledger_shape(&ledger),
            vec![
                (LedgerEntryType::PurchaseIn, 10),
                (LedgerEntryType::Reserve, -4),
                (LedgerEntryType::Release, 4),
                (LedgerEntryType::SaleOut, -4),
            ]
        );
        assert_eq!(orders.get_order(order_id).await.unwrap().total_price(), 9000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sells_exhaust_stock_exactly() {
        let (engine, warehouse, variant) = stocked(10).await;

        let mut handles = Vec::new();
        for n in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .sell(None, variant, qty(3), Reference::new("POS", format!("sale-{n}")))
                    .await
            }));
        }

        let mut sold = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => sold += 1,
                Err(InventoryError::InsufficientStock { .. }) => refused += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(sold, 3);
        assert_eq!(refused, 5);
        assert_eq!(engine.get_on_hand(warehouse.id, variant).await.unwrap(), 1);
        assert_projection_matches_ledger(&engine, &warehouse, variant).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_orders_share_one_stock_pool() {
        let (engine, warehouse, variant) = stocked(10).await;
        let orders = Arc::new(OrderFulfillment::new(engine.clone()));

        let a = {
            let orders = Arc::clone(&orders);
            tokio::spawn(async move {
                orders
                    .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(7), 2500)])
                    .await
            })
        };
        let b = {
            let orders = Arc::clone(&orders);
            tokio::spawn(async move {
                orders
                    .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(5), 2500)])
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let placed = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(placed, 1);
        assert!(results.iter().any(|r| matches!(r, Err(InventoryError::InsufficientStock { .. }))));

        let on_hand = engine.get_on_hand(warehouse.id, variant).await.unwrap();
        assert!(on_hand == 3 || on_hand == 5);
        assert_projection_matches_ledger(&engine, &warehouse, variant).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_on_one_order_apply_once() {
        let (engine, warehouse, variant) = stocked(10).await;
        let orders = Arc::new(OrderFulfillment::new(engine.clone()));
        let order_id = orders
            .create_order(Customer::default(), vec![NewOrderLine::warehouse(variant, qty(6), 2500)])
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let orders = Arc::clone(&orders);
            handles.push(tokio::spawn(async move { orders.cancel_order(order_id).await }));
        }
        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().applied {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(engine.get_on_hand(warehouse.id, variant).await.unwrap(), 10);
        assert_eq!(engine.list_ledger(warehouse.id, variant).await.unwrap().len(), 3);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive(i64),
        Sell(i64),
        Reserve(i64),
        Release(i64),
        Return(i64),
        Adjust(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..20).prop_map(Op::Receive),
            (1i64..20).prop_map(Op::Sell),
            (1i64..20).prop_map(Op::Reserve),
            (1i64..20).prop_map(Op::Release),
            (1i64..20).prop_map(Op::Return),
            (-20i64..20).prop_map(Op::Adjust),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: after any sequence of operations, successful or not, the
        /// projection equals the ledger sum and never goes negative.
        #[test]
        fn projection_always_equals_ledger_sum(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            rt.block_on(async {
                let engine = InventoryEngine::in_memory(EngineConfig::default());
                let warehouse = engine.create_warehouse("MAIN", "Main").await.unwrap();
                let variant = engine
                    .register_variant(ProductId::new(), "SKU-1", 100)
                    .await
                    .unwrap()
                    .id;

                let mut expected = 0i64;
                for (n, op) in ops.into_iter().enumerate() {
                    let reference = Reference::new("PROP", n);
                    let result = match op {
                        Op::Receive(q) => engine.receive(None, variant, qty(q), reference).await,
                        Op::Sell(q) => engine.sell(None, variant, qty(q), reference).await,
                        Op::Reserve(q) => engine.reserve(None, variant, qty(q), reference).await,
                        Op::Release(q) => engine.release(None, variant, qty(q), reference).await,
                        Op::Return(q) => engine.return_stock(None, variant, qty(q), reference).await,
                        Op::Adjust(d) => engine.adjust(None, variant, d, reference).await,
                    };
                    match result {
                        Ok(on_hand) => expected = on_hand,
                        Err(err) => assert!(err.is_user_correctable(), "unexpected error: {err}"),
                    }

                    let on_hand = engine.get_on_hand(warehouse.id, variant).await.unwrap();
                    assert_eq!(on_hand, expected);
                    assert!(on_hand >= 0);
                }

                let report = engine.reconcile(warehouse.id, variant).await.unwrap();
                assert!(report.is_consistent());
                assert_projection_matches_ledger(&engine, &warehouse, variant).await;
            });
        }
    }
}
