//! `stockledger` administration CLI.
//!
//! Every command runs against Postgres and prints JSON on stdout. Logs go to
//! stderr (see `RUST_LOG` and `STOCKLEDGER_LOG_FORMAT`).

mod args;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{Value, json};

use stockledger_core::{OrderId, ProductId, Quantity, VariantId, WarehouseId};
use stockledger_infra::{
    EngineConfig, InventoryEngine, InventoryStore, OrderFulfillment, Pagination,
    PostgresInventoryStore,
};
use stockledger_inventory::{EntryId, Reference, StockKey};
use stockledger_orders::{Customer, Order};

use args::{Cli, Command, Movement, OrderCommand, StockTarget, VariantCommand, WarehouseCommand};

type Engine = InventoryEngine<PostgresInventoryStore>;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    stockledger_observability::init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env().context("invalid configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    let database_url = config
        .database_url
        .clone()
        .context("database URL not provided; use --database-url or set DATABASE_URL")?;

    let store = PostgresInventoryStore::connect(&database_url, config.transaction_timeout)
        .await
        .context("failed to connect to database")?;
    tracing::debug!(
        transaction_timeout_ms = config.transaction_timeout.as_millis() as u64,
        "connected"
    );
    let engine = InventoryEngine::new(store, config);

    let output = run(&engine, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(engine: &Engine, command: Command) -> Result<Value> {
    Ok(match command {
        Command::Schema => {
            engine.store().ensure_schema().await?;
            json!({ "schema": "ok" })
        }
        Command::Warehouse(cmd) => warehouse(engine, cmd).await?,
        Command::Variant(cmd) => variant(engine, cmd).await?,

        Command::Receive(m) => {
            let (w, v, q, r) = movement_parts(m);
            on_hand_json(engine.receive(w, v, q, r).await?)
        }
        Command::Sell(m) => {
            let (w, v, q, r) = movement_parts(m);
            on_hand_json(engine.sell(w, v, q, r).await?)
        }
        Command::Reserve(m) => {
            let (w, v, q, r) = movement_parts(m);
            on_hand_json(engine.reserve(w, v, q, r).await?)
        }
        Command::Release(m) => {
            let (w, v, q, r) = movement_parts(m);
            on_hand_json(engine.release(w, v, q, r).await?)
        }
        Command::Return(m) => {
            let (w, v, q, r) = movement_parts(m);
            on_hand_json(engine.return_stock(w, v, q, r).await?)
        }
        Command::Adjust {
            target,
            delta,
            reference,
        } => {
            let reference = Reference::new(reference.reference_type, reference.reference_id);
            on_hand_json(
                engine
                    .adjust(
                        target.warehouse.map(WarehouseId::from),
                        VariantId::from(target.variant),
                        delta,
                        reference,
                    )
                    .await?,
            )
        }

        Command::OnHand(target) => {
            let key = resolve_key(engine, &target).await?;
            json!({ "key": key, "on_hand": engine.get_on_hand(key.warehouse_id, key.variant_id).await? })
        }
        Command::Ledger {
            target,
            limit,
            before,
        } => {
            let key = resolve_key(engine, &target).await?;
            let page = engine
                .store()
                .ledger_page(key, Pagination::new(limit, before.map(EntryId)))
                .await?;
            serde_json::to_value(page)?
        }
        Command::Stock { warehouse } => {
            let warehouse = match warehouse {
                Some(id) => WarehouseId::from(id),
                None => engine.default_warehouse().await?.id,
            };
            serde_json::to_value(engine.list_stock(warehouse).await?)?
        }
        Command::Verify(target) => {
            let key = resolve_key(engine, &target).await?;
            let report = engine.reconcile(key.warehouse_id, key.variant_id).await?;
            json!({
                "key": report.key,
                "projected": report.projected,
                "ledger_sum": report.ledger_sum,
                "drift": report.drift(),
                "consistent": report.is_consistent(),
            })
        }
        Command::InitInventory { warehouse } => {
            let created = engine
                .init_inventory(warehouse.map(WarehouseId::from))
                .await?;
            json!({ "created": created })
        }

        Command::Order(cmd) => order(engine, cmd).await?,
    })
}

async fn warehouse(engine: &Engine, command: WarehouseCommand) -> Result<Value> {
    Ok(match command {
        WarehouseCommand::Create { code, name } => {
            serde_json::to_value(engine.create_warehouse(&code, &name).await?)?
        }
        WarehouseCommand::List => serde_json::to_value(engine.warehouses().await?)?,
        WarehouseCommand::Default => serde_json::to_value(engine.default_warehouse().await?)?,
        WarehouseCommand::Deactivate { id } => {
            engine.set_warehouse_active(id.into(), false).await?;
            json!({ "id": id, "active": false })
        }
        WarehouseCommand::Activate { id } => {
            engine.set_warehouse_active(id.into(), true).await?;
            json!({ "id": id, "active": true })
        }
    })
}

async fn variant(engine: &Engine, command: VariantCommand) -> Result<Value> {
    Ok(match command {
        VariantCommand::Register {
            sku,
            price,
            product,
        } => {
            let product_id = product.map(ProductId::from).unwrap_or_default();
            serde_json::to_value(engine.register_variant(product_id, &sku, price).await?)?
        }
        VariantCommand::List => serde_json::to_value(engine.variants().await?)?,
        VariantCommand::Deactivate { id } => {
            engine.set_variant_active(id.into(), false).await?;
            json!({ "id": id, "active": false })
        }
        VariantCommand::Activate { id } => {
            engine.set_variant_active(id.into(), true).await?;
            json!({ "id": id, "active": true })
        }
    })
}

async fn order(engine: &Engine, command: OrderCommand) -> Result<Value> {
    let orders = OrderFulfillment::new(engine.clone());
    Ok(match command {
        OrderCommand::Create {
            lines,
            name,
            phone,
            address,
        } => {
            let customer = Customer {
                name,
                phone,
                address,
            };
            let order_id = orders.create_order(customer, lines).await?;
            order_json(&orders.get_order(order_id).await?)
        }
        OrderCommand::Confirm { id } => serde_json::to_value(orders.confirm_order(id.into()).await?)?,
        OrderCommand::Cancel { id } => serde_json::to_value(orders.cancel_order(id.into()).await?)?,
        OrderCommand::AdminCancel { id } => {
            serde_json::to_value(orders.admin_cancel_order(id.into()).await?)?
        }
        OrderCommand::Ship { id } => serde_json::to_value(orders.ship_order(id.into()).await?)?,
        OrderCommand::Show { id } => order_json(&orders.get_order(OrderId::from(id)).await?),
    })
}

fn movement_parts(m: Movement) -> (Option<WarehouseId>, VariantId, Quantity, Reference) {
    (
        m.target.warehouse.map(WarehouseId::from),
        VariantId::from(m.target.variant),
        m.qty,
        Reference::new(m.reference.reference_type, m.reference.reference_id),
    )
}

async fn resolve_key(engine: &Engine, target: &StockTarget) -> Result<StockKey> {
    let warehouse_id = match target.warehouse {
        Some(id) => WarehouseId::from(id),
        None => engine.default_warehouse().await?.id,
    };
    Ok(StockKey::new(warehouse_id, VariantId::from(target.variant)))
}

fn on_hand_json(on_hand: i64) -> Value {
    json!({ "on_hand": on_hand })
}

fn order_json(order: &Order) -> Value {
    json!({
        "id": order.id_typed(),
        "status": order.status(),
        "warehouse_id": order.warehouse_id(),
        "customer": order.customer(),
        "lines": order.lines(),
        "total_price": order.total_price(),
        "created_at": order.created_at(),
    })
}
