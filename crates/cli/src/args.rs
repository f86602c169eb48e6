//! Command-line surface.

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use stockledger_core::{Quantity, VariantId};
use stockledger_orders::{FulfillmentType, NewOrderLine};

#[derive(Parser)]
#[command(name = "stockledger")]
#[command(about = "Inventory ledger and order fulfillment administration")]
#[command(version)]
pub struct Cli {
    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create tables, indexes and the append-only ledger trigger
    Schema,

    /// Manage warehouses
    #[command(subcommand)]
    Warehouse(WarehouseCommand),

    /// Manage the variant catalog
    #[command(subcommand)]
    Variant(VariantCommand),

    /// PURCHASE_IN: add received stock
    Receive(Movement),
    /// SALE_OUT: remove sold stock
    Sell(Movement),
    /// RESERVE: hold stock
    Reserve(Movement),
    /// RELEASE: give back held stock
    Release(Movement),
    /// RETURN: add returned stock
    Return(Movement),

    /// ADJUST: signed correction
    Adjust {
        #[command(flatten)]
        target: StockTarget,
        /// Signed, non-zero delta
        #[arg(long, allow_hyphen_values = true)]
        delta: i64,
        #[command(flatten)]
        reference: ReferenceArgs,
    },

    /// Current on-hand quantity of one stock row
    OnHand(StockTarget),

    /// Ledger entries of one stock row, newest first
    Ledger {
        #[command(flatten)]
        target: StockTarget,
        #[arg(long)]
        limit: Option<u32>,
        /// Only entries older than this entry id
        #[arg(long)]
        before: Option<u64>,
    },

    /// All stock rows of a warehouse
    Stock {
        /// Warehouse id (default warehouse when omitted)
        #[arg(long)]
        warehouse: Option<Uuid>,
    },

    /// Compare the projection with the ledger sum
    Verify(StockTarget),

    /// Create zero rows for every registered variant
    InitInventory {
        #[arg(long)]
        warehouse: Option<Uuid>,
    },

    /// Order fulfillment
    #[command(subcommand)]
    Order(OrderCommand),
}

#[derive(Subcommand)]
pub enum WarehouseCommand {
    Create { code: String, name: String },
    List,
    /// Show the warehouse used when none is named
    Default,
    Deactivate { id: Uuid },
    Activate { id: Uuid },
}

#[derive(Subcommand)]
pub enum VariantCommand {
    Register {
        sku: String,
        /// Price in the smallest currency unit
        price: u64,
        /// Owning product id (a new one when omitted)
        #[arg(long)]
        product: Option<Uuid>,
    },
    List,
    /// Stop accepting stock movements and orders for a variant
    Deactivate { id: Uuid },
    Activate { id: Uuid },
}

#[derive(Subcommand)]
pub enum OrderCommand {
    /// Place an order and reserve its warehouse lines
    Create {
        /// VARIANT:QTY:UNIT_PRICE[:dropship], repeatable
        #[arg(long = "line", required = true, value_parser = parse_line)]
        lines: Vec<NewOrderLine>,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        address: String,
    },
    Confirm { id: Uuid },
    Cancel { id: Uuid },
    /// Cancel a paid order from the back office
    AdminCancel { id: Uuid },
    Ship { id: Uuid },
    Show { id: Uuid },
}

#[derive(Args)]
pub struct StockTarget {
    /// Warehouse id (default warehouse when omitted)
    #[arg(long)]
    pub warehouse: Option<Uuid>,
    #[arg(long)]
    pub variant: Uuid,
}

#[derive(Args)]
pub struct ReferenceArgs {
    #[arg(long = "ref-type")]
    pub reference_type: String,
    #[arg(long = "ref-id")]
    pub reference_id: String,
}

#[derive(Args)]
pub struct Movement {
    #[command(flatten)]
    pub target: StockTarget,
    #[arg(long, value_parser = parse_quantity)]
    pub qty: Quantity,
    #[command(flatten)]
    pub reference: ReferenceArgs,
}

fn parse_quantity(raw: &str) -> Result<Quantity, String> {
    let n: i64 = raw.parse().map_err(|e| format!("{raw:?}: {e}"))?;
    Quantity::new(n).map_err(|e| e.to_string())
}

fn parse_line(raw: &str) -> Result<NewOrderLine, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(format!("{raw:?}: expected VARIANT:QTY:UNIT_PRICE[:dropship]"));
    }

    let variant_id = match parts[0] {
        "" | "-" => None,
        id => Some(VariantId::from(
            Uuid::parse_str(id).map_err(|e| format!("{id:?}: {e}"))?,
        )),
    };
    let quantity = parse_quantity(parts[1])?;
    let unit_price: u64 = parts[2]
        .parse()
        .map_err(|e| format!("{:?}: {e}", parts[2]))?;
    let fulfillment = match parts.get(3) {
        None => FulfillmentType::Warehouse,
        Some(kind) => FulfillmentType::parse(&kind.to_ascii_uppercase())
            .ok_or_else(|| format!("{kind:?}: expected warehouse or dropship"))?,
    };

    Ok(NewOrderLine {
        variant_id,
        quantity,
        unit_price,
        fulfillment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_order_lines() {
        let id = Uuid::now_v7();
        let line = parse_line(&format!("{id}:3:1500")).unwrap();
        assert_eq!(line.variant_id, Some(VariantId::from(id)));
        assert_eq!(line.quantity.get(), 3);
        assert_eq!(line.unit_price, 1500);
        assert_eq!(line.fulfillment, FulfillmentType::Warehouse);

        let dropship = parse_line(&format!("{id}:1:99:dropship")).unwrap();
        assert_eq!(dropship.fulfillment, FulfillmentType::Dropship);

        let unresolved = parse_line("-:2:10").unwrap();
        assert_eq!(unresolved.variant_id, None);
    }

    #[test]
    fn rejects_malformed_lines() {
        let id = Uuid::now_v7();
        assert!(parse_line("nope").is_err());
        assert!(parse_line(&format!("{id}:0:10")).is_err());
        assert!(parse_line(&format!("{id}:2:-1")).is_err());
        assert!(parse_line(&format!("{id}:2:10:courier")).is_err());
    }

    #[test]
    fn parses_variant_activation() {
        let id = Uuid::now_v7();
        let raw = id.to_string();
        let cli = Cli::try_parse_from(["stockledger", "variant", "deactivate", raw.as_str()]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Variant(VariantCommand::Deactivate { id: parsed }) if parsed == id
        ));
    }

    #[test]
    fn adjust_accepts_negative_delta() {
        let id = Uuid::now_v7();
        let variant = id.to_string();
        let cli = Cli::try_parse_from([
            "stockledger",
            "adjust",
            "--variant",
            variant.as_str(),
            "--delta",
            "-4",
            "--ref-type",
            "STOCKTAKE",
            "--ref-id",
            "2026-10",
        ])
        .unwrap();
        match cli.command {
            Command::Adjust { delta, target, .. } => {
                assert_eq!(delta, -4);
                assert_eq!(target.variant, id);
                assert!(target.warehouse.is_none());
            }
            _ => panic!("expected adjust"),
        }
    }
}
