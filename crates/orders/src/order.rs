use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateRoot, DomainError, OrderId, Quantity, VariantId, WarehouseId,
};
use stockledger_inventory::StockMovement;

/// Ledger `reference_type` tags written by order transitions.
///
/// The `reference_id` of every such entry is the order id.
pub mod reference_types {
    pub const ORDER_RESERVE: &str = "ORDER_RESERVE";
    pub const ORDER_CANCEL: &str = "ORDER_CANCEL";
    pub const ORDER_SHIP: &str = "ORDER_SHIP";
}

/// Order status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "PAID" => Some(OrderStatus::Paid),
            "SHIPPED" => Some(OrderStatus::Shipped),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a line is fulfilled. Only warehouse lines move stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentType {
    #[default]
    Warehouse,
    Dropship,
}

impl FulfillmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            FulfillmentType::Warehouse => "WAREHOUSE",
            FulfillmentType::Dropship => "DROPSHIP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAREHOUSE" => Some(FulfillmentType::Warehouse),
            "DROPSHIP" => Some(FulfillmentType::Dropship),
            _ => None,
        }
    }
}

/// Contact details captured by checkout. Opaque to fulfillment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub phone: String,
    pub address: String,
}

/// A line as submitted by the checkout flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderLine {
    pub variant_id: Option<VariantId>,
    pub quantity: Quantity,
    /// Unit price in the smallest currency unit at checkout time.
    pub unit_price: u64,
    #[serde(default)]
    pub fulfillment: FulfillmentType,
}

impl NewOrderLine {
    pub fn warehouse(variant_id: VariantId, quantity: Quantity, unit_price: u64) -> Self {
        Self {
            variant_id: Some(variant_id),
            quantity,
            unit_price,
            fulfillment: FulfillmentType::Warehouse,
        }
    }
}

/// Order line: variant, quantity, immutable price snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub line_no: u32,
    pub variant_id: Option<VariantId>,
    pub quantity: Quantity,
    pub unit_price_snapshot: u64,
    pub fulfillment: FulfillmentType,
}

impl OrderLine {
    pub fn moves_stock(&self) -> bool {
        self.fulfillment == FulfillmentType::Warehouse && self.variant_id.is_some()
    }

    pub fn line_total(&self) -> u64 {
        self.unit_price_snapshot.saturating_mul(self.quantity.get() as u64)
    }
}

/// One stock movement an order transition requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockStep {
    pub line_no: u32,
    pub variant_id: VariantId,
    pub movement: StockMovement,
    pub reference_type: &'static str,
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    warehouse_id: Option<WarehouseId>,
    customer: Customer,
    status: OrderStatus,
    lines: Vec<OrderLine>,
    total_price: u64,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-placed aggregate instance.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            warehouse_id: None,
            customer: Customer::default(),
            status: OrderStatus::Pending,
            lines: Vec::new(),
            total_price: 0,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    /// Rebuild a placed order from persisted state.
    pub fn restore(
        id: OrderId,
        warehouse_id: WarehouseId,
        customer: Customer,
        status: OrderStatus,
        lines: Vec<OrderLine>,
        created_at: DateTime<Utc>,
        version: u64,
    ) -> Self {
        let total_price = saturating_total(&lines);
        Self {
            id,
            warehouse_id: Some(warehouse_id),
            customer,
            status,
            lines,
            total_price,
            created_at: Some(created_at),
            version,
            created: true,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    /// Warehouse the order's stock is held in, fixed at placement.
    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn customer(&self) -> &Customer {
        &self.customer
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    /// Σ unit price snapshot × quantity, fixed at placement.
    pub fn total_price(&self) -> u64 {
        self.total_price
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Which cancel action is being taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPath {
    /// Customer/system cancel: allowed from `PENDING` or `PAID`.
    Customer,
    /// Back-office cancel with stock restoration: allowed from `PAID` only.
    Admin,
}

/// Command: PlaceOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub warehouse_id: WarehouseId,
    pub customer: Customer,
    pub lines: Vec<NewOrderLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    Place(PlaceOrder),
    Confirm { occurred_at: DateTime<Utc> },
    Cancel { path: CancelPath, occurred_at: DateTime<Utc> },
    Ship { occurred_at: DateTime<Utc> },
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: OrderId,
    pub warehouse_id: WarehouseId,
    pub customer: Customer,
    pub lines: Vec<OrderLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    /// Status the order was cancelled from; decides release vs return.
    pub previous: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderShipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    Placed(OrderPlaced),
    Confirmed(OrderConfirmed),
    Cancelled(OrderCancelled),
    Shipped(OrderShipped),
}

impl OrderEvent {
    /// Stable event name (e.g. for logs).
    pub fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Placed(_) => "order.placed",
            OrderEvent::Confirmed(_) => "order.confirmed",
            OrderEvent::Cancelled(_) => "order.cancelled",
            OrderEvent::Shipped(_) => "order.shipped",
        }
    }

    /// Status the order is in after this event.
    pub fn resulting_status(&self) -> OrderStatus {
        match self {
            OrderEvent::Placed(_) => OrderStatus::Pending,
            OrderEvent::Confirmed(_) => OrderStatus::Paid,
            OrderEvent::Cancelled(_) => OrderStatus::Cancelled,
            OrderEvent::Shipped(_) => OrderStatus::Shipped,
        }
    }

    /// Stock movements this event requires, in execution order.
    ///
    /// - placed: reserve every line
    /// - confirmed: nothing (stock is already held by the reservation)
    /// - cancelled from `PENDING`: release every line
    /// - cancelled from `PAID`: return every line
    /// - shipped: release every line, then sell every line
    ///
    /// Dropship lines and lines without a variant never move stock. Lines
    /// sharing a variant are merged into one step, so every step of a
    /// transition is a distinct ledger effect.
    pub fn stock_steps(&self, lines: &[OrderLine]) -> Vec<StockStep> {
        use reference_types::{ORDER_CANCEL, ORDER_RESERVE, ORDER_SHIP};

        let steps: Vec<StockStep> = match self {
            OrderEvent::Placed(_) => steps_for(lines, StockMovement::Reserve, ORDER_RESERVE).collect(),
            OrderEvent::Confirmed(_) => Vec::new(),
            OrderEvent::Cancelled(e) => match e.previous {
                OrderStatus::Paid => steps_for(lines, StockMovement::Return, ORDER_CANCEL).collect(),
                _ => steps_for(lines, StockMovement::Release, ORDER_CANCEL).collect(),
            },
            OrderEvent::Shipped(_) => steps_for(lines, StockMovement::Release, ORDER_SHIP)
                .chain(steps_for(lines, StockMovement::Sell, ORDER_SHIP))
                .collect(),
        };
        merge_by_variant(steps)
    }
}

fn merge_by_variant(steps: Vec<StockStep>) -> Vec<StockStep> {
    let mut merged: Vec<StockStep> = Vec::with_capacity(steps.len());
    for step in steps {
        let existing = merged.iter_mut().find(|m| {
            m.variant_id == step.variant_id
                && m.reference_type == step.reference_type
                && m.movement.entry_type() == step.movement.entry_type()
        });
        match existing.and_then(|m| m.movement.merge(step.movement).map(|c| (m, c))) {
            Some((m, combined)) => m.movement = combined,
            None => merged.push(step),
        }
    }
    merged
}

fn steps_for<'a>(
    lines: &'a [OrderLine],
    make: fn(Quantity) -> StockMovement,
    reference_type: &'static str,
) -> impl Iterator<Item = StockStep> + 'a {
    lines.iter().filter(|l| l.moves_stock()).filter_map(move |l| {
        l.variant_id.map(|variant_id| StockStep {
            line_no: l.line_no,
            variant_id,
            movement: make(l.quantity),
            reference_type,
        })
    })
}

/// Sum of line totals, saturating.
fn saturating_total(lines: &[OrderLine]) -> u64 {
    lines
        .iter()
        .fold(0u64, |acc, l| acc.saturating_add(l.line_total()))
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Placed(e) => {
                self.id = e.order_id;
                self.warehouse_id = Some(e.warehouse_id);
                self.customer = e.customer.clone();
                self.lines = e.lines.clone();
                self.total_price = saturating_total(&self.lines);
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            OrderEvent::Confirmed(_) | OrderEvent::Cancelled(_) | OrderEvent::Shipped(_) => {}
        }
        self.status = event.resulting_status();

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::Place(cmd) => self.handle_place(cmd),
            OrderCommand::Confirm { occurred_at } => self.handle_confirm(*occurred_at),
            OrderCommand::Cancel { path, occurred_at } => self.handle_cancel(*path, *occurred_at),
            OrderCommand::Ship { occurred_at } => self.handle_ship(*occurred_at),
        }
    }
}

impl Order {
    fn ensure_placed(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        Ok(())
    }

    fn handle_place(&self, cmd: &PlaceOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::invariant("order already exists"));
        }
        if cmd.order_id != self.id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("order must have at least one line"));
        }

        let lines = cmd
            .lines
            .iter()
            .enumerate()
            .map(|(idx, l)| OrderLine {
                line_no: idx as u32 + 1,
                variant_id: l.variant_id,
                quantity: l.quantity,
                unit_price_snapshot: l.unit_price,
                fulfillment: l.fulfillment,
            })
            .collect::<Vec<OrderLine>>();
        lines
            .iter()
            .try_fold(0u64, |acc, l| acc.checked_add(l.line_total()))
            .ok_or_else(|| DomainError::validation("order total overflows"))?;

        Ok(vec![OrderEvent::Placed(OrderPlaced {
            order_id: cmd.order_id,
            warehouse_id: cmd.warehouse_id,
            customer: cmd.customer.clone(),
            lines,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, occurred_at: DateTime<Utc>) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_placed()?;
        match self.status {
            OrderStatus::Paid => Ok(vec![]),
            OrderStatus::Pending => {
                if let Some(line) = self.lines.iter().find(|l| l.variant_id.is_none()) {
                    return Err(DomainError::MissingVariant {
                        line_no: line.line_no,
                    });
                }
                Ok(vec![OrderEvent::Confirmed(OrderConfirmed {
                    order_id: self.id,
                    occurred_at,
                })])
            }
            from => Err(DomainError::invalid_transition(from, OrderStatus::Paid)),
        }
    }

    fn handle_cancel(
        &self,
        path: CancelPath,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_placed()?;
        let allowed = match path {
            CancelPath::Customer => matches!(self.status, OrderStatus::Pending | OrderStatus::Paid),
            CancelPath::Admin => self.status == OrderStatus::Paid,
        };

        match self.status {
            OrderStatus::Cancelled => Ok(vec![]),
            previous if allowed => Ok(vec![OrderEvent::Cancelled(OrderCancelled {
                order_id: self.id,
                previous,
                occurred_at,
            })]),
            from => Err(DomainError::invalid_transition(from, OrderStatus::Cancelled)),
        }
    }

    fn handle_ship(&self, occurred_at: DateTime<Utc>) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_placed()?;
        match self.status {
            OrderStatus::Shipped => Ok(vec![]),
            OrderStatus::Paid => Ok(vec![OrderEvent::Shipped(OrderShipped {
                order_id: self.id,
                occurred_at,
            })]),
            from => Err(DomainError::invalid_transition(from, OrderStatus::Shipped)),
        }
    }
}
