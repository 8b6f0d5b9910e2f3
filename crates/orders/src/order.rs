use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use retail_core::{
    Address, Aggregate, AggregateId, AggregateRoot, Currency, DocumentNumber, DomainError, Money,
    ProductId, UserId, require_non_blank,
};
use retail_events::{
    Command, Event, IntegrationEvent, IntegrationSource, OrderedLine, integration,
};

use crate::pricing::{LineItem, PricingSnapshot};
use crate::status::{OrderStatus, StatusHistoryEntry};

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    order_number: Option<DocumentNumber>,
    user_id: Option<UserId>,
    currency: Currency,
    items: Vec<LineItem>,
    next_line_no: u32,
    shipping_address: Option<Address>,
    billing_address: Option<Address>,
    pricing: PricingSnapshot,
    status: OrderStatus,
    history: Vec<StatusHistoryEntry>,
    coupon_code: Option<String>,
    shipping_method_id: Option<String>,
    payment_id: Option<AggregateId>,
    tracking_number: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    shipped_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            order_number: None,
            user_id: None,
            currency: Currency::USD,
            items: Vec::new(),
            next_line_no: 1,
            shipping_address: None,
            billing_address: None,
            pricing: PricingSnapshot::zero(Currency::USD),
            status: OrderStatus::Pending,
            history: Vec::new(),
            coupon_code: None,
            shipping_method_id: None,
            payment_id: None,
            tracking_number: None,
            created_at: None,
            updated_at: None,
            shipped_at: None,
            delivered_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn order_number(&self) -> Option<&DocumentNumber> {
        self.order_number.as_ref()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    pub fn item(&self, line_no: u32) -> Option<&LineItem> {
        self.items.iter().find(|i| i.line_no == line_no)
    }

    pub fn shipping_address(&self) -> Option<&Address> {
        self.shipping_address.as_ref()
    }

    pub fn billing_address(&self) -> Option<&Address> {
        self.billing_address.as_ref()
    }

    pub fn pricing(&self) -> &PricingSnapshot {
        &self.pricing
    }

    pub fn total(&self) -> Money {
        self.pricing.total
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn history(&self) -> &[StatusHistoryEntry] {
        &self.history
    }

    pub fn coupon_code(&self) -> Option<&str> {
        self.coupon_code.as_deref()
    }

    pub fn shipping_method_id(&self) -> Option<&str> {
        self.shipping_method_id.as_deref()
    }

    pub fn payment_id(&self) -> Option<AggregateId> {
        self.payment_id
    }

    pub fn tracking_number(&self) -> Option<&str> {
        self.tracking_number.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn shipped_at(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn can_cancel(&self) -> bool {
        self.created && self.status.can_transition_to(OrderStatus::Cancelled)
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

/// Line item data supplied by the caller. The product name, SKU and price are
/// resolved from the catalogue before the command is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub product_id: ProductId,
    pub name: String,
    pub sku: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub weight_grams: Option<u32>,
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub order_number: DocumentNumber,
    pub user_id: UserId,
    pub currency: Currency,
    pub items: Vec<NewLineItem>,
    pub shipping_address: Address,
    pub billing_address: Option<Address>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddItem {
    pub order_id: OrderId,
    pub item: NewLineItem,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveItem {
    pub order_id: OrderId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateItemQuantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateItemQuantity {
    pub order_id: OrderId,
    pub line_no: u32,
    pub quantity: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyCoupon. The discount is resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCoupon {
    pub order_id: OrderId,
    pub code: String,
    pub discount: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveCoupon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveCoupon {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetShippingMethod. The cost is resolved by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetShippingMethod {
    pub order_id: OrderId,
    pub shipping_method_id: String,
    pub cost: Money,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ChangeShippingAddress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeShippingAddress {
    pub order_id: OrderId,
    pub address: Address,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetBillingAddress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBillingAddress {
    pub order_id: OrderId,
    pub address: Address,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AttachPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachPayment {
    pub order_id: OrderId,
    pub payment_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ProcessOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ShipOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipOrder {
    pub order_id: OrderId,
    pub tracking_number: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeliverOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RefundOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundOrder {
    pub order_id: OrderId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    CreateOrder(CreateOrder),
    AddItem(AddItem),
    RemoveItem(RemoveItem),
    UpdateItemQuantity(UpdateItemQuantity),
    ApplyCoupon(ApplyCoupon),
    RemoveCoupon(RemoveCoupon),
    SetShippingMethod(SetShippingMethod),
    ChangeShippingAddress(ChangeShippingAddress),
    SetBillingAddress(SetBillingAddress),
    AttachPayment(AttachPayment),
    ConfirmOrder(ConfirmOrder),
    ProcessOrder(ProcessOrder),
    ShipOrder(ShipOrder),
    DeliverOrder(DeliverOrder),
    CancelOrder(CancelOrder),
    RefundOrder(RefundOrder),
}

impl OrderCommand {
    pub fn order_id(&self) -> OrderId {
        match self {
            OrderCommand::CreateOrder(c) => c.order_id,
            OrderCommand::AddItem(c) => c.order_id,
            OrderCommand::RemoveItem(c) => c.order_id,
            OrderCommand::UpdateItemQuantity(c) => c.order_id,
            OrderCommand::ApplyCoupon(c) => c.order_id,
            OrderCommand::RemoveCoupon(c) => c.order_id,
            OrderCommand::SetShippingMethod(c) => c.order_id,
            OrderCommand::ChangeShippingAddress(c) => c.order_id,
            OrderCommand::SetBillingAddress(c) => c.order_id,
            OrderCommand::AttachPayment(c) => c.order_id,
            OrderCommand::ConfirmOrder(c) => c.order_id,
            OrderCommand::ProcessOrder(c) => c.order_id,
            OrderCommand::ShipOrder(c) => c.order_id,
            OrderCommand::DeliverOrder(c) => c.order_id,
            OrderCommand::CancelOrder(c) => c.order_id,
            OrderCommand::RefundOrder(c) => c.order_id,
        }
    }
}

impl Command for OrderCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.order_id().0
    }
}

/// Event: OrderCreated. Carries the initial pricing so replay never recomputes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub order_number: DocumentNumber,
    pub user_id: UserId,
    pub currency: Currency,
    pub items: Vec<LineItem>,
    pub shipping_address: Address,
    pub billing_address: Option<Address>,
    pub pricing: PricingSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub order_id: OrderId,
    pub item: LineItem,
    pub pricing: PricingSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRemoved {
    pub order_id: OrderId,
    pub line_no: u32,
    pub pricing: PricingSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantityUpdated {
    pub order_id: OrderId,
    pub line_no: u32,
    pub quantity: u32,
    pub pricing: PricingSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponApplied {
    pub order_id: OrderId,
    pub code: String,
    pub pricing: PricingSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponRemoved {
    pub order_id: OrderId,
    pub pricing: PricingSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingMethodSet {
    pub order_id: OrderId,
    pub shipping_method_id: String,
    pub pricing: PricingSnapshot,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddressChanged {
    pub order_id: OrderId,
    pub address: Address,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAddressSet {
    pub order_id: OrderId,
    pub address: Address,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttached {
    pub order_id: OrderId,
    pub payment_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StatusChanged. The only event that moves `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChanged {
    pub order_id: OrderId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub reason: Option<String>,
    pub tracking_number: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
    ItemAdded(ItemAdded),
    ItemRemoved(ItemRemoved),
    ItemQuantityUpdated(ItemQuantityUpdated),
    CouponApplied(CouponApplied),
    CouponRemoved(CouponRemoved),
    ShippingMethodSet(ShippingMethodSet),
    ShippingAddressChanged(ShippingAddressChanged),
    BillingAddressSet(BillingAddressSet),
    PaymentAttached(PaymentAttached),
    StatusChanged(StatusChanged),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "orders.order.created",
            OrderEvent::ItemAdded(_) => "orders.order.item_added",
            OrderEvent::ItemRemoved(_) => "orders.order.item_removed",
            OrderEvent::ItemQuantityUpdated(_) => "orders.order.item_quantity_updated",
            OrderEvent::CouponApplied(_) => "orders.order.coupon_applied",
            OrderEvent::CouponRemoved(_) => "orders.order.coupon_removed",
            OrderEvent::ShippingMethodSet(_) => "orders.order.shipping_method_set",
            OrderEvent::ShippingAddressChanged(_) => "orders.order.shipping_address_changed",
            OrderEvent::BillingAddressSet(_) => "orders.order.billing_address_set",
            OrderEvent::PaymentAttached(_) => "orders.order.payment_attached",
            OrderEvent::StatusChanged(_) => "orders.order.status_changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(e) => e.occurred_at,
            OrderEvent::ItemAdded(e) => e.occurred_at,
            OrderEvent::ItemRemoved(e) => e.occurred_at,
            OrderEvent::ItemQuantityUpdated(e) => e.occurred_at,
            OrderEvent::CouponApplied(e) => e.occurred_at,
            OrderEvent::CouponRemoved(e) => e.occurred_at,
            OrderEvent::ShippingMethodSet(e) => e.occurred_at,
            OrderEvent::ShippingAddressChanged(e) => e.occurred_at,
            OrderEvent::BillingAddressSet(e) => e.occurred_at,
            OrderEvent::PaymentAttached(e) => e.occurred_at,
            OrderEvent::StatusChanged(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.order_number = Some(e.order_number.clone());
                self.user_id = Some(e.user_id);
                self.currency = e.currency;
                self.items = e.items.clone();
                self.next_line_no = e.items.iter().map(|i| i.line_no).max().unwrap_or(0) + 1;
                self.shipping_address = Some(e.shipping_address.clone());
                self.billing_address = e.billing_address.clone();
                self.pricing = e.pricing;
                self.status = OrderStatus::Pending;
                self.history = vec![StatusHistoryEntry {
                    status: OrderStatus::Pending,
                    reason: Some("order created".to_string()),
                    occurred_at: e.occurred_at,
                }];
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            OrderEvent::ItemAdded(e) => {
                self.next_line_no = self.next_line_no.max(e.item.line_no + 1);
                self.items.push(e.item.clone());
                self.pricing = e.pricing;
            }
            OrderEvent::ItemRemoved(e) => {
                self.items.retain(|i| i.line_no != e.line_no);
                self.pricing = e.pricing;
            }
            OrderEvent::ItemQuantityUpdated(e) => {
                if let Some(item) = self.items.iter_mut().find(|i| i.line_no == e.line_no) {
                    item.quantity = e.quantity;
                }
                self.pricing = e.pricing;
            }
            OrderEvent::CouponApplied(e) => {
                self.coupon_code = Some(e.code.clone());
                self.pricing = e.pricing;
            }
            OrderEvent::CouponRemoved(e) => {
                self.coupon_code = None;
                self.pricing = e.pricing;
            }
            OrderEvent::ShippingMethodSet(e) => {
                self.shipping_method_id = Some(e.shipping_method_id.clone());
                self.pricing = e.pricing;
            }
            OrderEvent::ShippingAddressChanged(e) => {
                self.shipping_address = Some(e.address.clone());
            }
            OrderEvent::BillingAddressSet(e) => {
                self.billing_address = Some(e.address.clone());
            }
            OrderEvent::PaymentAttached(e) => {
                self.payment_id = Some(e.payment_id);
            }
            OrderEvent::StatusChanged(e) => {
                self.status = e.to;
                match e.to {
                    OrderStatus::Shipped => {
                        self.shipped_at = Some(e.occurred_at);
                        self.tracking_number = e.tracking_number.clone();
                    }
                    OrderStatus::Delivered => self.delivered_at = Some(e.occurred_at),
                    _ => {}
                }
                self.history.push(StatusHistoryEntry {
                    status: e.to,
                    reason: e.reason.clone(),
                    occurred_at: e.occurred_at,
                });
            }
        }

        self.updated_at = Some(event.occurred_at());
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            OrderCommand::AddItem(cmd) => self.handle_add_item(cmd),
            OrderCommand::RemoveItem(cmd) => self.handle_remove_item(cmd),
            OrderCommand::UpdateItemQuantity(cmd) => self.handle_update_quantity(cmd),
            OrderCommand::ApplyCoupon(cmd) => self.handle_apply_coupon(cmd),
            OrderCommand::RemoveCoupon(cmd) => self.handle_remove_coupon(cmd),
            OrderCommand::SetShippingMethod(cmd) => self.handle_set_shipping_method(cmd),
            OrderCommand::ChangeShippingAddress(cmd) => self.handle_change_shipping_address(cmd),
            OrderCommand::SetBillingAddress(cmd) => self.handle_set_billing_address(cmd),
            OrderCommand::AttachPayment(cmd) => self.handle_attach_payment(cmd),
            OrderCommand::ConfirmOrder(cmd) => {
                self.ensure_existing(cmd.order_id)?;
                self.transition(OrderStatus::Confirmed, cmd.reason.clone(), None, cmd.occurred_at)
            }
            OrderCommand::ProcessOrder(cmd) => {
                self.ensure_existing(cmd.order_id)?;
                self.transition(OrderStatus::Processing, None, None, cmd.occurred_at)
            }
            OrderCommand::ShipOrder(cmd) => self.handle_ship(cmd),
            OrderCommand::DeliverOrder(cmd) => {
                self.ensure_existing(cmd.order_id)?;
                self.transition(OrderStatus::Delivered, None, None, cmd.occurred_at)
            }
            OrderCommand::CancelOrder(cmd) => {
                self.ensure_existing(cmd.order_id)?;
                require_non_blank(&cmd.reason, "cancellation reason")?;
                self.transition(
                    OrderStatus::Cancelled,
                    Some(cmd.reason.clone()),
                    None,
                    cmd.occurred_at,
                )
            }
            OrderCommand::RefundOrder(cmd) => {
                self.ensure_existing(cmd.order_id)?;
                require_non_blank(&cmd.reason, "refund reason")?;
                self.transition(
                    OrderStatus::Refunded,
                    Some(cmd.reason.clone()),
                    None,
                    cmd.occurred_at,
                )
            }
        }
    }
}

impl IntegrationSource for Order {
    fn integration_event(&self, event: &OrderEvent) -> Option<IntegrationEvent> {
        match event {
            OrderEvent::OrderCreated(e) => {
                Some(IntegrationEvent::OrderCreated(integration::OrderCreated {
                    order_id: e.order_id.0,
                    order_number: e.order_number.clone(),
                    user_id: e.user_id,
                    lines: self
                        .items
                        .iter()
                        .map(|i| OrderedLine {
                            product_id: i.product_id,
                            quantity: i.quantity,
                            unit_price: i.unit_price,
                        })
                        .collect(),
                    total: self.pricing.total,
                    occurred_at: e.occurred_at,
                }))
            }
            OrderEvent::StatusChanged(e) => Some(IntegrationEvent::OrderStatusChanged(
                integration::OrderStatusChanged {
                    order_id: e.order_id.0,
                    from: e.from.as_str().to_string(),
                    to: e.to.as_str().to_string(),
                    reason: e.reason.clone(),
                    occurred_at: e.occurred_at,
                },
            )),
            _ => None,
        }
    }
}

impl Order {
    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_existing(&self, order_id: OrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(order_id)
    }

    /// Items, coupon and shipping are frozen once processing starts.
    fn ensure_items_mutable(&self) -> Result<(), DomainError> {
        if !self.status.allows_item_changes() {
            return Err(DomainError::invalid_transition(self.status, "modify items"));
        }
        Ok(())
    }

    fn validate_new_item(&self, item: &NewLineItem) -> Result<(), DomainError> {
        require_non_blank(&item.name, "item name")?;
        require_non_blank(&item.sku, "item sku")?;
        if item.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if item.unit_price.is_negative() {
            return Err(DomainError::validation("unit_price cannot be negative"));
        }
        if item.unit_price.currency() != self.currency {
            return Err(DomainError::validation(format!(
                "item priced in {} but order is in {}",
                item.unit_price.currency(),
                self.currency
            )));
        }
        Ok(())
    }

    fn validate_charge(&self, amount: Money, field: &str) -> Result<(), DomainError> {
        amount.ensure_same_currency(&Money::zero(self.currency))?;
        if amount.is_negative() {
            return Err(DomainError::validation(format!("{field} cannot be negative")));
        }
        Ok(())
    }

    fn transition(
        &self,
        to: OrderStatus,
        reason: Option<String>,
        tracking_number: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::invalid_transition(self.status, to));
        }

        Ok(vec![OrderEvent::StatusChanged(StatusChanged {
            order_id: self.id,
            from: self.status,
            to,
            reason,
            tracking_number,
            occurred_at,
        })])
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists("order"));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("order needs at least one item"));
        }
        cmd.shipping_address.validate()?;
        if let Some(billing) = &cmd.billing_address {
            billing.validate()?;
        }

        // Validate against the command's currency, not the empty aggregate's default.
        let draft = Order {
            currency: cmd.currency,
            ..Order::empty(cmd.order_id)
        };
        let mut items = Vec::with_capacity(cmd.items.len());
        for (idx, item) in cmd.items.iter().enumerate() {
            draft.validate_new_item(item)?;
            items.push(LineItem {
                line_no: idx as u32 + 1,
                product_id: item.product_id,
                name: item.name.clone(),
                sku: item.sku.clone(),
                unit_price: item.unit_price,
                quantity: item.quantity,
                weight_grams: item.weight_grams,
            });
        }

        let zero = Money::zero(cmd.currency);
        let pricing = PricingSnapshot::compute(cmd.currency, &items, zero, zero)?;

        Ok(vec![OrderEvent::OrderCreated(OrderCreated {
            order_id: cmd.order_id,
            order_number: cmd.order_number.clone(),
            user_id: cmd.user_id,
            currency: cmd.currency,
            items,
            shipping_address: cmd.shipping_address.clone(),
            billing_address: cmd.billing_address.clone(),
            pricing,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_item(&self, cmd: &AddItem) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_items_mutable()?;
        self.validate_new_item(&cmd.item)?;

        let item = LineItem {
            line_no: self.next_line_no,
            product_id: cmd.item.product_id,
            name: cmd.item.name.clone(),
            sku: cmd.item.sku.clone(),
            unit_price: cmd.item.unit_price,
            quantity: cmd.item.quantity,
            weight_grams: cmd.item.weight_grams,
        };
        let mut items = self.items.clone();
        items.push(item.clone());
        let pricing = self.pricing.reprice(&items)?;

        Ok(vec![OrderEvent::ItemAdded(ItemAdded {
            order_id: cmd.order_id,
            item,
            pricing,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_item(&self, cmd: &RemoveItem) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_items_mutable()?;
        if self.item(cmd.line_no).is_none() {
            return Err(DomainError::not_found());
        }
        if self.items.len() == 1 {
            return Err(DomainError::validation("cannot remove the last item of an order"));
        }

        let items: Vec<LineItem> = self
            .items
            .iter()
            .filter(|i| i.line_no != cmd.line_no)
            .cloned()
            .collect();
        let pricing = self.pricing.reprice(&items)?;

        Ok(vec![OrderEvent::ItemRemoved(ItemRemoved {
            order_id: cmd.order_id,
            line_no: cmd.line_no,
            pricing,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_quantity(
        &self,
        cmd: &UpdateItemQuantity,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_items_mutable()?;
        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if self.item(cmd.line_no).is_none() {
            return Err(DomainError::not_found());
        }

        let items: Vec<LineItem> = self
            .items
            .iter()
            .map(|i| {
                let mut i = i.clone();
                if i.line_no == cmd.line_no {
                    i.quantity = cmd.quantity;
                }
                i
            })
            .collect();
        let pricing = self.pricing.reprice(&items)?;

        Ok(vec![OrderEvent::ItemQuantityUpdated(ItemQuantityUpdated {
            order_id: cmd.order_id,
            line_no: cmd.line_no,
            quantity: cmd.quantity,
            pricing,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_apply_coupon(&self, cmd: &ApplyCoupon) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_items_mutable()?;
        require_non_blank(&cmd.code, "coupon code")?;
        self.validate_charge(cmd.discount, "discount")?;

        let pricing = self.pricing.with_discount(&self.items, cmd.discount)?;

        Ok(vec![OrderEvent::CouponApplied(CouponApplied {
            order_id: cmd.order_id,
            code: cmd.code.trim().to_string(),
            pricing,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_coupon(&self, cmd: &RemoveCoupon) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_items_mutable()?;
        if self.coupon_code.is_none() {
            return Err(DomainError::validation("no coupon applied"));
        }

        let pricing = self
            .pricing
            .with_discount(&self.items, Money::zero(self.currency))?;

        Ok(vec![OrderEvent::CouponRemoved(CouponRemoved {
            order_id: cmd.order_id,
            pricing,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_shipping_method(
        &self,
        cmd: &SetShippingMethod,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        self.ensure_items_mutable()?;
        require_non_blank(&cmd.shipping_method_id, "shipping method")?;
        self.validate_charge(cmd.cost, "shipping cost")?;

        let pricing = self.pricing.with_shipping(&self.items, cmd.cost)?;

        Ok(vec![OrderEvent::ShippingMethodSet(ShippingMethodSet {
            order_id: cmd.order_id,
            shipping_method_id: cmd.shipping_method_id.clone(),
            pricing,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_shipping_address(
        &self,
        cmd: &ChangeShippingAddress,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        if !self.status.allows_item_changes() {
            return Err(DomainError::invalid_transition(
                self.status,
                "change shipping address",
            ));
        }
        cmd.address.validate()?;

        Ok(vec![OrderEvent::ShippingAddressChanged(ShippingAddressChanged {
            order_id: cmd.order_id,
            address: cmd.address.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_billing_address(
        &self,
        cmd: &SetBillingAddress,
    ) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        if !self.status.allows_item_changes() {
            return Err(DomainError::invalid_transition(
                self.status,
                "set billing address",
            ));
        }
        cmd.address.validate()?;

        Ok(vec![OrderEvent::BillingAddressSet(BillingAddressSet {
            order_id: cmd.order_id,
            address: cmd.address.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Re-attaching the same payment is a no-op so redelivered messages are harmless.
    fn handle_attach_payment(&self, cmd: &AttachPayment) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        match self.payment_id {
            Some(current) if current == cmd.payment_id => return Ok(Vec::new()),
            Some(current) => {
                return Err(DomainError::already_exists(format!(
                    "order {} already has payment {current}",
                    self.id
                )));
            }
            None => {}
        }
        if matches!(self.status, OrderStatus::Cancelled | OrderStatus::Refunded) {
            return Err(DomainError::invalid_transition(self.status, "attach payment"));
        }

        Ok(vec![OrderEvent::PaymentAttached(PaymentAttached {
            order_id: cmd.order_id,
            payment_id: cmd.payment_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_ship(&self, cmd: &ShipOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_existing(cmd.order_id)?;
        if let Some(tracking) = &cmd.tracking_number {
            require_non_blank(tracking, "tracking number")?;
        }
        self.transition(
            OrderStatus::Shipped,
            None,
            cmd.tracking_number.clone(),
            cmd.occurred_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use retail_events::execute;

    fn test_order_id() -> OrderId {
        OrderId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn usd(amount: i64) -> Money {
        Money::new(amount, Currency::USD)
    }

    fn address() -> Address {
        Address {
            recipient: "Grace Hopper".to_string(),
            line1: "1 Navy Way".to_string(),
            line2: None,
            city: "Arlington".to_string(),
            region: Some("VA".to_string()),
            postal_code: "22201".to_string(),
            country: "US".to_string(),
            phone: None,
        }
    }

    fn new_item(price: i64, quantity: u32) -> NewLineItem {
        NewLineItem {
            product_id: ProductId::new(),
            name: "Widget".to_string(),
            sku: "WID-1".to_string(),
            unit_price: usd(price),
            quantity,
            weight_grams: Some(250),
        }
    }

    /// 2 × 10.00 + 1 × 5.00 = 25.00 subtotal.
    fn created_order() -> Order {
        let order_id = test_order_id();
        let mut order = Order::empty(order_id);
        let cmd = CreateOrder {
            order_id,
            order_number: DocumentNumber::new("ORD", 1),
            user_id: UserId::new(),
            currency: Currency::USD,
            items: vec![new_item(1000, 2), new_item(500, 1)],
            shipping_address: address(),
            billing_address: None,
            occurred_at: test_time(),
        };
        execute(&mut order, &OrderCommand::CreateOrder(cmd)).unwrap();
        order
    }

    fn run(order: &mut Order, cmd: OrderCommand) -> Result<Vec<OrderEvent>, DomainError> {
        execute(order, &cmd)
    }

    fn confirm(order: &mut Order) {
        let cmd = ConfirmOrder {
            order_id: order.id_typed(),
            reason: None,
            occurred_at: test_time(),
        };
        run(order, OrderCommand::ConfirmOrder(cmd)).unwrap();
    }

    fn process(order: &mut Order) {
        let cmd = ProcessOrder {
            order_id: order.id_typed(),
            occurred_at: test_time(),
        };
        run(order, OrderCommand::ProcessOrder(cmd)).unwrap();
    }

    fn ship(order: &mut Order) -> Result<Vec<OrderEvent>, DomainError> {
        let cmd = ShipOrder {
            order_id: order.id_typed(),
            tracking_number: Some("1Z999".to_string()),
            occurred_at: test_time() + Duration::days(1),
        };
        run(order, OrderCommand::ShipOrder(cmd))
    }

    fn deliver(order: &mut Order) {
        let cmd = DeliverOrder {
            order_id: order.id_typed(),
            occurred_at: test_time() + Duration::days(3),
        };
        run(order, OrderCommand::DeliverOrder(cmd)).unwrap();
    }

    fn cancel(order: &mut Order, reason: &str) -> Result<Vec<OrderEvent>, DomainError> {
        let cmd = CancelOrder {
            order_id: order.id_typed(),
            reason: reason.to_string(),
            occurred_at: test_time(),
        };
        run(order, OrderCommand::CancelOrder(cmd))
    }

    #[test]
    fn create_order_prices_reference_basket() {
        let order = created_order();
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.pricing().subtotal, usd(2500));
        assert_eq!(order.pricing().tax, usd(200));
        assert_eq!(order.total(), usd(2700));
        assert_eq!(order.items().len(), 2);
        assert_eq!(order.version(), 1);
        assert_eq!(order.history().len(), 1);
        assert_eq!(order.history()[0].reason.as_deref(), Some("order created"));
    }

    #[test]
    fn create_requires_items() {
        let order_id = test_order_id();
        let order = Order::empty(order_id);
        let cmd = CreateOrder {
            order_id,
            order_number: DocumentNumber::new("ORD", 1),
            user_id: UserId::new(),
            currency: Currency::USD,
            items: vec![],
            shipping_address: address(),
            billing_address: None,
            occurred_at: test_time(),
        };
        match order.handle(&OrderCommand::CreateOrder(cmd)) {
            Err(DomainError::Validation(_)) => {}
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn create_twice_is_rejected() {
        let order = created_order();
        let cmd = CreateOrder {
            order_id: order.id_typed(),
            order_number: DocumentNumber::new("ORD", 2),
            user_id: UserId::new(),
            currency: Currency::USD,
            items: vec![new_item(100, 1)],
            shipping_address: address(),
            billing_address: None,
            occurred_at: test_time(),
        };
        assert!(matches!(
            order.handle(&OrderCommand::CreateOrder(cmd)),
            Err(DomainError::AlreadyExists(_))
        ));
    }

    #[test]
    fn full_lifecycle_appends_one_history_entry_per_transition() {
        let mut order = created_order();
        confirm(&mut order);
        process(&mut order);
        ship(&mut order).unwrap();
        deliver(&mut order);

        assert_eq!(order.status(), OrderStatus::Delivered);
        let statuses: Vec<OrderStatus> = order.history().iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![
                OrderStatus::Pending,
                OrderStatus::Confirmed,
                OrderStatus::Processing,
                OrderStatus::Shipped,
                OrderStatus::Delivered,
            ]
        );
        assert_eq!(order.tracking_number(), Some("1Z999"));
        assert_eq!(order.shipped_at(), Some(test_time() + Duration::days(1)));
        assert_eq!(order.delivered_at(), Some(test_time() + Duration::days(3)));
        assert_eq!(order.total(), usd(2700));
    }

    #[test]
    fn cancel_after_delivery_is_rejected() {
        let mut order = created_order();
        confirm(&mut order);
        process(&mut order);
        ship(&mut order).unwrap();
        deliver(&mut order);

        let before = order.clone();
        match cancel(&mut order, "changed my mind") {
            Err(DomainError::InvalidStateTransition { from, to }) => {
                assert_eq!(from, "delivered");
                assert_eq!(to, "cancelled");
            }
            other => panic!("expected InvalidStateTransition, got {other:?}"),
        }
        assert_eq!(order, before);
    }

    #[test]
    fn ship_from_pending_leaves_order_untouched() {
        let mut order = created_order();
        let before = order.clone();

        match ship(&mut order) {
            Err(DomainError::InvalidStateTransition { from, to }) => {
                assert_eq!(from, "pending");
                assert_eq!(to, "shipped");
            }
            other => panic!("expected InvalidStateTransition, got {other:?}"),
        }
        assert_eq!(order, before);
    }

    #[test]
    fn cancel_needs_a_reason() {
        let mut order = created_order();
        assert!(matches!(
            cancel(&mut order, "  "),
            Err(DomainError::Validation(_))
        ));
        cancel(&mut order, "payment failed").unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(
            order.history().last().and_then(|h| h.reason.as_deref()),
            Some("payment failed")
        );
        assert!(matches!(
            cancel(&mut order, "again"),
            Err(DomainError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn refund_only_after_delivery() {
        let mut order = created_order();
        let refund = |order: &mut Order| {
            let cmd = RefundOrder {
                order_id: order.id_typed(),
                reason: "damaged".to_string(),
                occurred_at: test_time(),
            };
            run(order, OrderCommand::RefundOrder(cmd))
        };
        assert!(refund(&mut order).is_err());

        confirm(&mut order);
        process(&mut order);
        ship(&mut order).unwrap();
        deliver(&mut order);
        refund(&mut order).unwrap();
        assert_eq!(order.status(), OrderStatus::Refunded);
    }

    #[test]
    fn item_changes_recompute_pricing() {
        let mut order = created_order();
        let order_id = order.id_typed();

        run(
            &mut order,
            OrderCommand::AddItem(AddItem {
                order_id,
                item: new_item(250, 4),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.pricing().subtotal, usd(3500));
        assert_eq!(order.item(3).map(|i| i.quantity), Some(4));

        run(
            &mut order,
            OrderCommand::UpdateItemQuantity(UpdateItemQuantity {
                order_id,
                line_no: 1,
                quantity: 1,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.pricing().subtotal, usd(2500));

        run(
            &mut order,
            OrderCommand::RemoveItem(RemoveItem {
                order_id,
                line_no: 2,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.pricing().subtotal, usd(2000));
        assert_eq!(order.pricing().tax, usd(160));
        assert_eq!(order.total(), usd(2160));
        assert!(order.pricing().is_consistent());
    }

    #[test]
    fn line_numbers_are_not_reused_after_removal() {
        let mut order = created_order();
        let order_id = order.id_typed();
        run(
            &mut order,
            OrderCommand::RemoveItem(RemoveItem {
                order_id,
                line_no: 2,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        run(
            &mut order,
            OrderCommand::AddItem(AddItem {
                order_id,
                item: new_item(100, 1),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        let line_nos: Vec<u32> = order.items().iter().map(|i| i.line_no).collect();
        assert_eq!(line_nos, vec![1, 3]);
    }

    #[test]
    fn last_item_cannot_be_removed() {
        let mut order = created_order();
        let order_id = order.id_typed();
        run(
            &mut order,
            OrderCommand::RemoveItem(RemoveItem {
                order_id,
                line_no: 1,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        let err = run(
            &mut order,
            OrderCommand::RemoveItem(RemoveItem {
                order_id,
                line_no: 2,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(order.items().len(), 1);
    }

    #[test]
    fn invalid_items_are_rejected() {
        let mut order = created_order();
        let order_id = order.id_typed();
        let add = |order: &mut Order, item: NewLineItem| {
            run(
                order,
                OrderCommand::AddItem(AddItem {
                    order_id,
                    item,
                    occurred_at: test_time(),
                }),
            )
        };

        assert!(matches!(add(&mut order, new_item(100, 0)), Err(DomainError::Validation(_))));
        assert!(matches!(add(&mut order, new_item(-1, 1)), Err(DomainError::Validation(_))));
        let mut euro = new_item(100, 1);
        euro.unit_price = Money::new(100, Currency::EUR);
        assert!(matches!(add(&mut order, euro), Err(DomainError::Validation(_))));
        assert_eq!(order.items().len(), 2);
    }

    #[test]
    fn coupon_and_shipping_replace_their_components() {
        let mut order = created_order();
        let order_id = order.id_typed();

        run(
            &mut order,
            OrderCommand::SetShippingMethod(SetShippingMethod {
                order_id,
                shipping_method_id: "ground".to_string(),
                cost: usd(599),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        run(
            &mut order,
            OrderCommand::ApplyCoupon(ApplyCoupon {
                order_id,
                code: " SPRING10 ".to_string(),
                discount: usd(250),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.coupon_code(), Some("SPRING10"));
        assert_eq!(order.total(), usd(2500 + 200 + 599 - 250));

        run(
            &mut order,
            OrderCommand::SetShippingMethod(SetShippingMethod {
                order_id,
                shipping_method_id: "express".to_string(),
                cost: usd(1500),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.pricing().shipping, usd(1500));
        assert_eq!(order.pricing().discount, usd(250));

        run(
            &mut order,
            OrderCommand::RemoveCoupon(RemoveCoupon {
                order_id,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert_eq!(order.coupon_code(), None);
        assert_eq!(order.total(), usd(2500 + 200 + 1500));
    }

    #[test]
    fn items_are_frozen_once_processing() {
        let mut order = created_order();
        confirm(&mut order);
        process(&mut order);
        let before = order.clone();

        let err = run(
            &mut order,
            OrderCommand::AddItem(AddItem {
                order_id: before.id_typed(),
                item: new_item(100, 1),
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

        let err = run(
            &mut order,
            OrderCommand::ChangeShippingAddress(ChangeShippingAddress {
                order_id: before.id_typed(),
                address: address(),
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        assert_eq!(order, before);
    }

    #[test]
    fn attaching_the_same_payment_twice_is_a_no_op() {
        let mut order = created_order();
        let payment_id = AggregateId::new();
        let cmd = OrderCommand::AttachPayment(AttachPayment {
            order_id: order.id_typed(),
            payment_id,
            occurred_at: test_time(),
        });
        assert_eq!(run(&mut order, cmd.clone()).unwrap().len(), 1);
        assert!(run(&mut order, cmd).unwrap().is_empty());
        assert_eq!(order.payment_id(), Some(payment_id));
        assert_eq!(order.version(), 2);
    }

    #[test]
    fn a_second_payment_cannot_replace_the_first() {
        let mut order = created_order();
        let order_id = order.id_typed();
        let first = AggregateId::new();
        let attach = |payment_id| {
            OrderCommand::AttachPayment(AttachPayment {
                order_id,
                payment_id,
                occurred_at: test_time(),
            })
        };
        run(&mut order, attach(first)).unwrap();

        let err = run(&mut order, attach(AggregateId::new())).unwrap_err();
        assert!(matches!(err, DomainError::AlreadyExists(_)));
        assert_eq!(order.payment_id(), Some(first));
    }

    #[test]
    fn coupon_larger_than_the_gross_is_rejected() {
        let mut order = created_order();
        let before = order.clone();

        let err = run(
            &mut order,
            OrderCommand::ApplyCoupon(ApplyCoupon {
                order_id: before.id_typed(),
                code: "BIG".to_string(),
                discount: usd(5000),
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(order, before);

        run(
            &mut order,
            OrderCommand::ApplyCoupon(ApplyCoupon {
                order_id: before.id_typed(),
                code: "ALL".to_string(),
                discount: usd(2700),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        assert!(order.total().is_zero());
    }

    #[test]
    fn removing_a_line_under_a_large_coupon_is_rejected() {
        let mut order = created_order();
        let order_id = order.id_typed();
        run(
            &mut order,
            OrderCommand::ApplyCoupon(ApplyCoupon {
                order_id,
                code: "BULK".to_string(),
                discount: usd(2000),
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        let before = order.clone();

        let err = run(
            &mut order,
            OrderCommand::RemoveItem(RemoveItem {
                order_id,
                line_no: 1,
                occurred_at: test_time(),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(order, before);
    }

    #[test]
    fn commands_for_other_orders_are_rejected() {
        let order = created_order();
        let cmd = OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id: test_order_id(),
            reason: None,
            occurred_at: test_time(),
        });
        assert!(matches!(
            order.handle(&cmd),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn commands_before_creation_are_not_found() {
        let order_id = test_order_id();
        let order = Order::empty(order_id);
        let cmd = OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id,
            reason: None,
            occurred_at: test_time(),
        });
        assert!(matches!(order.handle(&cmd), Err(DomainError::NotFound)));
    }

    #[test]
    fn creation_and_status_changes_are_published() {
        let mut order = created_order();
        let confirm_cmd = OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id: order.id_typed(),
            reason: Some("paid".to_string()),
            occurred_at: test_time(),
        });
        let events = run(&mut order, confirm_cmd).unwrap();
        match order.integration_events(&events).as_slice() {
            [IntegrationEvent::OrderStatusChanged(e)] => {
                assert_eq!(e.from, "pending");
                assert_eq!(e.to, "confirmed");
                assert_eq!(e.reason.as_deref(), Some("paid"));
            }
            other => panic!("unexpected integration events: {other:?}"),
        }
    }

    #[test]
    fn replay_reproduces_state() {
        let order_id = test_order_id();
        let mut order = Order::empty(order_id);
        let mut log = Vec::new();

        let create = OrderCommand::CreateOrder(CreateOrder {
            order_id,
            order_number: DocumentNumber::new("ORD", 7),
            user_id: UserId::new(),
            currency: Currency::USD,
            items: vec![new_item(1000, 2)],
            shipping_address: address(),
            billing_address: Some(address()),
            occurred_at: test_time(),
        });
        log.extend(run(&mut order, create).unwrap());
        log.extend(
            run(
                &mut order,
                OrderCommand::AddItem(AddItem {
                    order_id,
                    item: new_item(300, 3),
                    occurred_at: test_time(),
                }),
            )
            .unwrap(),
        );
        log.extend(
            run(
                &mut order,
                OrderCommand::ConfirmOrder(ConfirmOrder {
                    order_id,
                    reason: None,
                    occurred_at: test_time(),
                }),
            )
            .unwrap(),
        );

        let mut replayed = Order::empty(order_id);
        for e in &log {
            replayed.apply(e);
        }
        assert_eq!(replayed, order);
        assert_eq!(replayed.version(), 3);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Step {
            Confirm,
            Process,
            Ship,
            Deliver,
            Cancel,
            Refund,
            AddItem(i64, u32),
            UpdateQuantity(u32, u32),
            RemoveItem(u32),
            Coupon(i64),
            Shipping(i64),
        }

        fn step() -> impl Strategy<Value = Step> {
            prop_oneof![
                Just(Step::Confirm),
                Just(Step::Process),
                Just(Step::Ship),
                Just(Step::Deliver),
                Just(Step::Cancel),
                Just(Step::Refund),
                (0i64..50_000, 0u32..5).prop_map(|(p, q)| Step::AddItem(p, q)),
                (1u32..6, 0u32..5).prop_map(|(l, q)| Step::UpdateQuantity(l, q)),
                (1u32..6).prop_map(Step::RemoveItem),
                (-100i64..6_000).prop_map(Step::Coupon),
                (-100i64..2_000).prop_map(Step::Shipping),
            ]
        }

        fn to_command(order: &Order, step: &Step) -> OrderCommand {
            let order_id = order.id_typed();
            let at = test_time();
            match step.clone() {
                Step::Confirm => OrderCommand::ConfirmOrder(ConfirmOrder {
                    order_id,
                    reason: None,
                    occurred_at: at,
                }),
                Step::Process => OrderCommand::ProcessOrder(ProcessOrder {
                    order_id,
                    occurred_at: at,
                }),
                Step::Ship => OrderCommand::ShipOrder(ShipOrder {
                    order_id,
                    tracking_number: None,
                    occurred_at: at,
                }),
                Step::Deliver => OrderCommand::DeliverOrder(DeliverOrder {
                    order_id,
                    occurred_at: at,
                }),
                Step::Cancel => OrderCommand::CancelOrder(CancelOrder {
                    order_id,
                    reason: "prop".to_string(),
                    occurred_at: at,
                }),
                Step::Refund => OrderCommand::RefundOrder(RefundOrder {
                    order_id,
                    reason: "prop".to_string(),
                    occurred_at: at,
                }),
                Step::AddItem(price, quantity) => OrderCommand::AddItem(AddItem {
                    order_id,
                    item: new_item(price, quantity),
                    occurred_at: at,
                }),
                Step::UpdateQuantity(line_no, quantity) => {
                    OrderCommand::UpdateItemQuantity(UpdateItemQuantity {
                        order_id,
                        line_no,
                        quantity,
                        occurred_at: at,
                    })
                }
                Step::RemoveItem(line_no) => OrderCommand::RemoveItem(RemoveItem {
                    order_id,
                    line_no,
                    occurred_at: at,
                }),
                Step::Coupon(amount) => OrderCommand::ApplyCoupon(ApplyCoupon {
                    order_id,
                    code: "PROP".to_string(),
                    discount: usd(amount),
                    occurred_at: at,
                }),
                Step::Shipping(amount) => OrderCommand::SetShippingMethod(SetShippingMethod {
                    order_id,
                    shipping_method_id: "prop".to_string(),
                    cost: usd(amount),
                    occurred_at: at,
                }),
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

            #[test]
            fn history_and_pricing_hold_under_any_command_sequence(
                steps in prop::collection::vec(step(), 0..40)
            ) {
                let mut order = created_order();
                for s in &steps {
                    let before = order.clone();
                    let cmd = to_command(&order, s);
                    match execute(&mut order, &cmd) {
                        Ok(_) => {
                            prop_assert!(order.history().len() >= before.history().len());
                            let kept = &order.history()[..before.history().len()];
                            prop_assert_eq!(kept, before.history());
                        }
                        Err(_) => prop_assert_eq!(&order, &before),
                    }

                    prop_assert_eq!(order.history().last().map(|h| h.status), Some(order.status()));
                    prop_assert!(order.pricing().is_consistent());
                    prop_assert!(!order.total().is_negative());
                    let subtotal = Money::sum(
                        Currency::USD,
                        &order.items().iter().map(|i| i.total().unwrap()).collect::<Vec<_>>(),
                    ).unwrap();
                    prop_assert_eq!(order.pricing().subtotal, subtotal);
                    let tax = subtotal.percentage_bps(crate::TAX_RATE_BPS);
                    prop_assert_eq!(order.pricing().tax, tax);
                    prop_assert!(!order.items().is_empty());
                }
            }

            #[test]
            fn every_status_change_is_a_table_edge(steps in prop::collection::vec(step(), 0..40)) {
                let mut order = created_order();
                for s in &steps {
                    let cmd = to_command(&order, s);
                    let _ = execute(&mut order, &cmd);
                }
                for pair in order.history().windows(2) {
                    prop_assert!(pair[0].status.can_transition_to(pair[1].status));
                }
            }
        }
    }
}
