use serde_json::Value as JsonValue;
use tracing::info;

use retail_core::{Address, AggregateId, Money, UserId};
use retail_events::{EventBus, EventEnvelope, IntegrationEvent};
use retail_orders::{
    AddItem, ApplyCoupon, AttachPayment, CancelOrder, ChangeShippingAddress, ConfirmOrder,
    CreateOrder, DeliverOrder, NewLineItem, Order, OrderCommand, OrderId, ProcessOrder,
    RefundOrder, RemoveCoupon, RemoveItem, SetBillingAddress, SetShippingMethod, ShipOrder,
    UpdateItemQuantity,
};

use super::{CommerceService, ORDER_AGGREGATE, empty_order};
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;

impl<S, D, I> CommerceService<S, D, I>
where
    S: EventStore,
    D: EventBus<EventEnvelope<JsonValue>>,
    I: EventBus<EventEnvelope<IntegrationEvent>>,
{
    /// Run an already-built order command.
    pub fn execute_order(&self, command: OrderCommand) -> Result<Order, DispatchError> {
        let order_id = command.order_id();
        self.dispatcher
            .dispatch(order_id.0, ORDER_AGGREGATE, command, empty_order)
            .map(|out| out.aggregate)
    }

    pub fn get_order(&self, order_id: OrderId) -> Result<Order, DispatchError> {
        self.dispatcher.load(order_id.0, empty_order)
    }

    /// Create a pending order priced in the configured currency.
    pub fn place_order(
        &self,
        user_id: UserId,
        items: Vec<NewLineItem>,
        shipping_address: Address,
        billing_address: Option<Address>,
    ) -> Result<Order, DispatchError> {
        let order_id = OrderId::new(AggregateId::new());
        let order_number = self.next_number(&self.config.order_number_prefix);

        let order = self.execute_order(OrderCommand::CreateOrder(CreateOrder {
            order_id,
            order_number,
            user_id,
            currency: self.config.currency,
            items,
            shipping_address,
            billing_address,
            occurred_at: self.clock.now(),
        }))?;

        info!(
            order_id = %order_id,
            order_number = order.order_number().map(|n| n.as_str()).unwrap_or_default(),
            total = %order.total(),
            "order placed"
        );
        Ok(order)
    }

    pub fn add_item(&self, order_id: OrderId, item: NewLineItem) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::AddItem(AddItem {
            order_id,
            item,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn remove_item(&self, order_id: OrderId, line_no: u32) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::RemoveItem(RemoveItem {
            order_id,
            line_no,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn update_item_quantity(
        &self,
        order_id: OrderId,
        line_no: u32,
        quantity: u32,
    ) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::UpdateItemQuantity(UpdateItemQuantity {
            order_id,
            line_no,
            quantity,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn apply_coupon(
        &self,
        order_id: OrderId,
        code: impl Into<String>,
        discount: Money,
    ) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::ApplyCoupon(ApplyCoupon {
            order_id,
            code: code.into(),
            discount,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn remove_coupon(&self, order_id: OrderId) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::RemoveCoupon(RemoveCoupon {
            order_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn set_shipping_method(
        &self,
        order_id: OrderId,
        shipping_method_id: impl Into<String>,
        cost: Money,
    ) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::SetShippingMethod(SetShippingMethod {
            order_id,
            shipping_method_id: shipping_method_id.into(),
            cost,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn change_shipping_address(
        &self,
        order_id: OrderId,
        address: Address,
    ) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::ChangeShippingAddress(ChangeShippingAddress {
            order_id,
            address,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn set_billing_address(
        &self,
        order_id: OrderId,
        address: Address,
    ) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::SetBillingAddress(SetBillingAddress {
            order_id,
            address,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn attach_payment(
        &self,
        order_id: OrderId,
        payment_id: AggregateId,
    ) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::AttachPayment(AttachPayment {
            order_id,
            payment_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn confirm_order(
        &self,
        order_id: OrderId,
        reason: Option<String>,
    ) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::ConfirmOrder(ConfirmOrder {
            order_id,
            reason,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn process_order(&self, order_id: OrderId) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::ProcessOrder(ProcessOrder {
            order_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn ship_order(
        &self,
        order_id: OrderId,
        tracking_number: Option<String>,
    ) -> Result<Order, DispatchError> {
        let order = self.execute_order(OrderCommand::ShipOrder(ShipOrder {
            order_id,
            tracking_number,
            occurred_at: self.clock.now(),
        }))?;
        info!(
            order_id = %order_id,
            tracking = order.tracking_number().unwrap_or_default(),
            "order shipped"
        );
        Ok(order)
    }

    pub fn deliver_order(&self, order_id: OrderId) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::DeliverOrder(DeliverOrder {
            order_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn cancel_order(
        &self,
        order_id: OrderId,
        reason: impl Into<String>,
    ) -> Result<Order, DispatchError> {
        let reason = reason.into();
        let order = self.execute_order(OrderCommand::CancelOrder(CancelOrder {
            order_id,
            reason: reason.clone(),
            occurred_at: self.clock.now(),
        }))?;
        info!(order_id = %order_id, reason = %reason, "order cancelled");
        Ok(order)
    }

    pub fn refund_order(
        &self,
        order_id: OrderId,
        reason: impl Into<String>,
    ) -> Result<Order, DispatchError> {
        self.execute_order(OrderCommand::RefundOrder(RefundOrder {
            order_id,
            reason: reason.into(),
            occurred_at: self.clock.now(),
        }))
    }
}
