//! Application services: one operation per aggregate transition.
//!
//! Each operation builds the domain command from plain typed arguments (ids,
//! timestamps and document numbers come from the injected generators), runs
//! it through the [`CommandDispatcher`] and returns the updated aggregate or a
//! [`DispatchError`]. The services never touch more than one aggregate per
//! dispatch; cross-aggregate steps are separate dispatches.

mod inventory;
mod orders;
mod payments;

use std::sync::Arc;

use serde_json::Value as JsonValue;

use retail_core::{AggregateId, Clock, DocumentNumber, ProductId, SequenceGenerator};
use retail_events::{EventBus, EventEnvelope, IntegrationEvent};
use retail_inventory::InventoryRecord;
use retail_orders::{Order, OrderId};
use retail_payments::{Payment, PaymentId};

use crate::command_dispatcher::CommandDispatcher;
use crate::config::CommerceConfig;
use crate::event_store::EventStore;

pub const ORDER_AGGREGATE: &str = "orders.order";
pub const PAYMENT_AGGREGATE: &str = "payments.payment";
pub const INVENTORY_AGGREGATE: &str = "inventory.record";

pub(crate) fn empty_order(id: AggregateId) -> Order {
    Order::empty(OrderId::new(id))
}

pub(crate) fn empty_payment(id: AggregateId) -> Payment {
    Payment::empty(PaymentId::new(id))
}

pub(crate) fn empty_record(id: AggregateId) -> InventoryRecord {
    InventoryRecord::empty(ProductId::from_uuid(*id.as_uuid()))
}

/// Order, payment and inventory operations over one event store.
pub struct CommerceService<S, D, I> {
    dispatcher: Arc<CommandDispatcher<S, D, I>>,
    config: CommerceConfig,
    numbers: Arc<dyn SequenceGenerator>,
    clock: Arc<dyn Clock>,
}

impl<S, D, I> Clone for CommerceService<S, D, I> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            config: self.config.clone(),
            numbers: Arc::clone(&self.numbers),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S, D, I> CommerceService<S, D, I>
where
    S: EventStore,
    D: EventBus<EventEnvelope<JsonValue>>,
    I: EventBus<EventEnvelope<IntegrationEvent>>,
{
    pub fn new(
        dispatcher: Arc<CommandDispatcher<S, D, I>>,
        config: CommerceConfig,
        numbers: Arc<dyn SequenceGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher,
            config,
            numbers,
            clock,
        }
    }

    pub fn config(&self) -> &CommerceConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, D, I> {
        &self.dispatcher
    }

    fn next_number(&self, prefix: &str) -> DocumentNumber {
        DocumentNumber::next(self.numbers.as_ref(), prefix)
    }
}
