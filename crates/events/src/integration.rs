//! Integration events: the cross-service contract.
//!
//! Each variant carries exactly the identifiers and amounts a downstream
//! service needs to drive its own aggregate. Statuses travel as their stable
//! lower-case names so consumers do not depend on another service's enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use retail_core::{Aggregate, AggregateId, DocumentNumber, Money, ProductId, UserId};

use crate::Event;

/// One ordered product line, as far as stock reservation is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: AggregateId,
    pub order_number: DocumentNumber,
    pub user_id: UserId,
    pub lines: Vec<OrderedLine>,
    pub total: Money,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: AggregateId,
    pub from: String,
    pub to: String,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub payment_id: AggregateId,
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub amount: Money,
    pub gateway_transaction_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Emitted for every terminal failure of a payment: failed, cancelled or expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub payment_id: AggregateId,
    pub order_id: AggregateId,
    pub reason: String,
    pub error_code: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStockUpdated {
    pub product_id: ProductId,
    /// Movement type name ("adjustment", "reservation", "release", "sale", "return").
    pub movement: String,
    pub quantity_delta: i64,
    pub quantity: i64,
    pub reserved: i64,
    pub available: i64,
    pub order_id: Option<AggregateId>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationEvent {
    OrderCreated(OrderCreated),
    OrderStatusChanged(OrderStatusChanged),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    ProductStockUpdated(ProductStockUpdated),
}

impl IntegrationEvent {
    /// The published event name.
    pub fn name(&self) -> &'static str {
        self.event_type()
    }
}

impl Event for IntegrationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            IntegrationEvent::OrderCreated(_) => "OrderCreated",
            IntegrationEvent::OrderStatusChanged(_) => "OrderStatusChanged",
            IntegrationEvent::PaymentCompleted(_) => "PaymentCompleted",
            IntegrationEvent::PaymentFailed(_) => "PaymentFailed",
            IntegrationEvent::ProductStockUpdated(_) => "ProductStockUpdated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            IntegrationEvent::OrderCreated(e) => e.occurred_at,
            IntegrationEvent::OrderStatusChanged(e) => e.occurred_at,
            IntegrationEvent::PaymentCompleted(e) => e.occurred_at,
            IntegrationEvent::PaymentFailed(e) => e.occurred_at,
            IntegrationEvent::ProductStockUpdated(e) => e.occurred_at,
        }
    }
}

/// Aggregates that announce some of their domain events to other services.
///
/// Called with the aggregate state *after* the events were applied, so totals
/// and counters in the integration payload reflect the committed state.
pub trait IntegrationSource: Aggregate {
    fn integration_event(&self, event: &Self::Event) -> Option<IntegrationEvent>;

    fn integration_events(&self, events: &[Self::Event]) -> Vec<IntegrationEvent> {
        events
            .iter()
            .filter_map(|e| self.integration_event(e))
            .collect()
    }
}
