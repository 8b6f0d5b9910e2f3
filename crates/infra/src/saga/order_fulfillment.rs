//! Order fulfilment saga: payment → confirmation → stock reservation.
//!
//! ```text
//! OrderCreated      → remember the ordered lines
//! PaymentCompleted  → ConfirmOrder, ReserveStock per line
//! PaymentFailed     → CancelOrder
//! order cancelled   → stop tracking
//! ```
//!
//! Compensation:
//! - a reservation fails → release the lines already reserved, cancel the
//!   order, refund the payment in full
//! - the confirmation fails (order cancelled meanwhile) → refund the payment
//!
//! Payment events that arrive before the saga has seen `OrderCreated` are
//! ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use retail_core::{AggregateId, Money, ProductId};
use retail_events::{Event, EventEnvelope, IntegrationEvent, OrderedLine, Saga, SagaAction};
use retail_inventory::{InventoryCommand, ReleaseStock, ReserveStock};
use retail_orders::{CancelOrder, ConfirmOrder, OrderCommand, OrderId};
use retail_payments::{CreateRefund, PaymentCommand, PaymentId, RefundId, RefundType};

use crate::services::{INVENTORY_AGGREGATE, ORDER_AGGREGATE, PAYMENT_AGGREGATE};

/// Namespace for deriving saga stream ids from order ids.
const SAGA_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c8e_4b7a_4e0f_9a51_3d2c_8b6e_f104);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderFulfillmentState {
    #[default]
    AwaitingOrder,
    AwaitingPayment {
        lines: Vec<OrderedLine>,
        total: Money,
    },
    Fulfilling {
        payment_id: AggregateId,
        amount: Money,
        lines: Vec<OrderedLine>,
    },
    Completed {
        payment_id: AggregateId,
    },
    Cancelled {
        reason: String,
    },
    Compensated {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderFulfillmentSagaEvent {
    OrderPlaced { lines: Vec<OrderedLine>, total: Money },
    PaymentReceived { payment_id: AggregateId, amount: Money },
    FulfillmentCompleted,
    OrderCancelled { reason: String },
    CompensationStarted { reason: String },
}

impl OrderFulfillmentSagaEvent {
    fn name(&self) -> &'static str {
        match self {
            OrderFulfillmentSagaEvent::OrderPlaced { .. } => "order_placed",
            OrderFulfillmentSagaEvent::PaymentReceived { .. } => "payment_received",
            OrderFulfillmentSagaEvent::FulfillmentCompleted => "fulfillment_completed",
            OrderFulfillmentSagaEvent::OrderCancelled { .. } => "order_cancelled",
            OrderFulfillmentSagaEvent::CompensationStarted { .. } => "compensation_started",
        }
    }

    fn into_action(self) -> SagaAction {
        SagaAction::emit(self.name(), &self)
    }
}

fn order_command(command_type: &str, command: OrderCommand, compensating: bool) -> SagaAction {
    action(ORDER_AGGREGATE, command_type, serde_json::to_value(&command), compensating)
}

fn payment_command(command_type: &str, command: PaymentCommand, compensating: bool) -> SagaAction {
    action(PAYMENT_AGGREGATE, command_type, serde_json::to_value(&command), compensating)
}

fn inventory_command(
    command_type: &str,
    command: InventoryCommand,
    compensating: bool,
) -> SagaAction {
    action(INVENTORY_AGGREGATE, command_type, serde_json::to_value(&command), compensating)
}

fn action(
    aggregate_type: &str,
    command_type: &str,
    payload: Result<JsonValue, serde_json::Error>,
    compensating: bool,
) -> SagaAction {
    let aggregate_type = aggregate_type.to_string();
    let command_type = command_type.to_string();
    // A Null payload is rejected by the executor.
    let payload = payload.unwrap_or(JsonValue::Null);
    if compensating {
        SagaAction::Compensate {
            aggregate_type,
            command_type,
            payload,
        }
    } else {
        SagaAction::Command {
            aggregate_type,
            command_type,
            payload,
        }
    }
}

/// Quantity to reserve per product, merging lines for the same product and
/// keeping first-seen order.
fn reservations(lines: &[OrderedLine]) -> Vec<(ProductId, u32)> {
    let mut out: Vec<(ProductId, u32)> = Vec::with_capacity(lines.len());
    for line in lines {
        match out.iter_mut().find(|(product_id, _)| *product_id == line.product_id) {
            Some((_, quantity)) => *quantity = quantity.saturating_add(line.quantity),
            None => out.push((line.product_id, line.quantity)),
        }
    }
    out
}

pub struct OrderFulfillmentSaga;

impl Saga for OrderFulfillmentSaga {
    type State = OrderFulfillmentState;
    type SagaEvent = OrderFulfillmentSagaEvent;
    type CorrelationId = OrderId;

    fn saga_type() -> &'static str {
        "saga.order_fulfillment"
    }

    fn correlate(envelope: &EventEnvelope<IntegrationEvent>) -> Option<Self::CorrelationId> {
        let order_id = match envelope.payload() {
            IntegrationEvent::OrderCreated(e) => e.order_id,
            IntegrationEvent::OrderStatusChanged(e) => e.order_id,
            IntegrationEvent::PaymentCompleted(e) => e.order_id,
            IntegrationEvent::PaymentFailed(e) => e.order_id,
            IntegrationEvent::ProductStockUpdated(_) => return None,
        };
        Some(OrderId::new(order_id))
    }

    fn saga_id(correlation: &Self::CorrelationId) -> AggregateId {
        // Distinct from the order's own stream id.
        AggregateId::from_uuid(Uuid::new_v5(&SAGA_NAMESPACE, correlation.0.as_uuid().as_bytes()))
    }

    fn apply(state: &mut Self::State, event: &Self::SagaEvent) {
        match event {
            OrderFulfillmentSagaEvent::OrderPlaced { lines, total } => {
                *state = OrderFulfillmentState::AwaitingPayment {
                    lines: lines.clone(),
                    total: *total,
                };
            }
            OrderFulfillmentSagaEvent::PaymentReceived { payment_id, amount } => {
                let lines = match state {
                    OrderFulfillmentState::AwaitingPayment { lines, .. } => lines.clone(),
                    _ => Vec::new(),
                };
                *state = OrderFulfillmentState::Fulfilling {
                    payment_id: *payment_id,
                    amount: *amount,
                    lines,
                };
            }
            OrderFulfillmentSagaEvent::FulfillmentCompleted => {
                if let OrderFulfillmentState::Fulfilling { payment_id, .. } = state {
                    let payment_id = *payment_id;
                    *state = OrderFulfillmentState::Completed { payment_id };
                }
            }
            OrderFulfillmentSagaEvent::OrderCancelled { reason } => {
                *state = OrderFulfillmentState::Cancelled {
                    reason: reason.clone(),
                };
            }
            OrderFulfillmentSagaEvent::CompensationStarted { reason } => {
                *state = OrderFulfillmentState::Compensated {
                    reason: reason.clone(),
                };
            }
        }
    }

    fn react(
        state: &Self::State,
        correlation: &Self::CorrelationId,
        incoming: &EventEnvelope<IntegrationEvent>,
    ) -> Vec<SagaAction> {
        let occurred_at = incoming.payload().occurred_at();

        match (state, incoming.payload()) {
            (OrderFulfillmentState::AwaitingOrder, IntegrationEvent::OrderCreated(e)) => {
                vec![
                    OrderFulfillmentSagaEvent::OrderPlaced {
                        lines: e.lines.clone(),
                        total: e.total,
                    }
                    .into_action(),
                ]
            }
            (
                OrderFulfillmentState::AwaitingPayment { lines, .. },
                IntegrationEvent::PaymentCompleted(e),
            ) => {
                let mut actions = vec![
                    OrderFulfillmentSagaEvent::PaymentReceived {
                        payment_id: e.payment_id,
                        amount: e.amount,
                    }
                    .into_action(),
                    order_command(
                        "ConfirmOrder",
                        OrderCommand::ConfirmOrder(ConfirmOrder {
                            order_id: *correlation,
                            reason: Some("payment completed".to_string()),
                            occurred_at,
                        }),
                        false,
                    ),
                ];
                actions.extend(reservations(lines).into_iter().map(|(product_id, quantity)| {
                    inventory_command(
                        "ReserveStock",
                        InventoryCommand::ReserveStock(ReserveStock {
                            product_id,
                            quantity,
                            order_id: Some(correlation.0),
                            occurred_at,
                        }),
                        false,
                    )
                }));
                actions.push(OrderFulfillmentSagaEvent::FulfillmentCompleted.into_action());
                actions.push(SagaAction::Complete);
                actions
            }
            (OrderFulfillmentState::AwaitingPayment { .. }, IntegrationEvent::PaymentFailed(e)) => {
                let reason = format!("payment failed: {}", e.reason);
                vec![
                    OrderFulfillmentSagaEvent::OrderCancelled {
                        reason: reason.clone(),
                    }
                    .into_action(),
                    order_command(
                        "CancelOrder",
                        OrderCommand::CancelOrder(CancelOrder {
                            order_id: *correlation,
                            reason,
                            occurred_at,
                        }),
                        false,
                    ),
                    SagaAction::Complete,
                ]
            }
            (OrderFulfillmentState::AwaitingPayment { .. }, IntegrationEvent::OrderStatusChanged(e))
                if e.to == "cancelled" =>
            {
                vec![
                    OrderFulfillmentSagaEvent::OrderCancelled {
                        reason: e.reason.clone().unwrap_or_else(|| "order cancelled".to_string()),
                    }
                    .into_action(),
                    SagaAction::Complete,
                ]
            }
            _ => Vec::new(),
        }
    }

    fn compensate(
        state: &Self::State,
        correlation: &Self::CorrelationId,
        failed: &SagaAction,
        reason: &str,
        incoming: &EventEnvelope<IntegrationEvent>,
    ) -> Vec<SagaAction> {
        let OrderFulfillmentState::Fulfilling {
            payment_id,
            amount,
            lines,
        } = state
        else {
            return Vec::new();
        };
        let occurred_at = incoming.payload().occurred_at();

        let SagaAction::Command {
            command_type, payload, ..
        } = failed
        else {
            return Vec::new();
        };

        let mut actions = vec![
            OrderFulfillmentSagaEvent::CompensationStarted {
                reason: reason.to_string(),
            }
            .into_action(),
        ];

        if command_type == "ReserveStock" {
            // Lines before the failed one were reserved; release them.
            let failed_product = serde_json::from_value::<InventoryCommand>(payload.clone())
                .ok()
                .map(|cmd| cmd.product_id());
            let reserved = reservations(lines)
                .into_iter()
                .take_while(|(product_id, _)| Some(*product_id) != failed_product);
            actions.extend(reserved.map(|(product_id, quantity)| {
                inventory_command(
                    "ReleaseStock",
                    InventoryCommand::ReleaseStock(ReleaseStock {
                        product_id,
                        quantity,
                        order_id: Some(correlation.0),
                        occurred_at,
                    }),
                    true,
                )
            }));
            actions.push(order_command(
                "CancelOrder",
                OrderCommand::CancelOrder(CancelOrder {
                    order_id: *correlation,
                    reason: reason.to_string(),
                    occurred_at,
                }),
                true,
            ));
        }

        actions.push(payment_command(
            "CreateRefund",
            PaymentCommand::CreateRefund(CreateRefund {
                payment_id: PaymentId::new(*payment_id),
                refund_id: RefundId::new(),
                amount: *amount,
                reason: reason.to_string(),
                refund_type: RefundType::Full,
                occurred_at,
            }),
            true,
        ));

        actions
    }
}
