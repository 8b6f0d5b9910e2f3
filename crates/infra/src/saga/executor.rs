//! Saga commands executed against the commerce services.
//!
//! Payloads are the serialized domain command enums (`{"ConfirmOrder": {...}}`);
//! `command_type` must name the payload's variant.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use retail_events::{EventBus, EventEnvelope, IntegrationEvent};
use retail_inventory::InventoryCommand;
use retail_orders::OrderCommand;
use retail_payments::PaymentCommand;

use super::CommandExecutor;
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;
use crate::services::{CommerceService, INVENTORY_AGGREGATE, ORDER_AGGREGATE, PAYMENT_AGGREGATE};

fn decode<C: DeserializeOwned>(
    command_type: &str,
    payload: &JsonValue,
) -> Result<C, DispatchError> {
    if payload.get(command_type).is_none() {
        return Err(DispatchError::Validation(format!(
            "payload is not a {command_type} command"
        )));
    }
    serde_json::from_value(payload.clone()).map_err(|e| DispatchError::Deserialize(e.to_string()))
}

impl<S, D, I> CommandExecutor for CommerceService<S, D, I>
where
    S: EventStore,
    D: EventBus<EventEnvelope<JsonValue>>,
    I: EventBus<EventEnvelope<IntegrationEvent>>,
{
    type Error = DispatchError;

    fn execute(
        &self,
        aggregate_type: &str,
        command_type: &str,
        payload: &JsonValue,
    ) -> Result<(), Self::Error> {
        match aggregate_type {
            ORDER_AGGREGATE => self
                .execute_order(decode::<OrderCommand>(command_type, payload)?)
                .map(drop),
            PAYMENT_AGGREGATE => self
                .execute_payment(decode::<PaymentCommand>(command_type, payload)?)
                .map(drop),
            INVENTORY_AGGREGATE => self
                .execute_inventory(decode::<InventoryCommand>(command_type, payload)?)
                .map(drop),
            other => Err(DispatchError::Validation(format!("unknown aggregate type '{other}'"))),
        }
    }

    fn is_retryable(error: &DispatchError) -> bool {
        error.is_retryable()
    }
}
