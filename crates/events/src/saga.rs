//! Saga / process manager mechanics (framework only, no business rules).
//!
//! - Explicit state machine per saga
//! - Driven by integration events, never by implicit handler chaining
//! - Compensating actions expressed as commands
//! - State persisted as saga events in the event store
//!
//! Infra loads saga history, applies it, asks the saga to react, persists any
//! emitted saga events and dispatches resulting commands. When a dispatched
//! command fails, infra asks the saga for compensations.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use retail_core::AggregateId;

use crate::{EventEnvelope, IntegrationEvent};

/// Actions a saga can emit in response to an incoming integration event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SagaAction {
    /// Append a saga event (serialized `Saga::SagaEvent`) to this saga's stream.
    Emit {
        event_type: String,
        payload: JsonValue,
    },
    /// Dispatch a command to a target aggregate.
    Command {
        aggregate_type: String,
        command_type: String,
        payload: JsonValue,
    },
    /// Dispatch a compensating command to undo prior side-effects.
    Compensate {
        aggregate_type: String,
        command_type: String,
        payload: JsonValue,
    },
    /// Mark saga as completed.
    Complete,
}

impl SagaAction {
    /// Build an `Emit` action from a typed saga event.
    pub fn emit<E: Serialize>(event_type: &str, event: &E) -> Self {
        Self::Emit {
            event_type: event_type.to_string(),
            payload: serde_json::to_value(event).unwrap_or(JsonValue::Null),
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, Self::Command { .. } | Self::Compensate { .. })
    }
}

/// Saga contract (mechanics only).
///
/// Implementors define:
/// - a typed state (encodes the explicit state machine)
/// - how to correlate incoming events to saga instances
/// - how to react to incoming events given current state
/// - how to apply saga events to mutate state
/// - which compensations to run when a dispatched command fails
pub trait Saga: Send + Sync + 'static {
    /// Typed state machine (serde for persistence).
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Saga events persisted in the saga's own stream.
    type SagaEvent: Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Correlation id (e.g. an order id), used to route events to a saga instance.
    type CorrelationId: Clone + Send + Sync + 'static;

    /// Stable saga type identifier (stream aggregate_type, e.g. "saga.order_fulfillment").
    fn saga_type() -> &'static str;

    /// Extract the correlation id from an incoming event (None if not relevant).
    fn correlate(envelope: &EventEnvelope<IntegrationEvent>) -> Option<Self::CorrelationId>;

    /// Deterministic saga stream id for a correlation id.
    fn saga_id(correlation: &Self::CorrelationId) -> AggregateId;

    /// Initial state for a new saga instance.
    fn initial_state(_correlation: &Self::CorrelationId) -> Self::State {
        Self::State::default()
    }

    /// Apply a saga event to mutate state (explicit state machine transitions).
    fn apply(state: &mut Self::State, event: &Self::SagaEvent);

    /// React to an incoming event, producing zero or more actions.
    fn react(
        state: &Self::State,
        correlation: &Self::CorrelationId,
        incoming: &EventEnvelope<IntegrationEvent>,
    ) -> Vec<SagaAction>;

    /// Compensations for a `Command` action that the target aggregate rejected
    /// while handling `incoming`.
    fn compensate(
        _state: &Self::State,
        _correlation: &Self::CorrelationId,
        _failed: &SagaAction,
        _reason: &str,
        _incoming: &EventEnvelope<IntegrationEvent>,
    ) -> Vec<SagaAction> {
        Vec::new()
    }
}
