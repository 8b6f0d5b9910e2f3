//! Saga infrastructure: persistence, command execution and the runner.
//!
//! A saga's own history lives in the event store like any aggregate stream
//! (its `Emit` actions). Commands it issues go through a [`CommandExecutor`],
//! which in production is the [`CommerceService`](crate::services::CommerceService).

pub mod executor;
pub mod order_fulfillment;

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use retail_core::{AggregateId, ExpectedVersion};
use retail_events::{Event, EventEnvelope, IntegrationEvent, Saga, SagaAction, Subscription};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

pub use order_fulfillment::{
    OrderFulfillmentSaga, OrderFulfillmentSagaEvent, OrderFulfillmentState,
};

#[derive(Debug, Error)]
pub enum SagaError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("failed to deserialize saga event: {0}")]
    Deserialize(String),

    /// A compensating command failed too; the process needs manual attention.
    #[error("compensation {command_type} failed: {reason}")]
    Compensation { command_type: String, reason: String },
}

/// What one incoming event did to its saga instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// Not correlated, or nothing to do in the current state (includes redeliveries).
    Ignored,
    /// Actions ran; the saga is still waiting for more events.
    Advanced,
    Completed,
    /// A command failed and the compensating actions ran.
    Compensated { reason: String },
}

/// Repository for persisting saga events via the event store.
pub struct SagaRepository<G: Saga, E: EventStore> {
    event_store: E,
    _phantom: PhantomData<G>,
}

impl<G: Saga, E: EventStore> SagaRepository<G, E> {
    pub fn new(event_store: E) -> Self {
        Self {
            event_store,
            _phantom: PhantomData,
        }
    }

    /// Load saga event history for a saga instance.
    pub fn load(&self, saga_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.event_store.load_stream(saga_id)
    }

    /// Rebuild saga state from its history.
    pub fn load_state(
        &self,
        saga_id: AggregateId,
        correlation: &G::CorrelationId,
    ) -> Result<(G::State, u64), SagaError> {
        let history = self.load(saga_id)?;
        let mut state = G::initial_state(correlation);
        for stored in &history {
            let event: G::SagaEvent = serde_json::from_value(stored.payload.clone())
                .map_err(|e| SagaError::Deserialize(e.to_string()))?;
            G::apply(&mut state, &event);
        }
        let version = history.last().map(|e| e.sequence_number).unwrap_or(0);
        Ok((state, version))
    }

    /// Append a saga event (Emit action), stamped with the time of the
    /// integration event that caused it.
    ///
    /// Appends at `expected_version`, so two runners handling the same saga
    /// concurrently cannot both advance it.
    pub fn append_emit(
        &self,
        saga_id: AggregateId,
        event_type: &str,
        payload: JsonValue,
        expected_version: ExpectedVersion,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let uncommitted = UncommittedEvent {
            aggregate_id: saga_id,
            aggregate_type: G::saga_type().to_string(),
            event_id: uuid::Uuid::now_v7(),
            event_type: event_type.to_string(),
            event_version: 1,
            payload,
            occurred_at,
        };
        self.event_store.append(vec![uncommitted], expected_version)
    }
}

/// Command executor trait for saga actions.
pub trait CommandExecutor: Send + Sync {
    type Error: std::fmt::Display;

    fn execute(
        &self,
        aggregate_type: &str,
        command_type: &str,
        payload: &JsonValue,
    ) -> Result<(), Self::Error>;

    /// Whether running the same command again may succeed (a stale version).
    fn is_retryable(_error: &Self::Error) -> bool {
        false
    }
}

/// Attempts per saga command before a retryable failure counts as a rejection.
pub const DEFAULT_MAX_COMMAND_ATTEMPTS: u32 = 3;

/// Drives one saga type: correlate, rebuild state, react, run the actions.
pub struct SagaRunner<G: Saga, E: EventStore, X: CommandExecutor> {
    repository: SagaRepository<G, E>,
    executor: X,
    max_command_attempts: u32,
}

impl<G, E, X> SagaRunner<G, E, X>
where
    G: Saga,
    E: EventStore,
    X: CommandExecutor,
{
    pub fn new(event_store: E, executor: X) -> Self {
        Self {
            repository: SagaRepository::new(event_store),
            executor,
            max_command_attempts: DEFAULT_MAX_COMMAND_ATTEMPTS,
        }
    }

    /// At least one attempt is always made.
    pub fn with_max_command_attempts(mut self, attempts: u32) -> Self {
        self.max_command_attempts = attempts.max(1);
        self
    }

    pub fn repository(&self) -> &SagaRepository<G, E> {
        &self.repository
    }

    /// Handle one integration event.
    ///
    /// Actions run in order. `Emit` actions are appended to the saga stream
    /// before any later command runs, so a redelivered event finds the saga
    /// already advanced and is ignored. The first failing command stops the
    /// remaining actions and triggers the saga's compensation. Retryable
    /// failures (stale versions) are re-run first, so compensation only
    /// follows a real rejection.
    pub fn process(
        &self,
        envelope: &EventEnvelope<IntegrationEvent>,
    ) -> Result<SagaOutcome, SagaError> {
        let Some(correlation) = G::correlate(envelope) else {
            return Ok(SagaOutcome::Ignored);
        };
        let saga_id = G::saga_id(&correlation);
        let (mut state, mut version) = self.repository.load_state(saga_id, &correlation)?;
        let occurred_at = envelope.payload().occurred_at();

        let actions = G::react(&state, &correlation, envelope);
        if actions.is_empty() {
            return Ok(SagaOutcome::Ignored);
        }
        debug!(
            saga = G::saga_type(),
            saga_id = %saga_id,
            event = envelope.payload().name(),
            actions = actions.len(),
            "saga reacting"
        );

        let mut outcome = SagaOutcome::Advanced;
        for action in &actions {
            match action {
                SagaAction::Emit { event_type, payload } => {
                    let emitted = Emitted {
                        event_type,
                        payload,
                        occurred_at,
                    };
                    self.emit(saga_id, &mut state, &mut version, emitted)?;
                }
                SagaAction::Command {
                    aggregate_type,
                    command_type,
                    payload,
                }
                | SagaAction::Compensate {
                    aggregate_type,
                    command_type,
                    payload,
                } => {
                    if let Err(e) = self.run_command(aggregate_type, command_type, payload) {
                        let reason = format!("{command_type} failed: {e}");
                        warn!(
                            saga = G::saga_type(),
                            saga_id = %saga_id,
                            reason = %reason,
                            "saga command failed, compensating"
                        );
                        let failed = Failed {
                            action,
                            reason: &reason,
                            incoming: envelope,
                        };
                        self.compensate(saga_id, &mut state, &mut version, &correlation, failed)?;
                        return Ok(SagaOutcome::Compensated { reason });
                    }
                }
                SagaAction::Complete => {
                    info!(saga = G::saga_type(), saga_id = %saga_id, "saga completed");
                    outcome = SagaOutcome::Completed;
                }
            }
        }

        Ok(outcome)
    }

    /// Process everything queued on `subscription`, including events published
    /// by the commands the saga itself issued, until the queue is empty.
    ///
    /// Ignored events are left out. Failures are returned in delivery order
    /// next to the outcomes; a [`SagaError::Compensation`] needs an operator.
    pub fn drain(
        &self,
        subscription: &Subscription<EventEnvelope<IntegrationEvent>>,
    ) -> Vec<Result<SagaOutcome, SagaError>> {
        let mut results = Vec::new();
        loop {
            let batch = subscription.drain();
            if batch.is_empty() {
                return results;
            }
            for envelope in &batch {
                match self.process(envelope) {
                    Ok(SagaOutcome::Ignored) => {}
                    Ok(outcome) => results.push(Ok(outcome)),
                    Err(e) => {
                        warn!(
                            saga = G::saga_type(),
                            event = envelope.payload().name(),
                            error = %e,
                            "saga processing failed"
                        );
                        results.push(Err(e));
                    }
                }
            }
        }
    }

    fn run_command(
        &self,
        aggregate_type: &str,
        command_type: &str,
        payload: &JsonValue,
    ) -> Result<(), X::Error> {
        let mut attempt = 1;
        loop {
            match self.executor.execute(aggregate_type, command_type, payload) {
                Err(e) if X::is_retryable(&e) && attempt < self.max_command_attempts => {
                    debug!(
                        saga = G::saga_type(),
                        command = command_type,
                        attempt,
                        error = %e,
                        "retrying saga command"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn emit(
        &self,
        saga_id: AggregateId,
        state: &mut G::State,
        version: &mut u64,
        emitted: Emitted<'_>,
    ) -> Result<(), SagaError> {
        let event: G::SagaEvent = serde_json::from_value(emitted.payload.clone())
            .map_err(|e| SagaError::Deserialize(e.to_string()))?;
        let committed = self.repository.append_emit(
            saga_id,
            emitted.event_type,
            emitted.payload.clone(),
            ExpectedVersion::Exact(*version),
            emitted.occurred_at,
        )?;
        if let Some(last) = committed.last() {
            *version = last.sequence_number;
        }
        G::apply(state, &event);
        Ok(())
    }

    fn compensate(
        &self,
        saga_id: AggregateId,
        state: &mut G::State,
        version: &mut u64,
        correlation: &G::CorrelationId,
        failed: Failed<'_>,
    ) -> Result<(), SagaError> {
        let occurred_at = failed.incoming.payload().occurred_at();
        let compensations =
            G::compensate(state, correlation, failed.action, failed.reason, failed.incoming);
        for action in &compensations {
            match action {
                SagaAction::Emit { event_type, payload } => {
                    let emitted = Emitted {
                        event_type,
                        payload,
                        occurred_at,
                    };
                    self.emit(saga_id, state, version, emitted)?;
                }
                SagaAction::Command {
                    aggregate_type,
                    command_type,
                    payload,
                }
                | SagaAction::Compensate {
                    aggregate_type,
                    command_type,
                    payload,
                } => {
                    self.run_command(aggregate_type, command_type, payload)
                        .map_err(|e| SagaError::Compensation {
                            command_type: command_type.clone(),
                            reason: e.to_string(),
                        })?;
                }
                SagaAction::Complete => {}
            }
        }
        Ok(())
    }
}

/// A saga event about to be appended.
struct Emitted<'a> {
    event_type: &'a str,
    payload: &'a JsonValue,
    occurred_at: DateTime<Utc>,
}

/// The command that failed and the event being handled when it did.
struct Failed<'a> {
    action: &'a SagaAction,
    reason: &'a str,
    incoming: &'a EventEnvelope<IntegrationEvent>,
}
