//! Command execution pipeline (application-level orchestration).
//!
//! Every state change in the services goes through the same steps:
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate (apply historical events to rebuild state)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events to store (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish domain envelopes (projections) and integration events (other services, sagas)
//! ```
//!
//! A rejected command persists and publishes nothing. Publication happens only
//! after a successful append; if it fails the events are already stored, so
//! the caller may republish (at-least-once).
//!
//! This module contains no IO itself; it composes the `EventStore` and
//! `EventBus` traits.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use retail_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ExpectedVersion};
use retail_events::{EventBus, EventEnvelope, IntegrationEvent, IntegrationSource};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure: reload and retry.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Malformed input (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation is not allowed from the aggregate's current status.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Over-refund, negative stock or over-reservation.
    #[error("insufficient funds or stock: {0}")]
    InsufficientFundsOrStock(String),

    /// Domain invariant failure (deterministic).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("not found")]
    NotFound,

    /// Duplicate creation (deterministic, never retried).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Historical payloads could not be read back into the aggregate's event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(EventStoreError),

    /// Publication failed after a successful append (events are stored).
    #[error("event publication failed: {0}")]
    Publish(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_))
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvalidStateTransition { from, to } => {
                DispatchError::InvalidStateTransition { from, to }
            }
            DomainError::InsufficientFundsOrStock(msg) => {
                DispatchError::InsufficientFundsOrStock(msg)
            }
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::AlreadyExists(msg) => DispatchError::AlreadyExists(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
        }
    }
}

/// Outcome of a successful dispatch: the aggregate after the new events were
/// applied, and what was committed. `committed` is empty when the command was
/// an accepted no-op (e.g. expiring a payment that is not yet due).
#[derive(Debug, Clone)]
pub struct Dispatched<A> {
    pub aggregate: A,
    pub committed: Vec<StoredEvent>,
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - `S`: event store
/// - `D`: domain bus carrying JSON envelopes of every committed event
/// - `I`: integration bus carrying the cross-service events
///
/// Execution guarantees:
/// - events are persisted before anything is published
/// - each command operates on a single aggregate stream
/// - a stale version surfaces as [`DispatchError::Concurrency`]
#[derive(Debug)]
pub struct CommandDispatcher<S, D, I> {
    store: S,
    domain_bus: D,
    integration_bus: I,
}

impl<S, D, I> CommandDispatcher<S, D, I> {
    pub fn new(store: S, domain_bus: D, integration_bus: I) -> Self {
        Self {
            store,
            domain_bus,
            integration_bus,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_parts(self) -> (S, D, I) {
        (self.store, self.domain_bus, self.integration_bus)
    }
}

impl<S, D, I> CommandDispatcher<S, D, I>
where
    S: EventStore,
    D: EventBus<EventEnvelope<JsonValue>>,
    I: EventBus<EventEnvelope<IntegrationEvent>>,
{
    /// Load and rehydrate an aggregate; `NotFound` if its stream is empty.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: IntegrationSource<Error = DomainError>,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        if history.is_empty() {
            return Err(DispatchError::NotFound);
        }
        validate_loaded_stream(aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Dispatch a command through the full event-sourcing pipeline.
    ///
    /// `make_aggregate` builds the empty aggregate for `aggregate_id`
    /// (e.g. `Order::empty`), so the dispatcher stays generic over aggregate
    /// types. The expected version for the append is the version the stream
    /// had when it was loaded; a concurrent writer makes the append fail.
    #[instrument(
        level = "debug",
        skip_all,
        fields(aggregate_type = aggregate_type, aggregate_id = %aggregate_id)
    )]
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: IntegrationSource<Error = DomainError>,
        A::Event: retail_events::Event + Serialize + DeserializeOwned,
    {
        // 1) Load history
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        // 2) Rehydrate aggregate
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command).map_err(|e| {
            debug!(error = %e, "command rejected");
            DispatchError::from(e)
        })?;
        if decided.is_empty() {
            return Ok(Dispatched {
                aggregate,
                committed: vec![],
            });
        }

        // 4) Persist (append-only, optimistic)
        let uncommitted = decided
            .iter()
            .map(|ev| {
                UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected).map_err(|e| {
            if e.is_retryable() {
                warn!(error = %e, "append rejected by concurrency check");
            }
            DispatchError::from(e)
        })?;

        for ev in &decided {
            aggregate.apply(ev);
        }

        // 5) Publish (after append)
        for stored in &committed {
            self.domain_bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }

        for (stored, ev) in committed.iter().zip(&decided) {
            if let Some(integration) = aggregate.integration_event(ev) {
                debug!(
                    event = integration.name(),
                    sequence = stored.sequence_number,
                    "publishing integration event"
                );
                let envelope = EventEnvelope::new(
                    stored.event_id,
                    aggregate_id,
                    aggregate_type,
                    stored.sequence_number,
                    integration,
                );
                self.integration_bus
                    .publish(envelope)
                    .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
            }
        }

        debug!(events = committed.len(), version = aggregate.version(), "command committed");

        Ok(Dispatched { aggregate, committed })
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(
    aggregate_id: AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: IntegrationSource,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
