//! Append-only event store boundary.
//!
//! Defines the persistence contract for aggregate event streams without
//! making any storage assumptions, plus an in-memory implementation.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
