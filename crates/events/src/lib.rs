//! Domain events, integration events and messaging contracts.
//!
//! Domain events are the facts an aggregate's `handle` decides and its `apply`
//! folds into state. Integration events are the smaller, stable messages other
//! services react to. Nothing in this crate performs IO.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod integration;
pub mod saga;

pub use bus::{EventBus, Subscription};
pub use command::Command;
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use integration::{
    IntegrationEvent, IntegrationSource, OrderCreated, OrderStatusChanged, OrderedLine,
    PaymentCompleted, PaymentFailed, ProductStockUpdated,
};
pub use saga::{Saga, SagaAction};
