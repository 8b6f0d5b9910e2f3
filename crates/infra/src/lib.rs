//! Infrastructure layer: event store, dispatch, services, saga, read models, config.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod saga;
pub mod services;

pub use command_dispatcher::{CommandDispatcher, DispatchError, Dispatched};
pub use config::{CommerceConfig, ConfigError};
pub use services::CommerceService;

#[cfg(test)]
mod integration_tests;
