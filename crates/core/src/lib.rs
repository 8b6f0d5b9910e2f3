//! `retail-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the order, payment
//! and inventory services (no infrastructure concerns).

pub mod address;
pub mod aggregate;
pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod sequence;
pub mod value_object;

pub use address::Address;
pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use clock::{Clock, FixedClock, SystemClock};
pub use entity::Entity;
pub use error::{DomainError, DomainResult, require_non_blank};
pub use id::{AggregateId, ProductId, UserId};
pub use money::{Currency, Money};
pub use sequence::{DocumentNumber, InMemorySequence, SequenceGenerator};
pub use value_object::ValueObject;
