//! Read model storage abstractions and paging.

pub mod store;

pub use store::{InMemoryReadStore, Page, Pagination, ReadStore};
