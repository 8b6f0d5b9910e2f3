//! Inventory domain module (event-sourced).
//!
//! One stock record per product with total and reserved counters, plus an
//! append-only movement ledger that explains every change to the total.
//! Pure, deterministic domain logic (no IO, no HTTP, no storage).

pub mod movement;
pub mod record;

pub use movement::{MovementType, StockMovement, replay_total};
pub use record::{
    AdjustStock, CreateRecord, InventoryCommand, InventoryEvent, InventoryRecord, RecordCreated,
    RecordReturn, RecordSale, Relocate, Relocated, ReleaseStock, ReserveStock, StockMoved,
};
