//! Projection implementations (read model builders).
//!
//! Projections consume domain events and build query-optimized read models.
//! All projections are:
//! - **Rebuildable**: Can be reconstructed from the event stream
//! - **Idempotent**: Safe for at-least-once delivery

pub mod inventory_ledger;

pub use inventory_ledger::{
    InventoryLedgerProjection, LedgerEntry, LedgerProjectionError, MovementFilter, StockLevel,
};
