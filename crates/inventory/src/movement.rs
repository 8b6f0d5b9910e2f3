//! Stock movements: the audit trail of an inventory record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use retail_core::{AggregateId, ProductId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementType {
    Adjustment,
    Reservation,
    Release,
    Sale,
    Return,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Adjustment => "adjustment",
            MovementType::Reservation => "reservation",
            MovementType::Release => "release",
            MovementType::Sale => "sale",
            MovementType::Return => "return",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable stock change.
///
/// `quantity_delta` is the change to the *total* only; reservations and
/// releases shift units between available and reserved, so their delta is
/// zero and `units` records how many moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub product_id: ProductId,
    pub movement_type: MovementType,
    pub quantity_delta: i64,
    pub units: i64,
    pub quantity_before: i64,
    pub quantity_after: i64,
    pub reserved_after: i64,
    pub reason: String,
    pub note: Option<String>,
    pub actor: Option<UserId>,
    pub order_id: Option<AggregateId>,
    pub occurred_at: DateTime<Utc>,
}

impl StockMovement {
    pub fn available_after(&self) -> i64 {
        self.quantity_after - self.reserved_after
    }
}

/// Total reproduced from scratch by summing every delta.
pub fn replay_total<'a>(movements: impl IntoIterator<Item = &'a StockMovement>) -> i64 {
    movements.into_iter().map(|m| m.quantity_delta).sum()
}
