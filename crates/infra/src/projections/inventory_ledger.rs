use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use retail_core::{AggregateId, ProductId, UserId};
use retail_events::EventEnvelope;
use retail_inventory::{InventoryEvent, MovementType, StockMovement};

use crate::read_model::{Page, Pagination, ReadStore};
use crate::services::INVENTORY_AGGREGATE;

/// Current stock of one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub product_id: ProductId,
    pub location: String,
    pub quantity: i64,
    pub reserved: i64,
    pub available: i64,
    pub last_updated: DateTime<Utc>,
}

/// One movement as recorded in the ledger, with its position in the product stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub sequence_number: u64,
    pub movement: StockMovement,
}

/// Movement query. Unset fields match everything; `from`/`to` are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovementFilter {
    pub product_id: Option<ProductId>,
    pub movement_type: Option<MovementType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub actor: Option<UserId>,
    pub order_id: Option<AggregateId>,
}

impl MovementFilter {
    pub fn for_product(product_id: ProductId) -> Self {
        Self {
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    fn matches(&self, m: &StockMovement) -> bool {
        self.product_id.is_none_or(|p| p == m.product_id)
            && self.movement_type.is_none_or(|t| t == m.movement_type)
            && self.from.is_none_or(|from| m.occurred_at >= from)
            && self.to.is_none_or(|to| m.occurred_at <= to)
            && self.actor.is_none_or(|a| m.actor == Some(a))
            && self.order_id.is_none_or(|o| m.order_id == Some(o))
    }
}

#[derive(Debug, Error)]
pub enum LedgerProjectionError {
    #[error("failed to deserialize inventory event: {0}")]
    Deserialize(String),

    #[error("stream mismatch: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Inventory ledger projection.
///
/// Consumes published domain envelopes of inventory records and maintains the
/// current stock level per product plus the full movement log. Envelopes of
/// other aggregate types are skipped. Read models are disposable and
/// rebuildable from the event stream.
#[derive(Debug)]
pub struct InventoryLedgerProjection<S>
where
    S: ReadStore<ProductId, StockLevel>,
{
    levels: S,
    movements: RwLock<Vec<LedgerEntry>>,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> InventoryLedgerProjection<S>
where
    S: ReadStore<ProductId, StockLevel>,
{
    pub fn new(levels: S) -> Self {
        Self {
            levels,
            movements: RwLock::new(Vec::new()),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, product_id: ProductId) -> Option<StockLevel> {
        self.levels.get(&product_id)
    }

    /// Matching movements, newest first.
    pub fn movements(&self, filter: &MovementFilter, pagination: Pagination) -> Page<LedgerEntry> {
        let mut matching: Vec<LedgerEntry> = match self.movements.read() {
            Ok(entries) => entries
                .iter()
                .filter(|e| filter.matches(&e.movement))
                .cloned()
                .collect(),
            Err(_) => vec![],
        };
        matching.sort_by(|a, b| {
            let newer = (b.movement.occurred_at, b.sequence_number);
            newer.cmp(&(a.movement.occurred_at, a.sequence_number))
        });
        pagination.apply(matching)
    }

    /// Products whose available stock is at or below `threshold`, lowest first.
    pub fn low_stock(&self, threshold: i64) -> Vec<StockLevel> {
        let mut levels: Vec<_> = self
            .levels
            .list()
            .into_iter()
            .filter(|l| l.available <= threshold)
            .collect();
        levels.sort_by_key(|l| (l.available, *l.product_id.as_uuid()));
        levels
    }

    pub fn out_of_stock(&self) -> Vec<StockLevel> {
        self.low_stock(0)
    }

    /// Apply a published envelope into the projection.
    ///
    /// - Skips envelopes of other aggregate types
    /// - Enforces monotonic sequence per product stream
    /// - Idempotent for at-least-once delivery (replays <= cursor are ignored)
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), LedgerProjectionError> {
        if envelope.aggregate_type() != INVENTORY_AGGREGATE {
            return Ok(());
        }
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let Ok(mut cursors) = self.cursors.write() else {
            return Ok(());
        };
        let last = *cursors.get(&aggregate_id).unwrap_or(&0);

        if seq == 0 {
            return Err(LedgerProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 && last != 0 {
            return Err(LedgerProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: InventoryEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| LedgerProjectionError::Deserialize(e.to_string()))?;

        let product_id = match &event {
            InventoryEvent::RecordCreated(e) => e.product_id,
            InventoryEvent::StockMoved(e) => e.movement.product_id,
            InventoryEvent::Relocated(e) => e.product_id,
        };
        if product_id.as_aggregate_id() != aggregate_id {
            return Err(LedgerProjectionError::StreamMismatch(
                "event product_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match event {
            InventoryEvent::RecordCreated(e) => {
                self.levels.upsert(
                    product_id,
                    StockLevel {
                        product_id,
                        location: e.location,
                        quantity: 0,
                        reserved: 0,
                        available: 0,
                        last_updated: e.occurred_at,
                    },
                );
            }
            InventoryEvent::StockMoved(e) => {
                let m = e.movement;
                let mut level = self.levels.get(&product_id).unwrap_or(StockLevel {
                    product_id,
                    location: String::new(),
                    quantity: 0,
                    reserved: 0,
                    available: 0,
                    last_updated: m.occurred_at,
                });
                level.quantity = m.quantity_after;
                level.reserved = m.reserved_after;
                level.available = m.available_after();
                level.last_updated = m.occurred_at;
                self.levels.upsert(product_id, level);

                debug!(
                    product_id = %product_id,
                    movement = %m.movement_type,
                    delta = m.quantity_delta,
                    "ledger movement"
                );
                if let Ok(mut movements) = self.movements.write() {
                    movements.push(LedgerEntry {
                        sequence_number: seq,
                        movement: m,
                    });
                }
            }
            InventoryEvent::Relocated(e) => {
                if let Some(mut level) = self.levels.get(&product_id) {
                    level.location = e.to;
                    level.last_updated = e.occurred_at;
                    self.levels.upsert(product_id, level);
                }
            }
        }

        cursors.insert(aggregate_id, seq);
        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), LedgerProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
        if let Ok(mut movements) = self.movements.write() {
            movements.clear();
        }
        self.levels.clear();

        // Deterministic replay order: aggregate, sequence.
        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }
}
