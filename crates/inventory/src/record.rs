use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use retail_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, ProductId, UserId, require_non_blank,
};
use retail_events::{Command, Event, IntegrationEvent, IntegrationSource, ProductStockUpdated};

use crate::movement::{MovementType, StockMovement};

/// Aggregate root: InventoryRecord (one per product).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRecord {
    id: ProductId,
    quantity: i64,
    reserved: i64,
    location: String,
    movements: Vec<StockMovement>,
    last_updated: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl InventoryRecord {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            quantity: 0,
            reserved: 0,
            location: String::new(),
            movements: Vec::new(),
            last_updated: None,
            version: 0,
            created: false,
        }
    }

    pub fn product_id(&self) -> ProductId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn reserved(&self) -> i64 {
        self.reserved
    }

    pub fn available(&self) -> i64 {
        self.quantity - self.reserved
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn movements(&self) -> &[StockMovement] {
        &self.movements
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn is_low_stock(&self, threshold: i64) -> bool {
        self.available() <= threshold
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.available() <= 0
    }
}

impl AggregateRoot for InventoryRecord {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateRecord.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRecord {
    pub product_id: ProductId,
    pub location: String,
    pub initial_quantity: i64,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub product_id: ProductId,
    pub delta: i64,
    pub reason: String,
    pub note: Option<String>,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub product_id: ProductId,
    pub quantity: u32,
    pub order_id: Option<AggregateId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseStock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStock {
    pub product_id: ProductId,
    pub quantity: u32,
    pub order_id: Option<AggregateId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordSale. Consumes previously reserved units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSale {
    pub product_id: ProductId,
    pub quantity: u32,
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordReturn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReturn {
    pub product_id: ProductId,
    pub quantity: u32,
    pub order_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: Relocate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocate {
    pub product_id: ProductId,
    pub location: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    CreateRecord(CreateRecord),
    AdjustStock(AdjustStock),
    ReserveStock(ReserveStock),
    ReleaseStock(ReleaseStock),
    RecordSale(RecordSale),
    RecordReturn(RecordReturn),
    Relocate(Relocate),
}

impl InventoryCommand {
    pub fn product_id(&self) -> ProductId {
        match self {
            InventoryCommand::CreateRecord(c) => c.product_id,
            InventoryCommand::AdjustStock(c) => c.product_id,
            InventoryCommand::ReserveStock(c) => c.product_id,
            InventoryCommand::ReleaseStock(c) => c.product_id,
            InventoryCommand::RecordSale(c) => c.product_id,
            InventoryCommand::RecordReturn(c) => c.product_id,
            InventoryCommand::Relocate(c) => c.product_id,
        }
    }
}

impl Command for InventoryCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.product_id().as_aggregate_id()
    }
}

/// Event: RecordCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCreated {
    pub product_id: ProductId,
    pub location: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockMoved. Every change to either counter goes through here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMoved {
    pub movement: StockMovement,
}

/// Event: Relocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocated {
    pub product_id: ProductId,
    pub from: String,
    pub to: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    RecordCreated(RecordCreated),
    StockMoved(StockMoved),
    Relocated(Relocated),
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::RecordCreated(_) => "inventory.record.created",
            InventoryEvent::StockMoved(_) => "inventory.record.stock_moved",
            InventoryEvent::Relocated(_) => "inventory.record.relocated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::RecordCreated(e) => e.occurred_at,
            InventoryEvent::StockMoved(e) => e.movement.occurred_at,
            InventoryEvent::Relocated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryRecord {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::RecordCreated(e) => {
                self.id = e.product_id;
                self.location = e.location.clone();
                self.quantity = 0;
                self.reserved = 0;
                self.movements.clear();
                self.created = true;
            }
            InventoryEvent::StockMoved(e) => {
                self.quantity = e.movement.quantity_after;
                self.reserved = e.movement.reserved_after;
                self.movements.push(e.movement.clone());
            }
            InventoryEvent::Relocated(e) => {
                self.location = e.to.clone();
            }
        }

        self.last_updated = Some(event.occurred_at());
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::CreateRecord(cmd) => self.handle_create(cmd),
            InventoryCommand::AdjustStock(cmd) => self.handle_adjust(cmd),
            InventoryCommand::ReserveStock(cmd) => self.handle_reserve(cmd),
            InventoryCommand::ReleaseStock(cmd) => self.handle_release(cmd),
            InventoryCommand::RecordSale(cmd) => self.handle_sale(cmd),
            InventoryCommand::RecordReturn(cmd) => self.handle_return(cmd),
            InventoryCommand::Relocate(cmd) => self.handle_relocate(cmd),
        }
    }
}

impl IntegrationSource for InventoryRecord {
    fn integration_event(&self, event: &InventoryEvent) -> Option<IntegrationEvent> {
        match event {
            InventoryEvent::StockMoved(e) => {
                let m = &e.movement;
                Some(IntegrationEvent::ProductStockUpdated(ProductStockUpdated {
                    product_id: m.product_id,
                    movement: m.movement_type.as_str().to_string(),
                    quantity_delta: m.quantity_delta,
                    quantity: m.quantity_after,
                    reserved: m.reserved_after,
                    available: m.available_after(),
                    order_id: m.order_id,
                    occurred_at: m.occurred_at,
                }))
            }
            _ => None,
        }
    }
}

/// Everything a movement needs besides the counters it is computed from.
struct MovementDraft {
    movement_type: MovementType,
    quantity_delta: i64,
    reserved_delta: i64,
    units: i64,
    reason: String,
    note: Option<String>,
    actor: Option<UserId>,
    order_id: Option<AggregateId>,
    occurred_at: DateTime<Utc>,
}

impl InventoryRecord {
    fn ensure_product_id(&self, product_id: ProductId) -> Result<(), DomainError> {
        if self.id != product_id {
            return Err(DomainError::invariant("product_id mismatch"));
        }
        Ok(())
    }

    fn ensure_existing(&self, product_id: ProductId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_product_id(product_id)
    }

    fn positive(quantity: u32) -> Result<i64, DomainError> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        Ok(i64::from(quantity))
    }

    /// Build the movement against current counters, rejecting any negative result.
    fn movement(&self, draft: MovementDraft) -> Result<InventoryEvent, DomainError> {
        let quantity_after = self
            .quantity
            .checked_add(draft.quantity_delta)
            .ok_or_else(|| DomainError::validation("quantity overflow"))?;
        let reserved_after = self
            .reserved
            .checked_add(draft.reserved_delta)
            .ok_or_else(|| DomainError::validation("reserved overflow"))?;

        if quantity_after < 0 {
            return Err(DomainError::insufficient(format!(
                "stock for {} would drop to {quantity_after}",
                self.id
            )));
        }
        if reserved_after < 0 || reserved_after > quantity_after {
            return Err(DomainError::insufficient(format!(
                "reserved {reserved_after} out of range for total {quantity_after}"
            )));
        }

        Ok(InventoryEvent::StockMoved(StockMoved {
            movement: StockMovement {
                product_id: self.id,
                movement_type: draft.movement_type,
                quantity_delta: draft.quantity_delta,
                units: draft.units,
                quantity_before: self.quantity,
                quantity_after,
                reserved_after,
                reason: draft.reason,
                note: draft.note,
                actor: draft.actor,
                order_id: draft.order_id,
                occurred_at: draft.occurred_at,
            },
        }))
    }

    fn handle_create(&self, cmd: &CreateRecord) -> Result<Vec<InventoryEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists("inventory record"));
        }
        require_non_blank(&cmd.location, "location")?;
        if cmd.initial_quantity < 0 {
            return Err(DomainError::validation("initial quantity cannot be negative"));
        }

        let mut events = vec![InventoryEvent::RecordCreated(RecordCreated {
            product_id: cmd.product_id,
            location: cmd.location.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })];

        if cmd.initial_quantity > 0 {
            let fresh = InventoryRecord::empty(cmd.product_id);
            events.push(fresh.movement(MovementDraft {
                movement_type: MovementType::Adjustment,
                quantity_delta: cmd.initial_quantity,
                reserved_delta: 0,
                units: cmd.initial_quantity,
                reason: "initial stock".to_string(),
                note: None,
                actor: cmd.actor,
                order_id: None,
                occurred_at: cmd.occurred_at,
            })?);
        }

        Ok(events)
    }

    fn handle_adjust(&self, cmd: &AdjustStock) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_existing(cmd.product_id)?;
        require_non_blank(&cmd.reason, "adjustment reason")?;
        if cmd.delta == 0 {
            return Err(DomainError::validation("adjustment delta cannot be zero"));
        }
        // i64::MIN has no positive counterpart and no stock level can absorb it.
        let units = cmd.delta.checked_abs().ok_or_else(|| {
            DomainError::insufficient(format!("adjustment of {} exceeds any stock", cmd.delta))
        })?;

        Ok(vec![self.movement(MovementDraft {
            movement_type: MovementType::Adjustment,
            quantity_delta: cmd.delta,
            reserved_delta: 0,
            units,
            reason: cmd.reason.clone(),
            note: cmd.note.clone(),
            actor: cmd.actor,
            order_id: None,
            occurred_at: cmd.occurred_at,
        })?])
    }

    fn handle_reserve(&self, cmd: &ReserveStock) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_existing(cmd.product_id)?;
        let q = Self::positive(cmd.quantity)?;
        if q > self.available() {
            return Err(DomainError::insufficient(format!(
                "cannot reserve {q}, only {} available",
                self.available()
            )));
        }

        Ok(vec![self.movement(MovementDraft {
            movement_type: MovementType::Reservation,
            quantity_delta: 0,
            reserved_delta: q,
            units: q,
            reason: "stock reserved".to_string(),
            note: None,
            actor: None,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })?])
    }

    fn handle_release(&self, cmd: &ReleaseStock) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_existing(cmd.product_id)?;
        let q = Self::positive(cmd.quantity)?;
        if q > self.reserved {
            return Err(DomainError::insufficient(format!(
                "cannot release {q}, only {} reserved",
                self.reserved
            )));
        }

        Ok(vec![self.movement(MovementDraft {
            movement_type: MovementType::Release,
            quantity_delta: 0,
            reserved_delta: -q,
            units: q,
            reason: "reservation released".to_string(),
            note: None,
            actor: None,
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })?])
    }

    fn handle_sale(&self, cmd: &RecordSale) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_existing(cmd.product_id)?;
        let q = Self::positive(cmd.quantity)?;
        if q > self.reserved {
            return Err(DomainError::insufficient(format!(
                "cannot sell {q}, only {} reserved",
                self.reserved
            )));
        }

        Ok(vec![self.movement(MovementDraft {
            movement_type: MovementType::Sale,
            quantity_delta: -q,
            reserved_delta: -q,
            units: q,
            reason: "sale".to_string(),
            note: None,
            actor: None,
            order_id: Some(cmd.order_id),
            occurred_at: cmd.occurred_at,
        })?])
    }

    fn handle_return(&self, cmd: &RecordReturn) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_existing(cmd.product_id)?;
        let q = Self::positive(cmd.quantity)?;

        Ok(vec![self.movement(MovementDraft {
            movement_type: MovementType::Return,
            quantity_delta: q,
            reserved_delta: 0,
            units: q,
            reason: "customer return".to_string(),
            note: None,
            actor: None,
            order_id: Some(cmd.order_id),
            occurred_at: cmd.occurred_at,
        })?])
    }

    fn handle_relocate(&self, cmd: &Relocate) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_existing(cmd.product_id)?;
        require_non_blank(&cmd.location, "location")?;
        let to = cmd.location.trim();
        if to == self.location {
            return Ok(Vec::new());
        }

        Ok(vec![InventoryEvent::Relocated(Relocated {
            product_id: cmd.product_id,
            from: self.location.clone(),
            to: to.to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
