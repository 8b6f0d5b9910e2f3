use serde_json::Value as JsonValue;
use tracing::{info, warn};

use retail_core::{AggregateId, ProductId, UserId};
use retail_events::{EventBus, EventEnvelope, IntegrationEvent};
use retail_inventory::{
    AdjustStock, CreateRecord, InventoryCommand, InventoryRecord, RecordReturn, RecordSale,
    Relocate, ReleaseStock, ReserveStock,
};

use super::{CommerceService, INVENTORY_AGGREGATE, empty_record};
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;

impl<S, D, I> CommerceService<S, D, I>
where
    S: EventStore,
    D: EventBus<EventEnvelope<JsonValue>>,
    I: EventBus<EventEnvelope<IntegrationEvent>>,
{
    /// Run an already-built inventory command.
    pub fn execute_inventory(
        &self,
        command: InventoryCommand,
    ) -> Result<InventoryRecord, DispatchError> {
        let product_id = command.product_id();
        let record = self
            .dispatcher
            .dispatch(product_id.as_aggregate_id(), INVENTORY_AGGREGATE, command, empty_record)?
            .aggregate;

        if record.is_low_stock(self.config.low_stock_threshold) {
            warn!(
                product_id = %product_id,
                available = record.available(),
                threshold = self.config.low_stock_threshold,
                "stock at or below threshold"
            );
        }
        Ok(record)
    }

    pub fn get_record(&self, product_id: ProductId) -> Result<InventoryRecord, DispatchError> {
        self.dispatcher.load(product_id.as_aggregate_id(), empty_record)
    }

    pub fn create_record(
        &self,
        product_id: ProductId,
        location: impl Into<String>,
        initial_quantity: i64,
        actor: Option<UserId>,
    ) -> Result<InventoryRecord, DispatchError> {
        let record = self.execute_inventory(InventoryCommand::CreateRecord(CreateRecord {
            product_id,
            location: location.into(),
            initial_quantity,
            actor,
            occurred_at: self.clock.now(),
        }))?;
        info!(product_id = %product_id, quantity = record.quantity(), "inventory record created");
        Ok(record)
    }

    pub fn adjust_stock(
        &self,
        product_id: ProductId,
        delta: i64,
        reason: impl Into<String>,
        note: Option<String>,
        actor: Option<UserId>,
    ) -> Result<InventoryRecord, DispatchError> {
        self.execute_inventory(InventoryCommand::AdjustStock(AdjustStock {
            product_id,
            delta,
            reason: reason.into(),
            note,
            actor,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn reserve_stock(
        &self,
        product_id: ProductId,
        quantity: u32,
        order_id: Option<AggregateId>,
    ) -> Result<InventoryRecord, DispatchError> {
        self.execute_inventory(InventoryCommand::ReserveStock(ReserveStock {
            product_id,
            quantity,
            order_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn release_stock(
        &self,
        product_id: ProductId,
        quantity: u32,
        order_id: Option<AggregateId>,
    ) -> Result<InventoryRecord, DispatchError> {
        self.execute_inventory(InventoryCommand::ReleaseStock(ReleaseStock {
            product_id,
            quantity,
            order_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn record_sale(
        &self,
        product_id: ProductId,
        quantity: u32,
        order_id: AggregateId,
    ) -> Result<InventoryRecord, DispatchError> {
        self.execute_inventory(InventoryCommand::RecordSale(RecordSale {
            product_id,
            quantity,
            order_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn record_return(
        &self,
        product_id: ProductId,
        quantity: u32,
        order_id: AggregateId,
    ) -> Result<InventoryRecord, DispatchError> {
        self.execute_inventory(InventoryCommand::RecordReturn(RecordReturn {
            product_id,
            quantity,
            order_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn relocate(
        &self,
        product_id: ProductId,
        location: impl Into<String>,
    ) -> Result<InventoryRecord, DispatchError> {
        self.execute_inventory(InventoryCommand::Relocate(Relocate {
            product_id,
            location: location.into(),
            occurred_at: self.clock.now(),
        }))
    }
}
