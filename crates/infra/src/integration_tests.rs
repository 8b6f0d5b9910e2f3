//! Integration tests for the full event-sourced pipeline.
//!
//! Tests: Service → Dispatcher → EventStore → EventBus → Saga / Projection
//!
//! Verifies:
//! - The order/payment/inventory process completes or compensates through the saga
//! - Refund bounds and stock invariants hold across dispatches
//! - The ledger read model matches the aggregates and can be rebuilt
//! - Optimistic concurrency conflicts are detected and retried; duplicates are not
//! - Rejected operations leave every aggregate untouched

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{DateTime, Duration, Utc};
    use serde_json::Value as JsonValue;
    use uuid::Uuid;

    use retail_core::{
        Address, AggregateId, AggregateRoot, Currency, ExpectedVersion, FixedClock,
        InMemorySequence, Money, ProductId, UserId,
    };
    use retail_events::{
        EventBus, EventEnvelope, InMemoryEventBus, IntegrationEvent, Subscription,
    };
    use retail_inventory::MovementType;
    use retail_orders::{NewLineItem, OrderId, OrderStatus};
    use retail_payments::{
        CreatePayment, Payment, PaymentCommand, PaymentId, PaymentMethod, PaymentStatus,
        RefundStatus,
    };

    use crate::command_dispatcher::{CommandDispatcher, DispatchError};
    use crate::config::CommerceConfig;
    use crate::event_store::{EventStore, EventStoreError, InMemoryEventStore, UncommittedEvent};
    use crate::projections::{InventoryLedgerProjection, MovementFilter, StockLevel};
    use crate::read_model::{InMemoryReadStore, Pagination};
    use crate::saga::{
        CommandExecutor, OrderFulfillmentSaga, SagaError, SagaOutcome, SagaRunner,
    };
    use crate::services::{CommerceService, ORDER_AGGREGATE};

    type DomainBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type IntegrationBus = Arc<InMemoryEventBus<EventEnvelope<IntegrationEvent>>>;
    type Service = CommerceService<Arc<InMemoryEventStore>, DomainBus, IntegrationBus>;
    type Runner = SagaRunner<OrderFulfillmentSaga, Arc<InMemoryEventStore>, Service>;
    type Ledger = InventoryLedgerProjection<Arc<InMemoryReadStore<ProductId, StockLevel>>>;

    struct Harness {
        store: Arc<InMemoryEventStore>,
        clock: Arc<FixedClock>,
        service: Service,
        saga: Runner,
        ledger: Ledger,
        saga_inbox: Subscription<EventEnvelope<IntegrationEvent>>,
        audit_inbox: Subscription<EventEnvelope<IntegrationEvent>>,
        ledger_inbox: Subscription<EventEnvelope<JsonValue>>,
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn setup() -> Harness {
        setup_with(CommerceConfig::default())
    }

    fn setup_with(config: CommerceConfig) -> Harness {
        retail_observability::init_with_filter(&config.log_filter);
        let store = Arc::new(InMemoryEventStore::new());
        let domain: DomainBus = Arc::new(InMemoryEventBus::new());
        let integration: IntegrationBus = Arc::new(InMemoryEventBus::new());
        // Subscribe before anything is published.
        let saga_inbox = integration.subscribe();
        let audit_inbox = integration.subscribe();
        let ledger_inbox = domain.subscribe();

        let clock = Arc::new(FixedClock::new(t0()));
        let dispatcher = CommandDispatcher::new(store.clone(), domain, integration);
        let service = CommerceService::new(
            Arc::new(dispatcher),
            config,
            Arc::new(InMemorySequence::new()),
            clock.clone(),
        );
        let saga = SagaRunner::new(store.clone(), service.clone());
        let ledger = InventoryLedgerProjection::new(Arc::new(InMemoryReadStore::new()));

        Harness {
            store,
            clock,
            service,
            saga,
            ledger,
            saga_inbox,
            audit_inbox,
            ledger_inbox,
        }
    }

    impl Harness {
        /// Outcomes of everything queued for the saga; any saga failure fails the test.
        fn run_saga(&self) -> Vec<SagaOutcome> {
            self.saga
                .drain(&self.saga_inbox)
                .into_iter()
                .collect::<Result<_, _>>()
                .unwrap()
        }

        fn project(&self) {
            for env in self.ledger_inbox.drain() {
                self.ledger.apply_envelope(&env).unwrap();
            }
        }

        fn stock(&self, qty: i64) -> ProductId {
            let product = ProductId::new();
            self.service.create_record(product, "A-01", qty, None).unwrap();
            product
        }

        fn place(&self, lines: &[(ProductId, i64, u32)]) -> OrderId {
            let items = lines
                .iter()
                .enumerate()
                .map(|(i, (product_id, cents, quantity))| NewLineItem {
                    product_id: *product_id,
                    name: format!("Item {i}"),
                    sku: format!("SKU-{i}"),
                    unit_price: usd(*cents),
                    quantity: *quantity,
                    weight_grams: None,
                })
                .collect();
            self.service
                .place_order(UserId::new(), items, address(), None)
                .unwrap()
                .id_typed()
        }

        fn pay(&self, order_id: OrderId) -> PaymentId {
            let payment_id = self.open_payment(order_id).unwrap().id_typed();
            self.service.start_processing(payment_id, Some("gw-1".to_string())).unwrap();
            self.service.complete_payment(payment_id, "txn-1", BTreeMap::new()).unwrap();
            payment_id
        }

        fn open_payment(&self, order_id: OrderId) -> Result<Payment, DispatchError> {
            self.service.create_payment(order_id, PaymentMethod::card("visa", "4242"))
        }
    }

    fn usd(cents: i64) -> Money {
        Money::new(cents, Currency::USD)
    }

    fn address() -> Address {
        Address {
            recipient: "Dana Smith".to_string(),
            line1: "1 Market St".to_string(),
            line2: None,
            city: "Springfield".to_string(),
            region: None,
            postal_code: "12345".to_string(),
            country: "US".to_string(),
            phone: None,
        }
    }

    #[test]
    fn paid_order_is_confirmed_and_stock_reserved() {
        let h = setup();
        let widget = h.stock(10);
        let gadget = h.stock(5);
        let order_id = h.place(&[(widget, 1000, 2), (gadget, 500, 1)]);

        let order = h.service.get_order(order_id).unwrap();
        assert_eq!(order.pricing().subtotal, usd(2500));
        assert_eq!(order.pricing().tax, usd(200));
        assert_eq!(order.total(), usd(2700));

        let payment_id = h.pay(order_id);
        let outcomes = h.run_saga();
        assert!(outcomes.contains(&SagaOutcome::Completed));

        let order = h.service.get_order(order_id).unwrap();
        assert_eq!(order.status(), OrderStatus::Confirmed);
        assert_eq!(order.payment_id(), Some(payment_id.0));
        assert_eq!(h.service.get_payment(payment_id).unwrap().amount(), Some(usd(2700)));

        let widget_stock = h.service.get_record(widget).unwrap();
        assert_eq!((widget_stock.quantity(), widget_stock.reserved()), (10, 2));
        assert_eq!(h.service.get_record(gadget).unwrap().available(), 4);

        // Redelivery of everything the saga already saw changes nothing.
        for envelope in h.audit_inbox.drain() {
            assert_eq!(h.saga.process(&envelope).unwrap(), SagaOutcome::Ignored);
        }
        assert_eq!(h.service.get_record(widget).unwrap().reserved(), 2);

        h.project();
        let reservations = h.ledger.movements(
            &MovementFilter {
                movement_type: Some(MovementType::Reservation),
                order_id: Some(order_id.0),
                ..MovementFilter::default()
            },
            Pagination::default(),
        );
        assert_eq!(reservations.total, 2);
        assert_eq!(h.ledger.get(widget).unwrap().available, 8);
    }

    #[test]
    fn failed_payment_cancels_the_order() {
        let h = setup();
        let widget = h.stock(10);
        let order_id = h.place(&[(widget, 1000, 1)]);

        let payment = h.open_payment(order_id).unwrap();
        h.service
            .fail_payment(payment.id_typed(), "card declined", Some("declined".to_string()))
            .unwrap();

        assert_eq!(h.run_saga(), vec![SagaOutcome::Advanced, SagaOutcome::Completed]);
        let order = h.service.get_order(order_id).unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(h.service.get_record(widget).unwrap().reserved(), 0);
    }

    #[test]
    fn failed_reservation_releases_cancels_and_refunds() {
        let h = setup();
        let plenty = h.stock(10);
        let scarce = h.stock(1);
        let order_id = h.place(&[(plenty, 1000, 2), (scarce, 500, 3)]);

        let payment_id = h.pay(order_id);
        let outcomes = h.run_saga();
        assert!(outcomes.iter().any(|o| matches!(o, SagaOutcome::Compensated { .. })));

        assert_eq!(h.service.get_order(order_id).unwrap().status(), OrderStatus::Cancelled);
        assert_eq!(h.service.get_record(plenty).unwrap().reserved(), 0);
        assert_eq!(h.service.get_record(scarce).unwrap().reserved(), 0);

        let payment = h.service.get_payment(payment_id).unwrap();
        assert_eq!(payment.refunds().len(), 1);
        assert_eq!(payment.refunds()[0].status, RefundStatus::Pending);
        assert_eq!(payment.refunds()[0].amount, usd(3780));
        assert!(payment.refundable_amount().unwrap().is_zero());

        h.project();
        let plenty_moves =
            h.ledger.movements(&MovementFilter::for_product(plenty), Pagination::default());
        let kinds: Vec<_> = plenty_moves.items.iter().map(|e| e.movement.movement_type).collect();
        assert_eq!(
            kinds,
            vec![MovementType::Release, MovementType::Reservation, MovementType::Adjustment]
        );
    }

    #[test]
    fn overdue_payment_expires_and_cancels_the_order() {
        let h = setup();
        let widget = h.stock(10);
        let order_id = h.place(&[(widget, 1000, 1)]);
        let payment_id = h.open_payment(order_id).unwrap().id_typed();

        h.clock.advance(Duration::minutes(31));
        let err = h.service.start_processing(payment_id, None).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidStateTransition { .. }));
        assert_eq!(h.service.get_payment(payment_id).unwrap().status(), PaymentStatus::Expired);

        h.run_saga();
        assert_eq!(h.service.get_order(order_id).unwrap().status(), OrderStatus::Cancelled);
    }

    #[test]
    fn payment_within_window_is_not_expired() {
        let h = setup();
        let widget = h.stock(10);
        let order_id = h.place(&[(widget, 1000, 1)]);
        let payment_id = h.open_payment(order_id).unwrap().id_typed();

        h.clock.advance(Duration::minutes(29));
        let payment = h.service.expire_if_due(payment_id).unwrap();
        assert_eq!(payment.status(), PaymentStatus::Pending);
    }

    #[test]
    fn refunds_never_exceed_the_captured_amount() {
        let h = setup();
        let payment_id = PaymentId::new(AggregateId::new());
        h.service
            .execute_payment(PaymentCommand::CreatePayment(CreatePayment {
                payment_id,
                payment_number: retail_core::DocumentNumber::new("PAY", 1),
                order_id: AggregateId::new(),
                user_id: UserId::new(),
                amount: usd(10_000),
                method: PaymentMethod::card("visa", "4242"),
                expires_at: None,
                occurred_at: t0(),
            }))
            .unwrap();
        h.service.start_processing(payment_id, None).unwrap();
        h.service.complete_payment(payment_id, "txn-9", BTreeMap::new()).unwrap();

        let (_, first) = h.service.create_refund(payment_id, Some(usd(6_000)), "damaged").unwrap();
        h.service.complete_refund(payment_id, first, Some("rf-1".to_string())).unwrap();

        let err = h.service.create_refund(payment_id, Some(usd(5_000)), "again").unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientFundsOrStock(_)));
        assert_eq!(h.service.get_payment(payment_id).unwrap().refunds().len(), 1);

        let (_, second) = h.service.create_refund(payment_id, Some(usd(4_000)), "rest").unwrap();
        let payment = h.service.complete_refund(payment_id, second, None).unwrap();
        assert_eq!(payment.refunded_amount().unwrap(), usd(10_000));
        assert_eq!(payment.status(), PaymentStatus::Refunded);

        // Unknown order: the saga has nothing to correlate with.
        assert!(h.run_saga().is_empty());
    }

    #[test]
    fn stock_never_goes_negative() {
        let h = setup();
        let product = h.stock(10);
        let order = AggregateId::new();

        h.service.reserve_stock(product, 4, Some(order)).unwrap();
        let record = h.service.record_sale(product, 4, order).unwrap();
        assert_eq!((record.quantity(), record.reserved(), record.available()), (6, 0, 6));

        let err = h.service.adjust_stock(product, -10, "shrinkage", None, None).unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientFundsOrStock(_)));
        assert_eq!(h.service.get_record(product).unwrap().quantity(), 6);

        h.project();
        let level = h.ledger.get(product).unwrap();
        assert_eq!((level.quantity, level.reserved), (6, 0));
        let moves =
            h.ledger.movements(&MovementFilter::for_product(product), Pagination::default());
        let replayed: i64 = moves.items.iter().map(|e| e.movement.quantity_delta).sum();
        assert_eq!(replayed, 6);
        let low = h.ledger.low_stock(h.service.config().low_stock_threshold);
        assert!(low.iter().any(|l| l.product_id == product));
    }

    #[test]
    fn ledger_rebuild_matches_live_projection() {
        let h = setup();
        let a = h.stock(10);
        let b = h.stock(0);
        h.service.adjust_stock(a, -3, "count", Some("cycle count".to_string()), None).unwrap();
        h.service.relocate(b, "Z-99").unwrap();
        h.project();

        let live_a = h.ledger.get(a).unwrap();
        let live_b = h.ledger.get(b).unwrap();
        assert_eq!(h.ledger.out_of_stock().len(), 1);

        let envelopes: Vec<_> = h
            .store
            .load_aggregate_type("inventory.record")
            .unwrap()
            .iter()
            .map(|e| e.to_envelope())
            .collect();
        h.ledger.rebuild_from_scratch(envelopes).unwrap();

        assert_eq!(h.ledger.get(a).unwrap(), live_a);
        assert_eq!(h.ledger.get(b).unwrap(), live_b);
        assert_eq!(live_b.location, "Z-99");
    }

    #[test]
    fn stale_append_is_a_retryable_conflict() {
        let h = setup();
        let order_id = h.place(&[(ProductId::new(), 1000, 1)]);
        let stream = h.store.load_stream(order_id.0).unwrap();
        let last = stream.last().unwrap();

        let stale = UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id: order_id.0,
            aggregate_type: ORDER_AGGREGATE.to_string(),
            event_type: last.event_type.clone(),
            event_version: last.event_version,
            occurred_at: last.occurred_at,
            payload: last.payload.clone(),
        };
        let err = h.store.append(vec![stale], ExpectedVersion::Exact(0)).unwrap_err();
        assert!(matches!(err, EventStoreError::Concurrency(_)));

        let err = DispatchError::from(err);
        assert!(err.is_retryable());
        assert_eq!(h.store.load_stream(order_id.0).unwrap().len(), stream.len());
    }

    #[test]
    fn customer_cancellation_before_payment_ends_the_saga() {
        let h = setup();
        let order_id = h.place(&[(ProductId::new(), 1000, 1)]);
        h.service.cancel_order(order_id, "changed my mind").unwrap();

        assert_eq!(h.run_saga(), vec![SagaOutcome::Advanced, SagaOutcome::Completed]);
        assert!(h.open_payment(order_id).is_err());
        assert_eq!(h.service.get_order(order_id).unwrap().payment_id(), None);
    }

    #[test]
    fn order_lifecycle_with_repricing() {
        let h = setup();
        let order_id = h.place(&[(ProductId::new(), 1000, 2), (ProductId::new(), 500, 1)]);

        let err = h.service.ship_order(order_id, None).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidStateTransition { .. }));

        h.service.set_shipping_method(order_id, "ground", usd(500)).unwrap();
        h.service.apply_coupon(order_id, "SAVE3", usd(300)).unwrap();
        let first_line = h.service.get_order(order_id).unwrap().items()[0].line_no;
        let order = h.service.update_item_quantity(order_id, first_line, 3).unwrap();
        assert_eq!(order.pricing().subtotal, usd(3500));
        assert_eq!(order.pricing().tax, usd(280));
        assert_eq!(order.total(), usd(3980));

        h.service.confirm_order(order_id, None).unwrap();
        h.service.process_order(order_id).unwrap();
        let shipped = h.service.ship_order(order_id, Some("1Z999".to_string())).unwrap();
        assert_eq!(shipped.tracking_number(), Some("1Z999"));
        assert!(h.service.remove_item(order_id, first_line).is_err());

        h.service.deliver_order(order_id).unwrap();
        let order = h.service.refund_order(order_id, "returned").unwrap();
        assert_eq!(order.status(), OrderStatus::Refunded);

        let statuses: Vec<_> = order.history().iter().map(|e| e.status).collect();
        assert_eq!(statuses.last(), Some(&OrderStatus::Refunded));
        assert_eq!(statuses.len(), 6);
    }

    #[test]
    fn rejected_payment_leaves_the_order_unlinked() {
        let h = setup();
        let order_id = h.place(&[(ProductId::new(), 0, 1)]);
        let before = h.service.get_order(order_id).unwrap();
        assert!(before.total().is_zero());

        let err = h.open_payment(order_id).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        let after = h.service.get_order(order_id).unwrap();
        assert_eq!(after.payment_id(), None);
        assert_eq!(after.version(), before.version());
    }

    #[test]
    fn an_order_takes_only_one_payment() {
        let h = setup();
        let order_id = h.place(&[(ProductId::new(), 1000, 1)]);
        let first = h.open_payment(order_id).unwrap().id_typed();

        let err = h.open_payment(order_id).unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyExists(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.service.get_order(order_id).unwrap().payment_id(), Some(first.0));
        let payment_events = h.store.load_aggregate_type("payments.payment").unwrap();
        assert!(payment_events.iter().all(|e| e.aggregate_id == first.0));
    }

    #[test]
    fn expiry_past_the_calendar_is_rejected_before_any_write() {
        let h = setup_with(CommerceConfig {
            payment_expiry: Duration::minutes(200_000_000_000),
            ..CommerceConfig::default()
        });
        let order_id = h.place(&[(ProductId::new(), 1000, 1)]);

        let err = h.open_payment(order_id).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert_eq!(h.service.get_order(order_id).unwrap().payment_id(), None);
        assert!(h.store.load_aggregate_type("payments.payment").unwrap().is_empty());
    }

    #[test]
    fn coupon_beyond_the_gross_is_rejected() {
        let h = setup();
        let order_id = h.place(&[(ProductId::new(), 1000, 1)]);

        let err = h.service.apply_coupon(order_id, "BIG", usd(5000)).unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        let order = h.service.get_order(order_id).unwrap();
        assert_eq!(order.total(), usd(1080));
        assert_eq!(order.coupon_code(), None);
    }

    #[test]
    fn duplicate_record_is_not_retryable() {
        let h = setup();
        let product = h.stock(3);

        let err = h.service.create_record(product, "B-02", 7, None).unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyExists(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.service.get_record(product).unwrap().quantity(), 3);
    }

    #[test]
    fn extreme_adjustment_is_rejected() {
        let h = setup();
        let product = h.stock(10);

        let err = h.service.adjust_stock(product, i64::MIN, "purge", None, None).unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientFundsOrStock(_)));
        assert_eq!(h.service.get_record(product).unwrap().quantity(), 10);
    }

    #[test]
    fn failed_compensation_is_reported() {
        let h = setup();
        let plenty = h.stock(10);
        let scarce = h.stock(1);
        let order_id = h.place(&[(plenty, 1000, 2), (scarce, 500, 3)]);
        let payment_id = h.pay(order_id);
        // Nothing is left for the saga's compensating refund.
        h.service.create_refund(payment_id, None, "goodwill").unwrap();

        let results = h.saga.drain(&h.saga_inbox);

        assert!(results.iter().any(|r| matches!(
            r,
            Err(SagaError::Compensation { command_type, .. }) if command_type == "CreateRefund"
        )));
        assert_eq!(h.service.get_order(order_id).unwrap().status(), OrderStatus::Cancelled);
        assert_eq!(h.service.get_record(plenty).unwrap().reserved(), 0);
        assert_eq!(h.service.get_payment(payment_id).unwrap().refunds().len(), 1);
    }

    /// Reports the first `stale` confirmations as version conflicts.
    struct StaleConfirmations {
        inner: Service,
        stale: AtomicU32,
    }

    impl CommandExecutor for StaleConfirmations {
        type Error = DispatchError;

        fn execute(
            &self,
            aggregate_type: &str,
            command_type: &str,
            payload: &JsonValue,
        ) -> Result<(), DispatchError> {
            if command_type == "ConfirmOrder"
                && self
                    .stale
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(DispatchError::Concurrency("stale order version".to_string()));
            }
            self.inner.execute(aggregate_type, command_type, payload)
        }

        fn is_retryable(error: &DispatchError) -> bool {
            error.is_retryable()
        }
    }

    fn saga_with_stale_confirmations(
        h: &Harness,
        stale: u32,
    ) -> SagaRunner<OrderFulfillmentSaga, Arc<InMemoryEventStore>, StaleConfirmations> {
        let executor = StaleConfirmations {
            inner: h.service.clone(),
            stale: AtomicU32::new(stale),
        };
        SagaRunner::new(h.store.clone(), executor)
    }

    #[test]
    fn stale_confirmation_is_retried_instead_of_refunded() {
        let h = setup();
        let widget = h.stock(10);
        let order_id = h.place(&[(widget, 1000, 1)]);
        let payment_id = h.pay(order_id);
        let saga = saga_with_stale_confirmations(&h, 2);

        let results = saga.drain(&h.saga_inbox);

        assert!(results.iter().all(Result::is_ok));
        assert!(results.iter().any(|r| matches!(r, Ok(SagaOutcome::Completed))));
        assert_eq!(h.service.get_order(order_id).unwrap().status(), OrderStatus::Confirmed);
        assert!(h.service.get_payment(payment_id).unwrap().refunds().is_empty());
        assert_eq!(h.service.get_record(widget).unwrap().reserved(), 1);
    }

    #[test]
    fn persistent_conflict_compensates_after_the_last_attempt() {
        let h = setup();
        let widget = h.stock(10);
        let order_id = h.place(&[(widget, 1000, 1)]);
        let payment_id = h.pay(order_id);
        let saga = saga_with_stale_confirmations(&h, 3).with_max_command_attempts(3);

        let results = saga.drain(&h.saga_inbox);

        assert!(results.iter().any(|r| matches!(r, Ok(SagaOutcome::Compensated { .. }))));
        let payment = h.service.get_payment(payment_id).unwrap();
        assert_eq!(payment.refunds().len(), 1);
        assert_eq!(payment.refunds()[0].created_at, t0());
    }
}
