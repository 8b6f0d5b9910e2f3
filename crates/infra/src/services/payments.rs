use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use tracing::{info, warn};

use retail_core::{Aggregate, AggregateId, Money};
use retail_events::{EventBus, EventEnvelope, IntegrationEvent};
use retail_orders::{AttachPayment, OrderCommand, OrderId};
use retail_payments::{
    CancelPayment, CompletePayment, CompleteRefund, CreatePayment, CreateRefund, ExpirePayment,
    FailPayment, FailRefund, Payment, PaymentCommand, PaymentId, PaymentMethod, RefundId,
    RefundType, StartProcessing,
};

use super::{CommerceService, PAYMENT_AGGREGATE, empty_payment};
use crate::command_dispatcher::DispatchError;
use crate::event_store::EventStore;

impl<S, D, I> CommerceService<S, D, I>
where
    S: EventStore,
    D: EventBus<EventEnvelope<JsonValue>>,
    I: EventBus<EventEnvelope<IntegrationEvent>>,
{
    /// Run an already-built payment command.
    pub fn execute_payment(&self, command: PaymentCommand) -> Result<Payment, DispatchError> {
        let payment_id = command.payment_id();
        self.dispatcher
            .dispatch(payment_id.0, PAYMENT_AGGREGATE, command, empty_payment)
            .map(|out| out.aggregate)
    }

    pub fn get_payment(&self, payment_id: PaymentId) -> Result<Payment, DispatchError> {
        self.dispatcher.load(payment_id.0, empty_payment)
    }

    /// Open a pending payment for the order's current total.
    ///
    /// Both decisions are taken against current state before anything is
    /// written: a rejected payment (zero total, second payment, cancelled
    /// order) leaves the order without a payment reference. The order is then
    /// linked first, so a cancelled order never gets a payment stream.
    pub fn create_payment(
        &self,
        order_id: OrderId,
        method: PaymentMethod,
    ) -> Result<Payment, DispatchError> {
        method.validate()?;
        let order = self.get_order(order_id)?;
        let user_id = order.user_id().ok_or(DispatchError::NotFound)?;

        let now = self.clock.now();
        let expires_at = now.checked_add_signed(self.config.payment_expiry).ok_or_else(|| {
            DispatchError::Validation("payment expiry window is out of range".to_string())
        })?;
        let payment_id = PaymentId::new(AggregateId::new());
        let attach = OrderCommand::AttachPayment(AttachPayment {
            order_id,
            payment_id: payment_id.0,
            occurred_at: now,
        });
        let create = PaymentCommand::CreatePayment(CreatePayment {
            payment_id,
            payment_number: self.next_number(&self.config.payment_number_prefix),
            order_id: order_id.0,
            user_id,
            amount: order.total(),
            method,
            expires_at: Some(expires_at),
            occurred_at: now,
        });

        order.handle(&attach)?;
        Payment::empty(payment_id).handle(&create)?;

        self.execute_order(attach)?;
        let payment = self.execute_payment(create)?;

        info!(
            payment_id = %payment_id,
            order_id = %order_id,
            amount = %order.total(),
            "payment created"
        );
        Ok(payment)
    }

    /// Expire the payment if it is still pending past its deadline; otherwise a no-op.
    pub fn expire_if_due(&self, payment_id: PaymentId) -> Result<Payment, DispatchError> {
        let out = self.dispatcher.dispatch(
            payment_id.0,
            PAYMENT_AGGREGATE,
            PaymentCommand::ExpirePayment(ExpirePayment {
                payment_id,
                now: self.clock.now(),
            }),
            empty_payment,
        )?;
        if !out.committed.is_empty() {
            info!(payment_id = %payment_id, "payment expired");
        }
        Ok(out.aggregate)
    }

    /// Expiry is checked first, so a payment past its deadline fails with an
    /// invalid transition out of `expired`.
    pub fn start_processing(
        &self,
        payment_id: PaymentId,
        gateway_payment_id: Option<String>,
    ) -> Result<Payment, DispatchError> {
        self.expire_if_due(payment_id)?;
        self.execute_payment(PaymentCommand::StartProcessing(StartProcessing {
            payment_id,
            gateway_payment_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn complete_payment(
        &self,
        payment_id: PaymentId,
        gateway_transaction_id: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Payment, DispatchError> {
        self.expire_if_due(payment_id)?;
        let payment = self.execute_payment(PaymentCommand::CompletePayment(CompletePayment {
            payment_id,
            gateway_transaction_id: gateway_transaction_id.into(),
            metadata,
            occurred_at: self.clock.now(),
        }))?;
        info!(payment_id = %payment_id, "payment completed");
        Ok(payment)
    }

    pub fn fail_payment(
        &self,
        payment_id: PaymentId,
        reason: impl Into<String>,
        error_code: Option<String>,
    ) -> Result<Payment, DispatchError> {
        let reason = reason.into();
        let payment = self.execute_payment(PaymentCommand::FailPayment(FailPayment {
            payment_id,
            reason: reason.clone(),
            error_code: error_code.clone(),
            occurred_at: self.clock.now(),
        }))?;
        warn!(
            payment_id = %payment_id,
            reason = %reason,
            error_code = ?error_code,
            "payment failed"
        );
        Ok(payment)
    }

    pub fn cancel_payment(
        &self,
        payment_id: PaymentId,
        reason: impl Into<String>,
    ) -> Result<Payment, DispatchError> {
        self.execute_payment(PaymentCommand::CancelPayment(CancelPayment {
            payment_id,
            reason: reason.into(),
            occurred_at: self.clock.now(),
        }))
    }

    /// Request a refund. `None` refunds everything still refundable.
    pub fn create_refund(
        &self,
        payment_id: PaymentId,
        amount: Option<Money>,
        reason: impl Into<String>,
    ) -> Result<(Payment, RefundId), DispatchError> {
        let (amount, refund_type) = match amount {
            Some(amount) => (amount, RefundType::Partial),
            None => (self.get_payment(payment_id)?.refundable_amount()?, RefundType::Full),
        };

        let refund_id = RefundId::new();
        let payment = self.execute_payment(PaymentCommand::CreateRefund(CreateRefund {
            payment_id,
            refund_id,
            amount,
            reason: reason.into(),
            refund_type,
            occurred_at: self.clock.now(),
        }))?;
        info!(
            payment_id = %payment_id,
            refund_id = %refund_id.0,
            amount = %amount,
            "refund requested"
        );
        Ok((payment, refund_id))
    }

    pub fn complete_refund(
        &self,
        payment_id: PaymentId,
        refund_id: RefundId,
        gateway_refund_id: Option<String>,
    ) -> Result<Payment, DispatchError> {
        self.execute_payment(PaymentCommand::CompleteRefund(CompleteRefund {
            payment_id,
            refund_id,
            gateway_refund_id,
            occurred_at: self.clock.now(),
        }))
    }

    pub fn fail_refund(
        &self,
        payment_id: PaymentId,
        refund_id: RefundId,
        reason: impl Into<String>,
    ) -> Result<Payment, DispatchError> {
        self.execute_payment(PaymentCommand::FailRefund(FailRefund {
            payment_id,
            refund_id,
            reason: reason.into(),
            occurred_at: self.clock.now(),
        }))
    }
}
