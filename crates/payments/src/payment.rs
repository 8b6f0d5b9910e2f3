use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use retail_core::{
    Aggregate, AggregateId, AggregateRoot, DocumentNumber, DomainError, Money, UserId,
    require_non_blank,
};
use retail_events::{Command, Event, IntegrationEvent, IntegrationSource, integration};

use crate::method::PaymentMethod;
use crate::refund::{Refund, RefundId, RefundStatus, RefundType};
use crate::status::{PaymentAttempt, PaymentStatus};

/// Error code published when a payment is cancelled rather than declined.
pub const CANCELLED_CODE: &str = "CANCELLED";
/// Error code published when a pending payment runs past its expiry.
pub const EXPIRED_CODE: &str = "EXPIRED";

/// Payment identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub AggregateId);

impl PaymentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PaymentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: Payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    id: PaymentId,
    payment_number: Option<DocumentNumber>,
    order_id: Option<AggregateId>,
    user_id: Option<UserId>,
    amount: Option<Money>,
    status: PaymentStatus,
    method: Option<PaymentMethod>,
    gateway_payment_id: Option<String>,
    gateway_transaction_id: Option<String>,
    metadata: BTreeMap<String, String>,
    attempts: Vec<PaymentAttempt>,
    refunds: Vec<Refund>,
    expires_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Payment {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: PaymentId) -> Self {
        Self {
            id,
            payment_number: None,
            order_id: None,
            user_id: None,
            amount: None,
            status: PaymentStatus::Pending,
            method: None,
            gateway_payment_id: None,
            gateway_transaction_id: None,
            metadata: BTreeMap::new(),
            attempts: Vec::new(),
            refunds: Vec::new(),
            expires_at: None,
            failure_reason: None,
            processed_at: None,
            created_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PaymentId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn payment_number(&self) -> Option<&DocumentNumber> {
        self.payment_number.as_ref()
    }

    pub fn order_id(&self) -> Option<AggregateId> {
        self.order_id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn amount(&self) -> Option<Money> {
        self.amount
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn method(&self) -> Option<&PaymentMethod> {
        self.method.as_ref()
    }

    pub fn gateway_payment_id(&self) -> Option<&str> {
        self.gateway_payment_id.as_deref()
    }

    pub fn gateway_transaction_id(&self) -> Option<&str> {
        self.gateway_transaction_id.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn attempts(&self) -> &[PaymentAttempt] {
        &self.attempts
    }

    pub fn refunds(&self) -> &[Refund] {
        &self.refunds
    }

    pub fn refund(&self, refund_id: RefundId) -> Option<&Refund> {
        self.refunds.iter().find(|r| r.id == refund_id)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && self.expires_at.is_some_and(|at| now >= at)
    }

    fn sum_refunds(&self, status: RefundStatus) -> Result<Money, DomainError> {
        let amount = self.amount.ok_or_else(DomainError::not_found)?;
        Money::sum(
            amount.currency(),
            self.refunds
                .iter()
                .filter(|r| r.status == status)
                .map(|r| &r.amount),
        )
    }

    pub fn refunded_amount(&self) -> Result<Money, DomainError> {
        self.sum_refunds(RefundStatus::Completed)
    }

    /// Captured amount minus completed and still-pending refunds.
    pub fn refundable_amount(&self) -> Result<Money, DomainError> {
        let amount = self.amount.ok_or_else(DomainError::not_found)?;
        amount
            .checked_sub(self.sum_refunds(RefundStatus::Completed)?)?
            .checked_sub(self.sum_refunds(RefundStatus::Pending)?)
    }
}

impl AggregateRoot for Payment {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePayment. `expires_at` comes from the configured window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePayment {
    pub payment_id: PaymentId,
    pub payment_number: DocumentNumber,
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub expires_at: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartProcessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProcessing {
    pub payment_id: PaymentId,
    pub gateway_payment_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompletePayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayment {
    pub payment_id: PaymentId,
    pub gateway_transaction_id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailPayment {
    pub payment_id: PaymentId,
    pub reason: String,
    pub error_code: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelPayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPayment {
    pub payment_id: PaymentId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ExpirePayment. Evaluated lazily against the caller's `now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirePayment {
    pub payment_id: PaymentId,
    pub now: DateTime<Utc>,
}

/// Command: CreateRefund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRefund {
    pub payment_id: PaymentId,
    pub refund_id: RefundId,
    pub amount: Money,
    pub reason: String,
    pub refund_type: RefundType,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteRefund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRefund {
    pub payment_id: PaymentId,
    pub refund_id: RefundId,
    pub gateway_refund_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailRefund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailRefund {
    pub payment_id: PaymentId,
    pub refund_id: RefundId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentCommand {
    CreatePayment(CreatePayment),
    StartProcessing(StartProcessing),
    CompletePayment(CompletePayment),
    FailPayment(FailPayment),
    CancelPayment(CancelPayment),
    ExpirePayment(ExpirePayment),
    CreateRefund(CreateRefund),
    CompleteRefund(CompleteRefund),
    FailRefund(FailRefund),
}

impl PaymentCommand {
    pub fn payment_id(&self) -> PaymentId {
        match self {
            PaymentCommand::CreatePayment(c) => c.payment_id,
            PaymentCommand::StartProcessing(c) => c.payment_id,
            PaymentCommand::CompletePayment(c) => c.payment_id,
            PaymentCommand::FailPayment(c) => c.payment_id,
            PaymentCommand::CancelPayment(c) => c.payment_id,
            PaymentCommand::ExpirePayment(c) => c.payment_id,
            PaymentCommand::CreateRefund(c) => c.payment_id,
            PaymentCommand::CompleteRefund(c) => c.payment_id,
            PaymentCommand::FailRefund(c) => c.payment_id,
        }
    }
}

impl Command for PaymentCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.payment_id().0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCreated {
    pub payment_id: PaymentId,
    pub payment_number: DocumentNumber,
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub expires_at: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStarted {
    pub payment_id: PaymentId,
    pub gateway_payment_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub payment_id: PaymentId,
    pub gateway_transaction_id: String,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub payment_id: PaymentId,
    pub reason: String,
    pub error_code: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCancelled {
    pub payment_id: PaymentId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentExpired {
    pub payment_id: PaymentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequested {
    pub payment_id: PaymentId,
    pub refund_id: RefundId,
    pub amount: Money,
    pub reason: String,
    pub refund_type: RefundType,
    pub occurred_at: DateTime<Utc>,
}

/// `fully_refunded` moves the payment itself to Refunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundCompleted {
    pub payment_id: PaymentId,
    pub refund_id: RefundId,
    pub gateway_refund_id: Option<String>,
    pub fully_refunded: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundFailed {
    pub payment_id: PaymentId,
    pub refund_id: RefundId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentEvent {
    PaymentCreated(PaymentCreated),
    ProcessingStarted(ProcessingStarted),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    PaymentCancelled(PaymentCancelled),
    PaymentExpired(PaymentExpired),
    RefundRequested(RefundRequested),
    RefundCompleted(RefundCompleted),
    RefundFailed(RefundFailed),
}

impl Event for PaymentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PaymentEvent::PaymentCreated(_) => "payments.payment.created",
            PaymentEvent::ProcessingStarted(_) => "payments.payment.processing_started",
            PaymentEvent::PaymentCompleted(_) => "payments.payment.completed",
            PaymentEvent::PaymentFailed(_) => "payments.payment.failed",
            PaymentEvent::PaymentCancelled(_) => "payments.payment.cancelled",
            PaymentEvent::PaymentExpired(_) => "payments.payment.expired",
            PaymentEvent::RefundRequested(_) => "payments.refund.requested",
            PaymentEvent::RefundCompleted(_) => "payments.refund.completed",
            PaymentEvent::RefundFailed(_) => "payments.refund.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PaymentEvent::PaymentCreated(e) => e.occurred_at,
            PaymentEvent::ProcessingStarted(e) => e.occurred_at,
            PaymentEvent::PaymentCompleted(e) => e.occurred_at,
            PaymentEvent::PaymentFailed(e) => e.occurred_at,
            PaymentEvent::PaymentCancelled(e) => e.occurred_at,
            PaymentEvent::PaymentExpired(e) => e.occurred_at,
            PaymentEvent::RefundRequested(e) => e.occurred_at,
            PaymentEvent::RefundCompleted(e) => e.occurred_at,
            PaymentEvent::RefundFailed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Payment {
    type Command = PaymentCommand;
    type Event = PaymentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        let (message, error_code) = match event {
            PaymentEvent::PaymentCreated(e) => {
                self.id = e.payment_id;
                self.payment_number = Some(e.payment_number.clone());
                self.order_id = Some(e.order_id);
                self.user_id = Some(e.user_id);
                self.amount = Some(e.amount);
                self.method = Some(e.method.clone());
                self.expires_at = e.expires_at;
                self.status = PaymentStatus::Pending;
                self.created_at = Some(e.occurred_at);
                self.created = true;
                ("payment created".to_string(), None)
            }
            PaymentEvent::ProcessingStarted(e) => {
                self.status = PaymentStatus::Processing;
                if e.gateway_payment_id.is_some() {
                    self.gateway_payment_id = e.gateway_payment_id.clone();
                }
                ("processing started".to_string(), None)
            }
            PaymentEvent::PaymentCompleted(e) => {
                self.status = PaymentStatus::Completed;
                self.gateway_transaction_id = Some(e.gateway_transaction_id.clone());
                self.metadata.extend(e.metadata.clone());
                self.processed_at = Some(e.occurred_at);
                ("payment completed".to_string(), None)
            }
            PaymentEvent::PaymentFailed(e) => {
                self.status = PaymentStatus::Failed;
                self.failure_reason = Some(e.reason.clone());
                (e.reason.clone(), e.error_code.clone())
            }
            PaymentEvent::PaymentCancelled(e) => {
                self.status = PaymentStatus::Cancelled;
                self.failure_reason = Some(e.reason.clone());
                (e.reason.clone(), Some(CANCELLED_CODE.to_string()))
            }
            PaymentEvent::PaymentExpired(_) => {
                self.status = PaymentStatus::Expired;
                self.failure_reason = Some("payment expired".to_string());
                ("payment expired".to_string(), Some(EXPIRED_CODE.to_string()))
            }
            PaymentEvent::RefundRequested(e) => {
                self.refunds.push(Refund {
                    id: e.refund_id,
                    amount: e.amount,
                    reason: e.reason.clone(),
                    refund_type: e.refund_type,
                    status: RefundStatus::Pending,
                    gateway_refund_id: None,
                    failure_reason: None,
                    created_at: e.occurred_at,
                    processed_at: None,
                });
                (format!("refund of {} requested", e.amount), None)
            }
            PaymentEvent::RefundCompleted(e) => {
                let mut amount = None;
                if let Some(refund) = self.refunds.iter_mut().find(|r| r.id == e.refund_id) {
                    refund.status = RefundStatus::Completed;
                    refund.gateway_refund_id = e.gateway_refund_id.clone();
                    refund.processed_at = Some(e.occurred_at);
                    amount = Some(refund.amount);
                }
                if e.fully_refunded {
                    self.status = PaymentStatus::Refunded;
                }
                let message = match amount {
                    Some(a) => format!("refund of {a} completed"),
                    None => "refund completed".to_string(),
                };
                (message, None)
            }
            PaymentEvent::RefundFailed(e) => {
                if let Some(refund) = self.refunds.iter_mut().find(|r| r.id == e.refund_id) {
                    refund.status = RefundStatus::Failed;
                    refund.failure_reason = Some(e.reason.clone());
                    refund.processed_at = Some(e.occurred_at);
                }
                (format!("refund failed: {}", e.reason), None)
            }
        };

        self.attempts.push(PaymentAttempt {
            status: self.status,
            message,
            error_code,
            occurred_at: event.occurred_at(),
        });
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PaymentCommand::CreatePayment(cmd) => self.handle_create(cmd),
            PaymentCommand::StartProcessing(cmd) => self.handle_start_processing(cmd),
            PaymentCommand::CompletePayment(cmd) => self.handle_complete(cmd),
            PaymentCommand::FailPayment(cmd) => self.handle_fail(cmd),
            PaymentCommand::CancelPayment(cmd) => self.handle_cancel(cmd),
            PaymentCommand::ExpirePayment(cmd) => self.handle_expire(cmd),
            PaymentCommand::CreateRefund(cmd) => self.handle_create_refund(cmd),
            PaymentCommand::CompleteRefund(cmd) => self.handle_complete_refund(cmd),
            PaymentCommand::FailRefund(cmd) => self.handle_fail_refund(cmd),
        }
    }
}

impl IntegrationSource for Payment {
    fn integration_event(&self, event: &PaymentEvent) -> Option<IntegrationEvent> {
        let order_id = self.order_id?;
        match event {
            PaymentEvent::PaymentCompleted(e) => Some(IntegrationEvent::PaymentCompleted(
                integration::PaymentCompleted {
                    payment_id: e.payment_id.0,
                    order_id,
                    user_id: self.user_id?,
                    amount: self.amount?,
                    gateway_transaction_id: e.gateway_transaction_id.clone(),
                    occurred_at: e.occurred_at,
                },
            )),
            PaymentEvent::PaymentFailed(e) => {
                Some(IntegrationEvent::PaymentFailed(integration::PaymentFailed {
                    payment_id: e.payment_id.0,
                    order_id,
                    reason: e.reason.clone(),
                    error_code: e.error_code.clone(),
                    occurred_at: e.occurred_at,
                }))
            }
            PaymentEvent::PaymentCancelled(e) => {
                Some(IntegrationEvent::PaymentFailed(integration::PaymentFailed {
                    payment_id: e.payment_id.0,
                    order_id,
                    reason: e.reason.clone(),
                    error_code: Some(CANCELLED_CODE.to_string()),
                    occurred_at: e.occurred_at,
                }))
            }
            PaymentEvent::PaymentExpired(e) => {
                Some(IntegrationEvent::PaymentFailed(integration::PaymentFailed {
                    payment_id: e.payment_id.0,
                    order_id,
                    reason: "payment expired".to_string(),
                    error_code: Some(EXPIRED_CODE.to_string()),
                    occurred_at: e.occurred_at,
                }))
            }
            _ => None,
        }
    }
}

impl Payment {
    fn ensure_payment_id(&self, payment_id: PaymentId) -> Result<(), DomainError> {
        if self.id != payment_id {
            return Err(DomainError::invariant("payment_id mismatch"));
        }
        Ok(())
    }

    fn ensure_existing(&self, payment_id: PaymentId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_payment_id(payment_id)
    }

    fn ensure_transition(&self, to: PaymentStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::invalid_transition(self.status, to));
        }
        Ok(())
    }

    fn captured(&self) -> Result<Money, DomainError> {
        self.amount.ok_or_else(DomainError::not_found)
    }

    fn handle_create(&self, cmd: &CreatePayment) -> Result<Vec<PaymentEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists("payment"));
        }
        if !cmd.amount.is_positive() {
            return Err(DomainError::validation("payment amount must be positive"));
        }
        cmd.method.validate()?;
        if cmd.expires_at.is_some_and(|at| at <= cmd.occurred_at) {
            return Err(DomainError::validation("expiry must be after creation"));
        }

        Ok(vec![PaymentEvent::PaymentCreated(PaymentCreated {
            payment_id: cmd.payment_id,
            payment_number: cmd.payment_number.clone(),
            order_id: cmd.order_id,
            user_id: cmd.user_id,
            amount: cmd.amount,
            method: cmd.method.clone(),
            expires_at: cmd.expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start_processing(
        &self,
        cmd: &StartProcessing,
    ) -> Result<Vec<PaymentEvent>, DomainError> {
        self.ensure_existing(cmd.payment_id)?;
        self.ensure_transition(PaymentStatus::Processing)?;
        if let Some(gateway_id) = &cmd.gateway_payment_id {
            require_non_blank(gateway_id, "gateway payment id")?;
        }

        Ok(vec![PaymentEvent::ProcessingStarted(ProcessingStarted {
            payment_id: cmd.payment_id,
            gateway_payment_id: cmd.gateway_payment_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompletePayment) -> Result<Vec<PaymentEvent>, DomainError> {
        self.ensure_existing(cmd.payment_id)?;
        self.ensure_transition(PaymentStatus::Completed)?;
        require_non_blank(&cmd.gateway_transaction_id, "gateway transaction id")?;

        Ok(vec![PaymentEvent::PaymentCompleted(PaymentCompleted {
            payment_id: cmd.payment_id,
            gateway_transaction_id: cmd.gateway_transaction_id.clone(),
            metadata: cmd.metadata.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_fail(&self, cmd: &FailPayment) -> Result<Vec<PaymentEvent>, DomainError> {
        self.ensure_existing(cmd.payment_id)?;
        self.ensure_transition(PaymentStatus::Failed)?;
        require_non_blank(&cmd.reason, "failure reason")?;

        Ok(vec![PaymentEvent::PaymentFailed(PaymentFailed {
            payment_id: cmd.payment_id,
            reason: cmd.reason.clone(),
            error_code: cmd.error_code.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelPayment) -> Result<Vec<PaymentEvent>, DomainError> {
        self.ensure_existing(cmd.payment_id)?;
        self.ensure_transition(PaymentStatus::Cancelled)?;
        require_non_blank(&cmd.reason, "cancellation reason")?;

        Ok(vec![PaymentEvent::PaymentCancelled(PaymentCancelled {
            payment_id: cmd.payment_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Not yet due, already settled, or no expiry at all: nothing happens.
    fn handle_expire(&self, cmd: &ExpirePayment) -> Result<Vec<PaymentEvent>, DomainError> {
        self.ensure_existing(cmd.payment_id)?;
        if !self.is_expired_at(cmd.now) {
            return Ok(Vec::new());
        }

        Ok(vec![PaymentEvent::PaymentExpired(PaymentExpired {
            payment_id: cmd.payment_id,
            occurred_at: cmd.now,
        })])
    }

    fn handle_create_refund(&self, cmd: &CreateRefund) -> Result<Vec<PaymentEvent>, DomainError> {
        self.ensure_existing(cmd.payment_id)?;
        if self.status != PaymentStatus::Completed {
            return Err(DomainError::invalid_transition(self.status, "refund"));
        }
        require_non_blank(&cmd.reason, "refund reason")?;
        let captured = self.captured()?;
        cmd.amount.ensure_same_currency(&captured)?;
        if !cmd.amount.is_positive() {
            return Err(DomainError::validation("refund amount must be positive"));
        }
        if self.refund(cmd.refund_id).is_some() {
            return Err(DomainError::already_exists("refund"));
        }

        let refundable = self.refundable_amount()?;
        if cmd.amount.exceeds(&refundable)? {
            return Err(DomainError::insufficient(format!(
                "refund of {} exceeds refundable {}",
                cmd.amount, refundable
            )));
        }
        if cmd.refund_type == RefundType::Full && cmd.amount != refundable {
            return Err(DomainError::validation(format!(
                "full refund must equal the refundable amount {refundable}"
            )));
        }

        Ok(vec![PaymentEvent::RefundRequested(RefundRequested {
            payment_id: cmd.payment_id,
            refund_id: cmd.refund_id,
            amount: cmd.amount,
            reason: cmd.reason.clone(),
            refund_type: cmd.refund_type,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn pending_refund(&self, refund_id: RefundId) -> Result<&Refund, DomainError> {
        let refund = self.refund(refund_id).ok_or_else(DomainError::not_found)?;
        if !refund.is_pending() {
            return Err(DomainError::invalid_transition(refund.status, "settle refund"));
        }
        Ok(refund)
    }

    fn handle_complete_refund(
        &self,
        cmd: &CompleteRefund,
    ) -> Result<Vec<PaymentEvent>, DomainError> {
        self.ensure_existing(cmd.payment_id)?;
        let refund = self.pending_refund(cmd.refund_id)?;
        if let Some(gateway_id) = &cmd.gateway_refund_id {
            require_non_blank(gateway_id, "gateway refund id")?;
        }

        let captured = self.captured()?;
        let refunded = self.refunded_amount()?.checked_add(refund.amount)?;
        if refunded.exceeds(&captured)? {
            return Err(DomainError::insufficient(format!(
                "completed refunds {refunded} would exceed captured {captured}"
            )));
        }

        Ok(vec![PaymentEvent::RefundCompleted(RefundCompleted {
            payment_id: cmd.payment_id,
            refund_id: cmd.refund_id,
            gateway_refund_id: cmd.gateway_refund_id.clone(),
            fully_refunded: refunded == captured,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_fail_refund(&self, cmd: &FailRefund) -> Result<Vec<PaymentEvent>, DomainError> {
        self.ensure_existing(cmd.payment_id)?;
        self.pending_refund(cmd.refund_id)?;
        require_non_blank(&cmd.reason, "refund failure reason")?;

        Ok(vec![PaymentEvent::RefundFailed(RefundFailed {
            payment_id: cmd.payment_id,
            refund_id: cmd.refund_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
