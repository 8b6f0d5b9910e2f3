//! Payments domain module (event-sourced).
//!
//! The payment lifecycle (pending → processing → completed) with lazy expiry
//! and bounded refunds. Gateway calls happen outside; this crate only records
//! their outcomes.

pub mod method;
pub mod payment;
pub mod refund;
pub mod status;

pub use method::{PaymentMethod, PaymentMethodKind};
pub use payment::{
    CancelPayment, CompletePayment, CompleteRefund, CreatePayment, CreateRefund, ExpirePayment,
    FailPayment, FailRefund, Payment, PaymentCommand, PaymentEvent, PaymentId, StartProcessing,
};
pub use refund::{Refund, RefundId, RefundStatus, RefundType};
pub use status::{PaymentAttempt, PaymentStatus};
