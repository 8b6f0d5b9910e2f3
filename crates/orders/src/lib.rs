//! Orders domain module (event-sourced).
//!
//! Business rules for customer orders: the lifecycle state machine, line
//! items, and the derived pricing snapshot. Pure, deterministic domain logic
//! (no IO, no HTTP, no storage).

pub mod order;
pub mod pricing;
pub mod status;

pub use order::{
    AddItem, ApplyCoupon, AttachPayment, CancelOrder, ChangeShippingAddress, ConfirmOrder,
    CreateOrder, DeliverOrder, NewLineItem, Order, OrderCommand, OrderEvent, OrderId,
    ProcessOrder, RefundOrder, RemoveCoupon, RemoveItem, SetBillingAddress, SetShippingMethod,
    ShipOrder, UpdateItemQuantity,
};
pub use pricing::{LineItem, PricingSnapshot, TAX_RATE_BPS};
pub use status::{OrderStatus, StatusHistoryEntry};
