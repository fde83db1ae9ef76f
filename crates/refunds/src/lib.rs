//! `marketpay-refunds` — the refund processor.
//!
//! A `RefundRequest` aggregate per refund: Pending → Processing →
//! Completed | Failed, with bounded retries on provider failure. Requests
//! carry a caller-supplied idempotency key; the engine's idempotency index
//! guarantees a duplicate key returns the original result instead of
//! executing a second financial operation.

pub mod request;

pub use request::{
    RefundCommand, RefundEvent, RefundRequest, RefundRequestId, RefundStatus, RefundTarget,
    Requester,
};
