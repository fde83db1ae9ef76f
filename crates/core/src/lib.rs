//! `marketpay-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! strongly-typed identifiers, money/rate helpers, the domain error taxonomy,
//! and the aggregate traits the escrow/settlement/payout modules build on.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{
    AggregateId, BuyerId, CategoryId, OrderId, ShipmentId, StoreId, TenantId, UserId,
};
pub use money::{Currency, RoundingPolicy, ensure_rate};
