use chrono::{DateTime, Utc};

/// The contract every domain event satisfies.
///
/// An event is a fact: once appended it never changes, which is what lets
/// the escrow event stream double as the financial ledger. `event_type`
/// names the fact stably across releases and `version` carries the schema
/// revision, so stored payloads stay decodable as the types evolve.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable dotted identifier, e.g. `"escrow.payment.created"`.
    fn event_type(&self) -> &'static str;

    /// Payload schema revision.
    fn version(&self) -> u32;

    /// Business time at which the fact happened (not append time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
