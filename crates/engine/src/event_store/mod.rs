//! Append-only event storage.
//!
//! One stream per aggregate instance, keyed by (tenant, aggregate).
//! Sequence numbers are assigned at append time and drive optimistic
//! concurrency; the stream doubles as the money-movement ledger, so
//! appends are atomic per batch and nothing is ever rewritten.

pub mod in_memory;
pub mod store;

pub use in_memory::InMemoryEventStore;
pub use store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
