//! `marketpay-events` — domain-agnostic event plumbing.
//!
//! The financial modules (escrow, settlement, payouts, ...) emit typed events;
//! this crate defines the event contract, the tenant-scoped envelope used for
//! persistence and publication, and the pub/sub bus abstraction.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::InMemoryEventBus;
