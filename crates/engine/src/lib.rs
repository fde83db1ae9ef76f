//! Application layer: event store, command dispatch, read models, and the
//! engine façade that wires the escrow/refund/settlement/invoicing/payout
//! domains together.

pub mod command_dispatcher;
pub mod config;
pub mod engine;
pub mod event_store;
pub mod projections;
pub mod providers;
pub mod read_model;
pub mod sequence;

#[cfg(test)]
mod integration_tests;

pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use config::EngineConfig;
pub use engine::{
    Engine, EngineError, EngineProjections, EscrowAllocationRequest, InMemoryEngine,
    ScheduleOutcome,
};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent};
pub use providers::{PaymentProvider, PayoutProvider, ProviderError};
pub use sequence::{DocumentKind, SequenceAllocator};
