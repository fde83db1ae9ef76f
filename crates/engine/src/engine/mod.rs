//! The orchestration layer.
//!
//! `Engine` wires the dispatcher, the projections, the rate schedules, and
//! the provider seams into one façade. Domain aggregates stay pure; this
//! module owns the cross-aggregate workflows: commission resolution at
//! escrow creation, refund execution against the ledger, settlement
//! generation from released balances, gap-free invoice numbering, and the
//! payout cycle with threshold roll-over and retry backoff.

mod escrow;
mod invoices;
mod payouts;
mod rates;
mod refunds;
mod settlements;

pub use escrow::EscrowAllocationRequest;
pub use payouts::ScheduleOutcome;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use marketpay_core::{Aggregate, AggregateId, DomainError, StoreId, TenantId};
use marketpay_events::{EventBus, EventEnvelope, InMemoryEventBus};
use marketpay_rates::{CommissionScheduleId, VatScheduleId};
use marketpay_settlement::SettlementPeriod;

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::config::EngineConfig;
use crate::event_store::{EventStore, InMemoryEventStore, StoredEvent};
use crate::projections::{
    EscrowProjection, InvoicesProjection, PayoutsProjection, RefundsProjection,
    SettlementsProjection, escrow as escrow_projection, invoices as invoices_projection,
    payouts as payouts_projection, refunds as refunds_projection,
    settlements as settlements_projection,
};
use crate::sequence::SequenceAllocator;

pub(crate) const ESCROW_AGGREGATE: &str = escrow_projection::AGGREGATE_TYPE;
pub(crate) const REFUND_AGGREGATE: &str = refunds_projection::AGGREGATE_TYPE;
pub(crate) const SETTLEMENT_AGGREGATE: &str = settlements_projection::AGGREGATE_TYPE;
pub(crate) const INVOICE_AGGREGATE: &str = invoices_projection::INVOICE_AGGREGATE_TYPE;
pub(crate) const CREDIT_NOTE_AGGREGATE: &str = invoices_projection::CREDIT_NOTE_AGGREGATE_TYPE;
pub(crate) const PAYOUT_AGGREGATE: &str = payouts_projection::AGGREGATE_TYPE;
pub(crate) const COMMISSION_AGGREGATE: &str = "rates.commission";
pub(crate) const VAT_AGGREGATE: &str = "rates.vat";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// External money movement failed and the failure was recorded.
    #[error("provider call failed: {0}")]
    Provider(String),

    /// Nothing released and no carried-over adjustments for the period.
    #[error("no settlement data for store {store_id} in {period}")]
    NoSettlementData {
        store_id: StoreId,
        period: SettlementPeriod,
    },

    #[error("projection update failed: {0}")]
    Projection(String),
}

impl EngineError {
    /// The underlying domain error, when there is one.
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            EngineError::Domain(e) => Some(e),
            EngineError::Dispatch(d) => d.as_domain(),
            _ => None,
        }
    }
}

/// All read models the engine maintains, updated synchronously from every
/// committed batch.
#[derive(Debug, Default)]
pub struct EngineProjections {
    pub escrow: EscrowProjection,
    pub refunds: RefundsProjection,
    pub settlements: SettlementsProjection,
    pub invoices: InvoicesProjection,
    pub payouts: PayoutsProjection,
}

/// Per-tenant schedule aggregate ids, created lazily on first use.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TenantSchedules {
    pub commission: CommissionScheduleId,
    pub vat: VatScheduleId,
}

/// A correction destined for a store's next settlement statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CarryOverAdjustment {
    pub amount: i64,
    pub reason: String,
    pub corrects_period: Option<SettlementPeriod>,
}

/// The settlement, invoicing and payout engine.
///
/// Generic over the event store and bus, like the dispatcher it wraps, so
/// the whole engine runs against in-memory infrastructure in tests.
pub struct Engine<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    config: EngineConfig,
    projections: EngineProjections,
    sequences: SequenceAllocator,
    schedules: RwLock<HashMap<TenantId, TenantSchedules>>,
    carryovers: Mutex<HashMap<(TenantId, StoreId), Vec<CarryOverAdjustment>>>,
    settlement_locks: Mutex<HashMap<(TenantId, StoreId), Arc<Mutex<()>>>>,
}

/// Engine running entirely on in-memory infrastructure.
pub type InMemoryEngine =
    Engine<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

impl InMemoryEngine {
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventBus::new()),
            config,
        )
    }
}

impl<S, B> Engine<S, B> {
    pub fn new(store: S, bus: B, config: EngineConfig) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            config,
            projections: EngineProjections::default(),
            sequences: SequenceAllocator::new(),
            schedules: RwLock::new(HashMap::new()),
            carryovers: Mutex::new(HashMap::new()),
            settlement_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn projections(&self) -> &EngineProjections {
        &self.projections
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command and fold the committed batch into the read
    /// models before returning, so every engine operation observes its own
    /// writes.
    pub(crate) fn execute<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, EngineError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: marketpay_events::Event + Serialize + DeserializeOwned,
    {
        let committed = self.dispatcher.dispatch::<A>(
            tenant_id,
            aggregate_id,
            aggregate_type,
            command,
            make_aggregate,
        )?;

        for stored in &committed {
            self.apply_to_projections(&stored.to_envelope())?;
        }

        Ok(committed)
    }

    pub(crate) fn load<A>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, EngineError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        Ok(self
            .dispatcher
            .rehydrate(tenant_id, aggregate_id, make_aggregate)?)
    }

    fn apply_to_projections(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), EngineError> {
        let err = |e: crate::projections::ProjectionError| EngineError::Projection(e.to_string());
        self.projections.escrow.apply_envelope(envelope).map_err(err)?;
        self.projections.refunds.apply_envelope(envelope).map_err(err)?;
        self.projections
            .settlements
            .apply_envelope(envelope)
            .map_err(err)?;
        self.projections
            .invoices
            .apply_envelope(envelope)
            .map_err(err)?;
        self.projections.payouts.apply_envelope(envelope).map_err(err)?;
        Ok(())
    }

    /// Serializes settlement generation per store; concurrent generations
    /// for the same store would otherwise race the supersede chain.
    pub(crate) fn settlement_lock(&self, tenant_id: TenantId, store_id: StoreId) -> Arc<Mutex<()>> {
        let mut locks = match self.settlement_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry((tenant_id, store_id)).or_default())
    }
}
