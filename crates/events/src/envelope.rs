use serde::{Deserialize, Serialize};
use uuid::Uuid;

use marketpay_core::{AggregateId, TenantId};

/// A domain event wrapped with the metadata that locates it in a stream.
///
/// The envelope is what crosses module boundaries: the store persists it,
/// the bus fans it out, projections fold it. Consumers rely on two
/// guarantees: `tenant_id` scopes every read and write, and
/// `sequence_number` increases by exactly one per event within a stream,
/// so a stream replays into the same ledger every time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    aggregate_type: String,
    sequence_number: u64,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    /// Stream kind, e.g. `"escrow.payment"`. Projections route on this
    /// before touching the payload.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// 1-based, gap-free position within the aggregate stream.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }
}
