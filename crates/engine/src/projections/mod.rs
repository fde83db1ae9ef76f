//! Read-model builders.
//!
//! Projections consume committed event envelopes and keep query-optimized
//! views plus the secondary indexes the engine needs for routing
//! (order → payment, idempotency key → refund, shipment → payout claim).
//! All of them are rebuildable from the streams, tenant-isolated, and
//! idempotent under at-least-once delivery.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use marketpay_core::{AggregateId, TenantId};

pub mod escrow;
pub mod invoices;
pub mod payouts;
pub mod refunds;
pub mod settlements;

pub use escrow::{AllocationView, EscrowPaymentReadModel, EscrowProjection};
pub use invoices::{CreditNoteReadModel, InvoiceReadModel, InvoicesProjection};
pub use payouts::{PayoutReadModel, PayoutsProjection};
pub use refunds::{RefundReadModel, RefundsProjection};
pub use settlements::{SettlementReadModel, SettlementsProjection};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event payload: {0}")]
    Deserialize(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Per-stream cursor tracking shared by all projections. Duplicate
/// deliveries are skipped; gaps and regressions are rejected.
#[derive(Debug, Default)]
pub struct StreamCursors {
    inner: RwLock<HashMap<(TenantId, AggregateId), u64>>,
}

/// Whether an envelope should be applied or skipped.
pub enum CursorCheck {
    Apply,
    Duplicate,
}

impl StreamCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<CursorCheck, ProjectionError> {
        let last = match self.inner.read() {
            Ok(map) => map.get(&(tenant_id, aggregate_id)).copied().unwrap_or(0),
            Err(_) => 0,
        };

        if sequence_number == 0 {
            return Err(ProjectionError::NonMonotonicSequence {
                last,
                found: sequence_number,
            });
        }
        if sequence_number <= last {
            return Ok(CursorCheck::Duplicate);
        }
        if sequence_number != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence {
                last,
                found: sequence_number,
            });
        }
        Ok(CursorCheck::Apply)
    }

    pub fn advance(&self, tenant_id: TenantId, aggregate_id: AggregateId, sequence_number: u64) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((tenant_id, aggregate_id), sequence_number);
        }
    }

    pub fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(t, _), _| *t != tenant_id);
        }
    }
}
