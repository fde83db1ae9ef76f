use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use marketpay_core::TenantId;
use marketpay_escrow::EscrowPaymentId;
use marketpay_events::EventEnvelope;
use marketpay_refunds::{
    RefundEvent, RefundRequestId, RefundStatus, RefundTarget, Requester,
};

use crate::read_model::{InMemoryTenantStore, TenantStore};

use super::{CursorCheck, ProjectionError, StreamCursors};

pub const AGGREGATE_TYPE: &str = "refunds.request";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReadModel {
    pub refund_id: RefundRequestId,
    pub payment_id: EscrowPaymentId,
    pub target: RefundTarget,
    pub requester: Requester,
    pub amount: Option<i64>,
    pub reason: String,
    pub idempotency_key: String,
    pub status: RefundStatus,
    pub attempts: u32,
    pub terminal: bool,
    pub last_error: Option<String>,
    pub provider_reference: Option<String>,
    pub amount_refunded: Option<i64>,
    pub commission_reversed: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Refund read models plus the idempotency-key routing index.
#[derive(Debug, Default)]
pub struct RefundsProjection {
    store: InMemoryTenantStore<RefundRequestId, RefundReadModel>,
    cursors: StreamCursors,
    keys: RwLock<HashMap<(TenantId, String), RefundRequestId>>,
}

impl RefundsProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        refund_id: &RefundRequestId,
    ) -> Option<RefundReadModel> {
        self.store.get(tenant_id, refund_id)
    }

    pub fn by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Option<RefundRequestId> {
        self.keys
            .read()
            .ok()?
            .get(&(tenant_id, key.to_string()))
            .copied()
    }

    /// Terminally failed requests awaiting an operator.
    pub fn needing_manual_resolution(&self, tenant_id: TenantId) -> Vec<RefundReadModel> {
        self.store
            .list(tenant_id)
            .into_iter()
            .filter(|r| r.status == RefundStatus::Failed && r.terminal)
            .collect()
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != AGGREGATE_TYPE {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if let CursorCheck::Duplicate = self.cursors.check(tenant_id, aggregate_id, seq)? {
            return Ok(());
        }

        let ev: RefundEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, refund_id) = match &ev {
            RefundEvent::RefundInitiated(e) => (e.tenant_id, e.refund_id),
            RefundEvent::RefundProcessingStarted(e) => (e.tenant_id, e.refund_id),
            RefundEvent::RefundCompleted(e) => (e.tenant_id, e.refund_id),
            RefundEvent::RefundFailed(e) => (e.tenant_id, e.refund_id),
        };
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if refund_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event refund_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            RefundEvent::RefundInitiated(e) => {
                if let Ok(mut keys) = self.keys.write() {
                    keys.insert((tenant_id, e.idempotency_key.clone()), e.refund_id);
                }
                self.store.upsert(
                    tenant_id,
                    e.refund_id,
                    RefundReadModel {
                        refund_id: e.refund_id,
                        payment_id: e.payment_id,
                        target: e.target,
                        requester: e.requester,
                        amount: e.amount,
                        reason: e.reason,
                        idempotency_key: e.idempotency_key,
                        status: RefundStatus::Pending,
                        attempts: 0,
                        terminal: false,
                        last_error: None,
                        provider_reference: None,
                        amount_refunded: None,
                        commission_reversed: None,
                        updated_at: e.occurred_at,
                    },
                );
            }
            RefundEvent::RefundProcessingStarted(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.refund_id) {
                    rm.status = RefundStatus::Processing;
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.refund_id, rm);
                }
            }
            RefundEvent::RefundCompleted(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.refund_id) {
                    rm.status = RefundStatus::Completed;
                    rm.provider_reference = Some(e.provider_reference);
                    rm.amount_refunded = Some(e.amount_refunded);
                    rm.commission_reversed = Some(e.commission_reversed);
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.refund_id, rm);
                }
            }
            RefundEvent::RefundFailed(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.refund_id) {
                    rm.status = RefundStatus::Failed;
                    rm.attempts = e.attempts;
                    rm.terminal = e.terminal;
                    rm.last_error = Some(e.error);
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.refund_id, rm);
                }
            }
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }
}
