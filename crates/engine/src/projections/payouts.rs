use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;

use marketpay_core::{Currency, ShipmentId, StoreId, TenantId};
use marketpay_events::EventEnvelope;
use marketpay_payouts::{PayoutEvent, PayoutStatus, SellerPayoutId};

use crate::read_model::{InMemoryTenantStore, TenantStore};

use super::{CursorCheck, ProjectionError, StreamCursors};

pub const AGGREGATE_TYPE: &str = "payouts.payout";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutReadModel {
    pub payout_id: SellerPayoutId,
    pub store_id: StoreId,
    pub currency: Currency,
    pub amount: i64,
    pub shipments: Vec<ShipmentId>,
    pub scheduled_for: NaiveDate,
    pub status: PayoutStatus,
    pub attempts: u32,
    pub terminal: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub provider_reference: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Payout read models plus the shipment claim index. A shipment claimed by
/// a live payout is never picked up by the next payout run; the claim is
/// dropped only when the payout fails terminally, so the shipment rolls
/// into a future cycle instead of being paid twice.
#[derive(Debug, Default)]
pub struct PayoutsProjection {
    store: InMemoryTenantStore<SellerPayoutId, PayoutReadModel>,
    cursors: StreamCursors,
    claims: RwLock<HashMap<(TenantId, ShipmentId), SellerPayoutId>>,
}

impl PayoutsProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        payout_id: &SellerPayoutId,
    ) -> Option<PayoutReadModel> {
        self.store.get(tenant_id, payout_id)
    }

    pub fn claim_for_shipment(
        &self,
        tenant_id: TenantId,
        shipment_id: ShipmentId,
    ) -> Option<SellerPayoutId> {
        self.claims
            .read()
            .ok()?
            .get(&(tenant_id, shipment_id))
            .copied()
    }

    pub fn for_store(&self, tenant_id: TenantId, store_id: StoreId) -> Vec<PayoutReadModel> {
        let mut payouts: Vec<_> = self
            .store
            .list(tenant_id)
            .into_iter()
            .filter(|p| p.store_id == store_id)
            .collect();
        payouts.sort_by_key(|p| p.scheduled_for);
        payouts
    }

    /// Failed payouts whose backoff has elapsed.
    pub fn retry_due(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Vec<PayoutReadModel> {
        self.store
            .list(tenant_id)
            .into_iter()
            .filter(|p| {
                p.status == PayoutStatus::Failed
                    && !p.terminal
                    && p.next_retry_at.is_some_and(|at| at <= now)
            })
            .collect()
    }

    /// Terminally failed payouts awaiting an operator.
    pub fn needing_manual_resolution(&self, tenant_id: TenantId) -> Vec<PayoutReadModel> {
        self.store
            .list(tenant_id)
            .into_iter()
            .filter(|p| p.status == PayoutStatus::Failed && p.terminal)
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

        let ev: PayoutEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, payout_id) = match &ev {
            PayoutEvent::PayoutScheduled(e) => (e.tenant_id, e.payout_id),
            PayoutEvent::PayoutProcessingStarted(e) => (e.tenant_id, e.payout_id),
            PayoutEvent::PayoutPaid(e) => (e.tenant_id, e.payout_id),
            PayoutEvent::PayoutFailed(e) => (e.tenant_id, e.payout_id),
        };
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if payout_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event payout_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            PayoutEvent::PayoutScheduled(e) => {
                if let Ok(mut claims) = self.claims.write() {
                    for shipment_id in &e.shipments {
                        claims.insert((tenant_id, *shipment_id), e.payout_id);
                    }
                }
                self.store.upsert(
                    tenant_id,
                    e.payout_id,
                    PayoutReadModel {
                        payout_id: e.payout_id,
                        store_id: e.store_id,
                        currency: e.currency,
                        amount: e.amount,
                        shipments: e.shipments,
                        scheduled_for: e.scheduled_for,
                        status: PayoutStatus::Scheduled,
                        attempts: 0,
                        terminal: false,
                        next_retry_at: None,
                        provider_reference: None,
                        last_error: None,
                        updated_at: e.occurred_at,
                    },
                );
            }
            PayoutEvent::PayoutProcessingStarted(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.payout_id) {
                    rm.status = PayoutStatus::Processing;
                    rm.next_retry_at = None;
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.payout_id, rm);
                }
            }
            PayoutEvent::PayoutPaid(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.payout_id) {
                    rm.status = PayoutStatus::Paid;
                    rm.provider_reference = Some(e.provider_reference);
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.payout_id, rm);
                }
            }
            PayoutEvent::PayoutFailed(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.payout_id) {
                    rm.status = PayoutStatus::Failed;
                    rm.attempts = e.attempts;
                    rm.terminal = e.terminal;
                    rm.next_retry_at = e.next_retry_at;
                    rm.last_error = Some(e.error);
                    rm.updated_at = e.occurred_at;
                    if e.terminal {
                        if let Ok(mut claims) = self.claims.write() {
                            for shipment_id in &rm.shipments {
                                let key = (tenant_id, *shipment_id);
                                if claims.get(&key) == Some(&e.payout_id) {
                                    claims.remove(&key);
                                }
                            }
                        }
                    }
                    self.store.upsert(tenant_id, e.payout_id, rm);
                }
            }
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }
}
