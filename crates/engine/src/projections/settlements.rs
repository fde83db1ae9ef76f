use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use marketpay_core::{Currency, StoreId, TenantId, UserId};
use marketpay_events::EventEnvelope;
use marketpay_settlement::{
    SettlementAdjustment, SettlementEvent, SettlementId, SettlementItem, SettlementPeriod,
    SettlementStatus, SettlementTotals,
};

use crate::read_model::{InMemoryTenantStore, TenantStore};

use super::{CursorCheck, ProjectionError, StreamCursors};

pub const AGGREGATE_TYPE: &str = "settlement.statement";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReadModel {
    pub settlement_id: SettlementId,
    pub store_id: StoreId,
    pub period: SettlementPeriod,
    pub version_no: u32,
    pub currency: Currency,
    pub status: SettlementStatus,
    pub superseded: bool,
    pub superseded_by: Option<SettlementId>,
    pub items: Vec<SettlementItem>,
    pub adjustments: Vec<SettlementAdjustment>,
    pub totals: SettlementTotals,
    pub approved_by: Option<UserId>,
    pub export_reference: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Settlement read models plus the "live statement per (store, period)"
/// routing index. Superseded statements stay queryable by id but drop out
/// of the live index.
#[derive(Debug, Default)]
pub struct SettlementsProjection {
    store: InMemoryTenantStore<SettlementId, SettlementReadModel>,
    cursors: StreamCursors,
    live: RwLock<HashMap<(TenantId, StoreId, SettlementPeriod), SettlementId>>,
}

impl SettlementsProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        settlement_id: &SettlementId,
    ) -> Option<SettlementReadModel> {
        self.store.get(tenant_id, settlement_id)
    }

    /// The current (non-superseded) statement for a store and period.
    pub fn live_for_period(
        &self,
        tenant_id: TenantId,
        store_id: StoreId,
        period: SettlementPeriod,
    ) -> Option<SettlementReadModel> {
        let id = *self
            .live
            .read()
            .ok()?
            .get(&(tenant_id, store_id, period))?;
        self.store.get(tenant_id, &id)
    }

    pub fn for_store(&self, tenant_id: TenantId, store_id: StoreId) -> Vec<SettlementReadModel> {
        let mut statements: Vec<_> = self
            .store
            .list(tenant_id)
            .into_iter()
            .filter(|s| s.store_id == store_id)
            .collect();
        statements.sort_by_key(|s| (s.period.start, s.version_no));
        statements
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

        let ev: SettlementEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, settlement_id) = match &ev {
            SettlementEvent::SettlementGenerated(e) => (e.tenant_id, e.settlement_id),
            SettlementEvent::SettlementAdjustmentAdded(e) => (e.tenant_id, e.settlement_id),
            SettlementEvent::SettlementFinalized(e) => (e.tenant_id, e.settlement_id),
            SettlementEvent::SettlementApproved(e) => (e.tenant_id, e.settlement_id),
            SettlementEvent::SettlementExported(e) => (e.tenant_id, e.settlement_id),
            SettlementEvent::SettlementSuperseded(e) => (e.tenant_id, e.settlement_id),
        };
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if settlement_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event settlement_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            SettlementEvent::SettlementGenerated(e) => {
                if let Ok(mut live) = self.live.write() {
                    live.insert((tenant_id, e.store_id, e.period), e.settlement_id);
                }
                self.store.upsert(
                    tenant_id,
                    e.settlement_id,
                    SettlementReadModel {
                        settlement_id: e.settlement_id,
                        store_id: e.store_id,
                        period: e.period,
                        version_no: e.version_no,
                        currency: e.currency,
                        status: SettlementStatus::Draft,
                        superseded: false,
                        superseded_by: None,
                        items: e.items,
                        adjustments: e.adjustments,
                        totals: e.totals,
                        approved_by: None,
                        export_reference: None,
                        updated_at: e.occurred_at,
                    },
                );
            }
            SettlementEvent::SettlementAdjustmentAdded(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.settlement_id) {
                    rm.adjustments.push(e.adjustment);
                    rm.totals = e.totals;
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.settlement_id, rm);
                }
            }
            SettlementEvent::SettlementFinalized(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.settlement_id) {
                    rm.status = SettlementStatus::Finalized;
                    rm.totals = e.totals;
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.settlement_id, rm);
                }
            }
            SettlementEvent::SettlementApproved(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.settlement_id) {
                    rm.status = SettlementStatus::Approved;
                    rm.approved_by = Some(e.approved_by);
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.settlement_id, rm);
                }
            }
            SettlementEvent::SettlementExported(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.settlement_id) {
                    rm.status = SettlementStatus::Exported;
                    rm.export_reference = Some(e.export_reference);
                    rm.updated_at = e.occurred_at;
                    self.store.upsert(tenant_id, e.settlement_id, rm);
                }
            }
            SettlementEvent::SettlementSuperseded(e) => {
                if let Some(mut rm) = self.store.get(tenant_id, &e.settlement_id) {
                    rm.superseded = true;
                    rm.superseded_by = Some(e.superseded_by);
                    rm.updated_at = e.occurred_at;
                    if let Ok(mut live) = self.live.write() {
                        let key = (tenant_id, rm.store_id, rm.period);
                        if live.get(&key) == Some(&e.settlement_id) {
                            live.remove(&key);
                        }
                    }
                    self.store.upsert(tenant_id, e.settlement_id, rm);
                }
            }
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }
}
