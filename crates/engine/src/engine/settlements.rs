//! Settlement generation and lifecycle.
//!
//! Statements are derived from the escrow ledger (allocations released or
//! fully refunded in the period) plus any carried-over corrections.
//! Explicitly requested regeneration of an unapproved period supersedes
//! the previous version; approved statements are immutable and
//! regeneration is rejected.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use marketpay_core::{AggregateId, Currency, DomainError, StoreId, TenantId, UserId};
use marketpay_events::{EventBus, EventEnvelope};
use marketpay_settlement::{
    Settlement, SettlementAdjustment, SettlementCommand, SettlementId, SettlementItem,
    SettlementPeriod, SettlementStatus,
};
use marketpay_settlement::statement::{
    AddAdjustment, ApproveSettlement, FinalizeSettlement, GenerateSettlement, MarkExported,
    SupersedeSettlement,
};

use crate::event_store::EventStore;
use crate::projections::SettlementReadModel;

use super::{CarryOverAdjustment, Engine, EngineError, SETTLEMENT_AGGREGATE};

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Generate the settlement statement for a store and period.
    ///
    /// Items come from allocations settled within the period; pending
    /// carry-over adjustments for the store are drained into the
    /// statement. When a live statement already exists for the period the
    /// call is rejected unless `regenerate` is set, in which case a Draft
    /// or Finalized statement is superseded by the new version; Approved
    /// and Exported statements are never regenerated. A period overlapping
    /// a different live statement would double-count allocations and is
    /// rejected outright.
    pub fn generate_settlement(
        &self,
        tenant_id: TenantId,
        store_id: StoreId,
        period: SettlementPeriod,
        currency: Currency,
        regenerate: bool,
        now: DateTime<Utc>,
    ) -> Result<SettlementId, EngineError> {
        let lock = self.settlement_lock(tenant_id, store_id);
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let previous = self
            .projections
            .settlements
            .live_for_period(tenant_id, store_id, period);
        if let Some(ref existing) = previous {
            match existing.status {
                SettlementStatus::Draft | SettlementStatus::Finalized if regenerate => {}
                SettlementStatus::Draft | SettlementStatus::Finalized => {
                    return Err(DomainError::already_exists(format!(
                        "a live settlement for store {store_id} in {period} already exists; \
                         regeneration must be requested explicitly"
                    ))
                    .into());
                }
                SettlementStatus::Approved | SettlementStatus::Exported => {
                    return Err(DomainError::already_exists(format!(
                        "settlement for store {store_id} in {period} is already {:?}",
                        existing.status
                    ))
                    .into());
                }
            }
        }
        let overlapping = self
            .projections
            .settlements
            .for_store(tenant_id, store_id)
            .into_iter()
            .find(|s| !s.superseded && s.period != period && s.period.overlaps(&period));
        if let Some(other) = overlapping {
            return Err(DomainError::validation(format!(
                "period {period} overlaps the live settlement for {}",
                other.period
            ))
            .into());
        }

        let items: Vec<SettlementItem> = self
            .projections
            .escrow
            .settled_in_period(tenant_id, store_id, period)
            .into_iter()
            .map(|(order_id, a)| SettlementItem {
                shipment_id: a.shipment_id,
                order_id,
                gross_amount: a.seller_amount,
                shipping_amount: a.shipping_amount,
                commission_amount: a.commission_amount,
                refunded_amount: a.refunded_amount,
                refunded_commission: a.refunded_commission,
            })
            .collect();

        let pending = self.take_carry_overs(tenant_id, store_id);
        if items.is_empty() && pending.is_empty() {
            return Err(EngineError::NoSettlementData { store_id, period });
        }
        let adjustments: Vec<SettlementAdjustment> = pending
            .iter()
            .map(|c| SettlementAdjustment {
                adjustment_id: AggregateId::new(),
                amount: c.amount,
                reason: c.reason.clone(),
                corrects_period: c.corrects_period,
            })
            .collect();

        let version_no = previous.as_ref().map(|p| p.version_no + 1).unwrap_or(1);
        let settlement_id = SettlementId::new(AggregateId::new());

        let generated = self.execute::<Settlement>(
            tenant_id,
            settlement_id.0,
            SETTLEMENT_AGGREGATE,
            SettlementCommand::GenerateSettlement(GenerateSettlement {
                tenant_id,
                settlement_id,
                store_id,
                period,
                version_no,
                currency,
                items,
                adjustments,
                occurred_at: now,
            }),
            |id| Settlement::empty(SettlementId::new(id)),
        );
        if generated.is_err() {
            // The drained corrections must not be lost on a rejected
            // generation; they belong to the next attempt.
            self.restore_carry_overs(tenant_id, store_id, pending);
        }
        generated?;

        if let Some(existing) = previous {
            self.execute::<Settlement>(
                tenant_id,
                existing.settlement_id.0,
                SETTLEMENT_AGGREGATE,
                SettlementCommand::SupersedeSettlement(SupersedeSettlement {
                    tenant_id,
                    settlement_id: existing.settlement_id,
                    superseded_by: settlement_id,
                    occurred_at: now,
                }),
                |id| Settlement::empty(SettlementId::new(id)),
            )?;
        }

        info!(%tenant_id, %settlement_id, %store_id, %period, version_no, "settlement generated");
        Ok(settlement_id)
    }

    pub fn add_settlement_adjustment(
        &self,
        tenant_id: TenantId,
        settlement_id: SettlementId,
        amount: i64,
        reason: &str,
        corrects_period: Option<SettlementPeriod>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<Settlement>(
            tenant_id,
            settlement_id.0,
            SETTLEMENT_AGGREGATE,
            SettlementCommand::AddAdjustment(AddAdjustment {
                tenant_id,
                settlement_id,
                adjustment: SettlementAdjustment {
                    adjustment_id: AggregateId::new(),
                    amount,
                    reason: reason.to_string(),
                    corrects_period,
                },
                occurred_at: now,
            }),
            |id| Settlement::empty(SettlementId::new(id)),
        )?;
        Ok(())
    }

    pub fn finalize_settlement(
        &self,
        tenant_id: TenantId,
        settlement_id: SettlementId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<Settlement>(
            tenant_id,
            settlement_id.0,
            SETTLEMENT_AGGREGATE,
            SettlementCommand::FinalizeSettlement(FinalizeSettlement {
                tenant_id,
                settlement_id,
                occurred_at: now,
            }),
            |id| Settlement::empty(SettlementId::new(id)),
        )?;
        Ok(())
    }

    pub fn approve_settlement(
        &self,
        tenant_id: TenantId,
        settlement_id: SettlementId,
        approved_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<Settlement>(
            tenant_id,
            settlement_id.0,
            SETTLEMENT_AGGREGATE,
            SettlementCommand::ApproveSettlement(ApproveSettlement {
                tenant_id,
                settlement_id,
                approved_by,
                occurred_at: now,
            }),
            |id| Settlement::empty(SettlementId::new(id)),
        )?;
        info!(%tenant_id, %settlement_id, %approved_by, "settlement approved");
        Ok(())
    }

    pub fn export_settlement(
        &self,
        tenant_id: TenantId,
        settlement_id: SettlementId,
        export_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<Settlement>(
            tenant_id,
            settlement_id.0,
            SETTLEMENT_AGGREGATE,
            SettlementCommand::MarkExported(MarkExported {
                tenant_id,
                settlement_id,
                export_reference: export_reference.to_string(),
                occurred_at: now,
            }),
            |id| Settlement::empty(SettlementId::new(id)),
        )?;
        Ok(())
    }

    pub fn settlement(
        &self,
        tenant_id: TenantId,
        settlement_id: &SettlementId,
    ) -> Option<SettlementReadModel> {
        self.projections.settlements.get(tenant_id, settlement_id)
    }

    pub(crate) fn record_carry_over(
        &self,
        tenant_id: TenantId,
        store_id: StoreId,
        adjustment: CarryOverAdjustment,
    ) {
        let mut carryovers = match self.carryovers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        carryovers
            .entry((tenant_id, store_id))
            .or_default()
            .push(adjustment);
    }

    fn take_carry_overs(&self, tenant_id: TenantId, store_id: StoreId) -> Vec<CarryOverAdjustment> {
        let mut carryovers = match self.carryovers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        carryovers.remove(&(tenant_id, store_id)).unwrap_or_default()
    }

    fn restore_carry_overs(
        &self,
        tenant_id: TenantId,
        store_id: StoreId,
        mut pending: Vec<CarryOverAdjustment>,
    ) {
        if pending.is_empty() {
            return;
        }
        let mut carryovers = match self.carryovers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = carryovers.entry((tenant_id, store_id)).or_default();
        pending.append(entry);
        *entry = pending;
    }
}
