//! Commission and VAT schedule management plus read-time rate resolution.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use marketpay_core::{AggregateId, CategoryId, StoreId, TenantId};
use marketpay_events::{EventBus, EventEnvelope};
use marketpay_rates::{
    CommissionCommand, CommissionSchedule, CommissionScheduleId, CommissionScope, CountryCode,
    EffectiveWindow, VatCommand, VatSchedule, VatScheduleId, VatScope,
};
use marketpay_rates::commission::{
    AddCommissionRule, DeactivateCommissionRule, UpdateCommissionRule,
};
use marketpay_rates::vat::{AddVatRule, DeactivateVatRule};
use serde_json::Value as JsonValue;

use crate::event_store::EventStore;

use super::{COMMISSION_AGGREGATE, Engine, EngineError, TenantSchedules, VAT_AGGREGATE};

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub(crate) fn tenant_schedules(&self, tenant_id: TenantId) -> TenantSchedules {
        if let Ok(schedules) = self.schedules.read() {
            if let Some(found) = schedules.get(&tenant_id) {
                return *found;
            }
        }

        let mut schedules = match self.schedules.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *schedules.entry(tenant_id).or_insert_with(|| TenantSchedules {
            commission: CommissionScheduleId::new(AggregateId::new()),
            vat: VatScheduleId::new(AggregateId::new()),
        })
    }

    pub fn add_commission_rule(
        &self,
        tenant_id: TenantId,
        scope: CommissionScope,
        rate: Decimal,
        window: EffectiveWindow,
        now: DateTime<Utc>,
    ) -> Result<Uuid, EngineError> {
        let schedule_id = self.tenant_schedules(tenant_id).commission;
        let rule_id = Uuid::now_v7();

        self.execute::<CommissionSchedule>(
            tenant_id,
            schedule_id.0,
            COMMISSION_AGGREGATE,
            CommissionCommand::AddCommissionRule(AddCommissionRule {
                tenant_id,
                schedule_id,
                rule_id,
                scope,
                rate,
                window,
                occurred_at: now,
            }),
            |id| CommissionSchedule::empty(CommissionScheduleId::new(id)),
        )?;

        info!(%tenant_id, %rule_id, %rate, "commission rule added");
        Ok(rule_id)
    }

    pub fn update_commission_rule(
        &self,
        tenant_id: TenantId,
        rule_id: Uuid,
        rate: Decimal,
        window: EffectiveWindow,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let schedule_id = self.tenant_schedules(tenant_id).commission;
        self.execute::<CommissionSchedule>(
            tenant_id,
            schedule_id.0,
            COMMISSION_AGGREGATE,
            CommissionCommand::UpdateCommissionRule(UpdateCommissionRule {
                tenant_id,
                schedule_id,
                rule_id,
                rate,
                window,
                occurred_at: now,
            }),
            |id| CommissionSchedule::empty(CommissionScheduleId::new(id)),
        )?;
        Ok(())
    }

    pub fn deactivate_commission_rule(
        &self,
        tenant_id: TenantId,
        rule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let schedule_id = self.tenant_schedules(tenant_id).commission;
        self.execute::<CommissionSchedule>(
            tenant_id,
            schedule_id.0,
            COMMISSION_AGGREGATE,
            CommissionCommand::DeactivateCommissionRule(DeactivateCommissionRule {
                tenant_id,
                schedule_id,
                rule_id,
                occurred_at: now,
            }),
            |id| CommissionSchedule::empty(CommissionScheduleId::new(id)),
        )?;
        Ok(())
    }

    pub fn add_vat_rule(
        &self,
        tenant_id: TenantId,
        scope: VatScope,
        rate: Decimal,
        window: EffectiveWindow,
        now: DateTime<Utc>,
    ) -> Result<Uuid, EngineError> {
        let schedule_id = self.tenant_schedules(tenant_id).vat;
        let rule_id = Uuid::now_v7();

        self.execute::<VatSchedule>(
            tenant_id,
            schedule_id.0,
            VAT_AGGREGATE,
            VatCommand::AddVatRule(AddVatRule {
                tenant_id,
                schedule_id,
                rule_id,
                scope,
                rate,
                window,
                occurred_at: now,
            }),
            |id| VatSchedule::empty(VatScheduleId::new(id)),
        )?;

        info!(%tenant_id, %rule_id, %rate, "vat rule added");
        Ok(rule_id)
    }

    pub fn deactivate_vat_rule(
        &self,
        tenant_id: TenantId,
        rule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let schedule_id = self.tenant_schedules(tenant_id).vat;
        self.execute::<VatSchedule>(
            tenant_id,
            schedule_id.0,
            VAT_AGGREGATE,
            VatCommand::DeactivateVatRule(DeactivateVatRule {
                tenant_id,
                schedule_id,
                rule_id,
                occurred_at: now,
            }),
            |id| VatSchedule::empty(VatScheduleId::new(id)),
        )?;
        Ok(())
    }

    /// Resolve the commission rate for a shipment: seller override, then
    /// category, then global, then the configured default.
    pub fn resolve_commission_rate(
        &self,
        tenant_id: TenantId,
        store_id: StoreId,
        category_id: Option<CategoryId>,
        as_of: NaiveDate,
    ) -> Result<Decimal, EngineError> {
        let schedule_id = self.tenant_schedules(tenant_id).commission;
        let schedule = self.load(tenant_id, schedule_id.0, |id| {
            CommissionSchedule::empty(CommissionScheduleId::new(id))
        })?;
        Ok(schedule.resolve(
            store_id,
            category_id,
            as_of,
            self.config.default_commission_rate,
        )?)
    }

    /// Resolve the VAT rate for an invoice. An unconfigured tenant or an
    /// unmatched country falls back to zero-rated.
    pub fn resolve_vat_rate(
        &self,
        tenant_id: TenantId,
        country: &CountryCode,
        category_id: Option<CategoryId>,
        as_of: NaiveDate,
    ) -> Result<Decimal, EngineError> {
        let schedule_id = self.tenant_schedules(tenant_id).vat;
        let schedule = self.load(tenant_id, schedule_id.0, |id| VatSchedule::empty(VatScheduleId::new(id)))?;
        Ok(schedule.resolve(country, category_id, as_of, Some(Decimal::ZERO))?)
    }
}
