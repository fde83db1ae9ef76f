use chrono::{DateTime, NaiveDate, Utc};
use core::str::FromStr;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use marketpay_core::money::ensure_rate;
use marketpay_core::{Aggregate, AggregateId, AggregateRoot, CategoryId, DomainError, TenantId};
use marketpay_events::Event;

use crate::window::EffectiveWindow;

/// ISO-3166 alpha-2 country code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn new(code: impl Into<String>) -> Result<Self, DomainError> {
        let code = code.into();
        if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(DomainError::validation(format!(
                "country code must be 2 uppercase ASCII letters, got '{code}'"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CountryCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CountryCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// VAT schedule identifier (one schedule aggregate per tenant).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VatScheduleId(pub AggregateId);

impl VatScheduleId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for VatScheduleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// VAT rule scope. Category-specific beats country-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum VatScope {
    CountryWide {
        country: CountryCode,
    },
    CategorySpecific {
        country: CountryCode,
        category: CategoryId,
    },
}

impl VatScope {
    fn country(&self) -> &CountryCode {
        match self {
            VatScope::CountryWide { country } => country,
            VatScope::CategorySpecific { country, .. } => country,
        }
    }
}

/// A scoped, time-bounded VAT rate rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRule {
    pub rule_id: Uuid,
    pub scope: VatScope,
    pub rate: Decimal,
    pub window: EffectiveWindow,
    pub is_active: bool,
}

impl VatRule {
    fn is_active_on(&self, date: NaiveDate) -> bool {
        self.is_active && self.window.contains(date)
    }
}

/// Aggregate root: the tenant's VAT rule set. Structurally a sibling of
/// `CommissionSchedule`, with country-scoped precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatSchedule {
    id: VatScheduleId,
    tenant_id: Option<TenantId>,
    rules: Vec<VatRule>,
    version: u64,
    created: bool,
}

impl VatSchedule {
    pub fn empty(id: VatScheduleId) -> Self {
        Self {
            id,
            tenant_id: None,
            rules: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> VatScheduleId {
        self.id
    }

    pub fn rules(&self) -> &[VatRule] {
        &self.rules
    }

    /// Resolve the tax rate for (country, category, date); category-specific
    /// rules win over country-wide ones, then the caller default applies.
    pub fn resolve(
        &self,
        country: &CountryCode,
        category_id: Option<CategoryId>,
        as_of: NaiveDate,
        default: Option<Decimal>,
    ) -> Result<Decimal, DomainError> {
        if let Some(category) = category_id {
            if let Some(rule) = self.rules.iter().find(|r| {
                r.is_active_on(as_of)
                    && matches!(
                        &r.scope,
                        VatScope::CategorySpecific { country: c, category: cat }
                            if c == country && *cat == category
                    )
            }) {
                return Ok(rule.rate);
            }
        }

        if let Some(rule) = self.rules.iter().find(|r| {
            r.is_active_on(as_of)
                && matches!(&r.scope, VatScope::CountryWide { country: c } if c == country)
        }) {
            return Ok(rule.rate);
        }

        default.ok_or(DomainError::NotFound)
    }

    fn find_conflict(&self, scope: &VatScope, window: &EffectiveWindow) -> Option<&VatRule> {
        self.rules
            .iter()
            .find(|r| r.is_active && r.scope == *scope && r.window.overlaps(window))
    }
}

impl AggregateRoot for VatSchedule {
    type Id = VatScheduleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddVatRule {
    pub tenant_id: TenantId,
    pub schedule_id: VatScheduleId,
    pub rule_id: Uuid,
    pub scope: VatScope,
    pub rate: Decimal,
    pub window: EffectiveWindow,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateVatRule {
    pub tenant_id: TenantId,
    pub schedule_id: VatScheduleId,
    pub rule_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VatCommand {
    AddVatRule(AddVatRule),
    DeactivateVatRule(DeactivateVatRule),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRuleAdded {
    pub tenant_id: TenantId,
    pub schedule_id: VatScheduleId,
    pub rule_id: Uuid,
    pub scope: VatScope,
    pub rate: Decimal,
    pub window: EffectiveWindow,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRuleDeactivated {
    pub tenant_id: TenantId,
    pub schedule_id: VatScheduleId,
    pub rule_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VatEvent {
    VatRuleAdded(VatRuleAdded),
    VatRuleDeactivated(VatRuleDeactivated),
}

impl Event for VatEvent {
    fn event_type(&self) -> &'static str {
        match self {
            VatEvent::VatRuleAdded(_) => "rates.vat.rule_added",
            VatEvent::VatRuleDeactivated(_) => "rates.vat.rule_deactivated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            VatEvent::VatRuleAdded(e) => e.occurred_at,
            VatEvent::VatRuleDeactivated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for VatSchedule {
    type Command = VatCommand;
    type Event = VatEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            VatEvent::VatRuleAdded(e) => {
                self.id = e.schedule_id;
                if self.tenant_id.is_none() {
                    self.tenant_id = Some(e.tenant_id);
                    self.created = true;
                }
                self.rules.push(VatRule {
                    rule_id: e.rule_id,
                    scope: e.scope.clone(),
                    rate: e.rate,
                    window: e.window,
                    is_active: true,
                });
            }
            VatEvent::VatRuleDeactivated(e) => {
                if let Some(rule) = self.rules.iter_mut().find(|r| r.rule_id == e.rule_id) {
                    rule.is_active = false;
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            VatCommand::AddVatRule(cmd) => self.handle_add(cmd),
            VatCommand::DeactivateVatRule(cmd) => self.handle_deactivate(cmd),
        }
    }
}

impl VatSchedule {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn handle_add(&self, cmd: &AddVatRule) -> Result<Vec<VatEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        ensure_rate(cmd.rate)?;
        if !cmd.window.is_ordered() {
            return Err(DomainError::validation(
                "effective window must have from <= to",
            ));
        }
        if self.rules.iter().any(|r| r.rule_id == cmd.rule_id) {
            return Err(DomainError::already_exists(format!(
                "vat rule {} already exists",
                cmd.rule_id
            )));
        }
        if let Some(conflict) = self.find_conflict(&cmd.scope, &cmd.window) {
            return Err(DomainError::conflicting_rule(format!(
                "{} scope already covered by rule {} in an overlapping window",
                cmd.scope.country(),
                conflict.rule_id
            )));
        }

        Ok(vec![VatEvent::VatRuleAdded(VatRuleAdded {
            tenant_id: cmd.tenant_id,
            schedule_id: cmd.schedule_id,
            rule_id: cmd.rule_id,
            scope: cmd.scope.clone(),
            rate: cmd.rate,
            window: cmd.window,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivateVatRule) -> Result<Vec<VatEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        let existing = self
            .rules
            .iter()
            .find(|r| r.rule_id == cmd.rule_id)
            .ok_or(DomainError::NotFound)?;
        if !existing.is_active {
            return Ok(vec![]);
        }

        Ok(vec![VatEvent::VatRuleDeactivated(VatRuleDeactivated {
            tenant_id: cmd.tenant_id,
            schedule_id: cmd.schedule_id,
            rule_id: cmd.rule_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn de() -> CountryCode {
        CountryCode::new("DE").unwrap()
    }

    fn apply_add(
        schedule: &mut VatSchedule,
        tenant_id: TenantId,
        scope: VatScope,
        rate: Decimal,
    ) -> Result<(), DomainError> {
        let cmd = AddVatRule {
            tenant_id,
            schedule_id: schedule.id_typed(),
            rule_id: Uuid::now_v7(),
            scope,
            rate,
            window: EffectiveWindow::unbounded(),
            occurred_at: Utc::now(),
        };
        let events = schedule.handle(&VatCommand::AddVatRule(cmd))?;
        for e in &events {
            schedule.apply(e);
        }
        Ok(())
    }

    #[test]
    fn category_rate_wins_over_country_rate() {
        let mut schedule = VatSchedule::empty(VatScheduleId::new(AggregateId::new()));
        let tenant_id = TenantId::new();
        let books = CategoryId::new();

        apply_add(
            &mut schedule,
            tenant_id,
            VatScope::CountryWide { country: de() },
            Decimal::new(19, 2),
        )
        .unwrap();
        apply_add(
            &mut schedule,
            tenant_id,
            VatScope::CategorySpecific {
                country: de(),
                category: books,
            },
            Decimal::new(7, 2),
        )
        .unwrap();

        assert_eq!(
            schedule
                .resolve(&de(), Some(books), d(2026, 5, 1), None)
                .unwrap(),
            Decimal::new(7, 2)
        );
        assert_eq!(
            schedule.resolve(&de(), None, d(2026, 5, 1), None).unwrap(),
            Decimal::new(19, 2)
        );
    }

    #[test]
    fn duplicate_country_rule_conflicts() {
        let mut schedule = VatSchedule::empty(VatScheduleId::new(AggregateId::new()));
        let tenant_id = TenantId::new();

        apply_add(
            &mut schedule,
            tenant_id,
            VatScope::CountryWide { country: de() },
            Decimal::new(19, 2),
        )
        .unwrap();
        let err = apply_add(
            &mut schedule,
            tenant_id,
            VatScope::CountryWide { country: de() },
            Decimal::new(20, 2),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::ConflictingRule(_)));
    }

    #[test]
    fn unknown_country_uses_default() {
        let schedule = VatSchedule::empty(VatScheduleId::new(AggregateId::new()));
        let fr = CountryCode::new("FR").unwrap();
        assert_eq!(
            schedule
                .resolve(&fr, None, d(2026, 5, 1), Some(Decimal::ZERO))
                .unwrap(),
            Decimal::ZERO
        );
        assert!(schedule.resolve(&fr, None, d(2026, 5, 1), None).is_err());
    }
}
