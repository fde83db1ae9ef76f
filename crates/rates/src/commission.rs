use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use marketpay_core::money::ensure_rate;
use marketpay_core::{
    Aggregate, AggregateId, AggregateRoot, CategoryId, DomainError, StoreId, TenantId,
};
use marketpay_events::Event;

use crate::window::EffectiveWindow;

/// Commission schedule identifier (one schedule aggregate per tenant).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommissionScheduleId(pub AggregateId);

impl CommissionScheduleId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for CommissionScheduleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Rule scope. Resolution precedence is most specific first:
/// seller rule > category rule > global rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum CommissionScope {
    Global,
    Category(CategoryId),
    Seller(StoreId),
}

impl CommissionScope {
    /// True when two rules occupy the same scope slot and must therefore not
    /// have overlapping effective windows.
    fn same_slot(&self, other: &CommissionScope) -> bool {
        self == other
    }
}

/// A scoped, time-bounded commission rate rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRule {
    pub rule_id: Uuid,
    pub scope: CommissionScope,
    /// Fractional rate, e.g. 0.10 for 10%.
    pub rate: Decimal,
    pub window: EffectiveWindow,
    pub is_active: bool,
}

impl CommissionRule {
    fn is_active_on(&self, date: NaiveDate) -> bool {
        self.is_active && self.window.contains(date)
    }
}

/// Aggregate root: the tenant's commission rule set.
///
/// Write-side invariant: no two active rules of the same scope may have
/// overlapping effective windows — conflicts are rejected at create/update
/// time (`ConflictingRule`), never resolved silently at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionSchedule {
    id: CommissionScheduleId,
    tenant_id: Option<TenantId>,
    rules: Vec<CommissionRule>,
    version: u64,
    created: bool,
}

impl CommissionSchedule {
    /// Empty aggregate for rehydration.
    pub fn empty(id: CommissionScheduleId) -> Self {
        Self {
            id,
            tenant_id: None,
            rules: Vec::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> CommissionScheduleId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn rules(&self) -> &[CommissionRule] {
        &self.rules
    }

    /// Resolve the applicable commission rate for a (store, category, date)
    /// triple, walking scopes most specific first and falling back to the
    /// caller-supplied default.
    pub fn resolve(
        &self,
        store_id: StoreId,
        category_id: Option<CategoryId>,
        as_of: NaiveDate,
        default: Option<Decimal>,
    ) -> Result<Decimal, DomainError> {
        let matches = |scope: &CommissionScope| match scope {
            CommissionScope::Seller(s) => *s == store_id,
            CommissionScope::Category(c) => Some(*c) == category_id,
            CommissionScope::Global => true,
        };

        // Explicit precedence walk rather than a single scored scan.
        for wanted in [
            |s: &CommissionScope| matches!(s, CommissionScope::Seller(_)),
            |s: &CommissionScope| matches!(s, CommissionScope::Category(_)),
            |s: &CommissionScope| matches!(s, CommissionScope::Global),
        ] {
            if let Some(rule) = self
                .rules
                .iter()
                .find(|r| r.is_active_on(as_of) && wanted(&r.scope) && matches(&r.scope))
            {
                return Ok(rule.rate);
            }
        }

        default.ok_or(DomainError::NotFound)
    }

    fn find_conflict(
        &self,
        scope: &CommissionScope,
        window: &EffectiveWindow,
        exclude: Option<Uuid>,
    ) -> Option<&CommissionRule> {
        self.rules.iter().find(|r| {
            r.is_active
                && Some(r.rule_id) != exclude
                && r.scope.same_slot(scope)
                && r.window.overlaps(window)
        })
    }
}

impl AggregateRoot for CommissionSchedule {
    type Id = CommissionScheduleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: AddCommissionRule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddCommissionRule {
    pub tenant_id: TenantId,
    pub schedule_id: CommissionScheduleId,
    pub rule_id: Uuid,
    pub scope: CommissionScope,
    pub rate: Decimal,
    pub window: EffectiveWindow,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateCommissionRule (rate and/or window of an existing rule).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCommissionRule {
    pub tenant_id: TenantId,
    pub schedule_id: CommissionScheduleId,
    pub rule_id: Uuid,
    pub rate: Decimal,
    pub window: EffectiveWindow,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeactivateCommissionRule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateCommissionRule {
    pub tenant_id: TenantId,
    pub schedule_id: CommissionScheduleId,
    pub rule_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionCommand {
    AddCommissionRule(AddCommissionRule),
    UpdateCommissionRule(UpdateCommissionRule),
    DeactivateCommissionRule(DeactivateCommissionRule),
}

/// Event: CommissionRuleAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRuleAdded {
    pub tenant_id: TenantId,
    pub schedule_id: CommissionScheduleId,
    pub rule_id: Uuid,
    pub scope: CommissionScope,
    pub rate: Decimal,
    pub window: EffectiveWindow,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CommissionRuleUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRuleUpdated {
    pub tenant_id: TenantId,
    pub schedule_id: CommissionScheduleId,
    pub rule_id: Uuid,
    pub rate: Decimal,
    pub window: EffectiveWindow,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CommissionRuleDeactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRuleDeactivated {
    pub tenant_id: TenantId,
    pub schedule_id: CommissionScheduleId,
    pub rule_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionEvent {
    CommissionRuleAdded(CommissionRuleAdded),
    CommissionRuleUpdated(CommissionRuleUpdated),
    CommissionRuleDeactivated(CommissionRuleDeactivated),
}

impl Event for CommissionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CommissionEvent::CommissionRuleAdded(_) => "rates.commission.rule_added",
            CommissionEvent::CommissionRuleUpdated(_) => "rates.commission.rule_updated",
            CommissionEvent::CommissionRuleDeactivated(_) => "rates.commission.rule_deactivated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CommissionEvent::CommissionRuleAdded(e) => e.occurred_at,
            CommissionEvent::CommissionRuleUpdated(e) => e.occurred_at,
            CommissionEvent::CommissionRuleDeactivated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for CommissionSchedule {
    type Command = CommissionCommand;
    type Event = CommissionEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CommissionEvent::CommissionRuleAdded(e) => {
                self.id = e.schedule_id;
                if self.tenant_id.is_none() {
                    self.tenant_id = Some(e.tenant_id);
                    self.created = true;
                }
                self.rules.push(CommissionRule {
                    rule_id: e.rule_id,
                    scope: e.scope,
                    rate: e.rate,
                    window: e.window,
                    is_active: true,
                });
            }
            CommissionEvent::CommissionRuleUpdated(e) => {
                if let Some(rule) = self.rules.iter_mut().find(|r| r.rule_id == e.rule_id) {
                    rule.rate = e.rate;
                    rule.window = e.window;
                }
            }
            CommissionEvent::CommissionRuleDeactivated(e) => {
                if let Some(rule) = self.rules.iter_mut().find(|r| r.rule_id == e.rule_id) {
                    rule.is_active = false;
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CommissionCommand::AddCommissionRule(cmd) => self.handle_add(cmd),
            CommissionCommand::UpdateCommissionRule(cmd) => self.handle_update(cmd),
            CommissionCommand::DeactivateCommissionRule(cmd) => self.handle_deactivate(cmd),
        }
    }
}

impl CommissionSchedule {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_rule_shape(rate: Decimal, window: &EffectiveWindow) -> Result<(), DomainError> {
        ensure_rate(rate)?;
        if !window.is_ordered() {
            return Err(DomainError::validation(
                "effective window must have from <= to",
            ));
        }
        Ok(())
    }

    fn handle_add(&self, cmd: &AddCommissionRule) -> Result<Vec<CommissionEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        Self::ensure_rule_shape(cmd.rate, &cmd.window)?;

        if self.rules.iter().any(|r| r.rule_id == cmd.rule_id) {
            return Err(DomainError::already_exists(format!(
                "commission rule {} already exists",
                cmd.rule_id
            )));
        }

        if let Some(conflict) = self.find_conflict(&cmd.scope, &cmd.window, None) {
            return Err(DomainError::conflicting_rule(format!(
                "scope {:?} already covered by rule {} in an overlapping window",
                cmd.scope, conflict.rule_id
            )));
        }

        Ok(vec![CommissionEvent::CommissionRuleAdded(
            CommissionRuleAdded {
                tenant_id: cmd.tenant_id,
                schedule_id: cmd.schedule_id,
                rule_id: cmd.rule_id,
                scope: cmd.scope,
                rate: cmd.rate,
                window: cmd.window,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_update(
        &self,
        cmd: &UpdateCommissionRule,
    ) -> Result<Vec<CommissionEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        Self::ensure_rule_shape(cmd.rate, &cmd.window)?;

        let existing = self
            .rules
            .iter()
            .find(|r| r.rule_id == cmd.rule_id)
            .ok_or(DomainError::NotFound)?;

        if let Some(conflict) = self.find_conflict(&existing.scope, &cmd.window, Some(cmd.rule_id))
        {
            return Err(DomainError::conflicting_rule(format!(
                "scope {:?} already covered by rule {} in an overlapping window",
                existing.scope, conflict.rule_id
            )));
        }

        Ok(vec![CommissionEvent::CommissionRuleUpdated(
            CommissionRuleUpdated {
                tenant_id: cmd.tenant_id,
                schedule_id: cmd.schedule_id,
                rule_id: cmd.rule_id,
                rate: cmd.rate,
                window: cmd.window,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_deactivate(
        &self,
        cmd: &DeactivateCommissionRule,
    ) -> Result<Vec<CommissionEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;

        let existing = self
            .rules
            .iter()
            .find(|r| r.rule_id == cmd.rule_id)
            .ok_or(DomainError::NotFound)?;

        if !existing.is_active {
            // Idempotent: deactivating an inactive rule is a no-op.
            return Ok(vec![]);
        }

        Ok(vec![CommissionEvent::CommissionRuleDeactivated(
            CommissionRuleDeactivated {
                tenant_id: cmd.tenant_id,
                schedule_id: cmd.schedule_id,
                rule_id: cmd.rule_id,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}
