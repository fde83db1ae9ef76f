use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{
    Aggregate, AggregateId, AggregateRoot, Currency, DomainError, OrderId, ShipmentId, StoreId,
    TenantId, UserId,
};
use marketpay_events::Event;

/// Settlement statement identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementId(pub AggregateId);

impl SettlementId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for SettlementId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Closed, inclusive settlement period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SettlementPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SettlementPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DomainError> {
        if end < start {
            return Err(DomainError::validation("period end precedes period start"));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// True when the two periods share at least one day.
    pub fn overlaps(&self, other: &SettlementPeriod) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl core::fmt::Display for SettlementPeriod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Statement lifecycle. Exactly one live (non-superseded) statement exists
/// per (store, period); regeneration supersedes and bumps `version_no`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Draft,
    Finalized,
    Approved,
    Exported,
}

/// One settled shipment: the released allocation's money columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementItem {
    pub shipment_id: ShipmentId,
    pub order_id: OrderId,
    /// Seller gross in minor units (item price portion).
    pub gross_amount: i64,
    pub shipping_amount: i64,
    pub commission_amount: i64,
    /// Seller-portion refunds already taken out of escrow.
    pub refunded_amount: i64,
    /// Commission reversed pro rata on the refunded slice.
    pub refunded_commission: i64,
}

impl SettlementItem {
    fn validate(&self) -> Result<(), DomainError> {
        if self.gross_amount < 0
            || self.shipping_amount < 0
            || self.commission_amount < 0
            || self.refunded_amount < 0
            || self.refunded_commission < 0
        {
            return Err(DomainError::validation(
                "settlement item amounts must be non-negative",
            ));
        }
        Ok(())
    }
}

/// A signed correction applied to this statement, typically carrying over
/// a post-finalization discrepancy from an earlier period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAdjustment {
    pub adjustment_id: AggregateId,
    /// Signed minor units: positive credits the seller, negative debits.
    pub amount: i64,
    pub reason: String,
    /// The period the adjustment corrects, when it is a carry-over.
    pub corrects_period: Option<SettlementPeriod>,
}

/// Checked column totals for a statement.
///
/// `net = gross + shipping - commission - refunds + refunded_commission
/// + adjustments`. Reversed commission is credited back to the seller
/// here because commission is only charged on goods that stay sold; the
/// commission invoice subtracts the same `refunded_commission` from its
/// net, so the two documents stay symmetric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTotals {
    pub gross: i64,
    pub shipping: i64,
    pub commission: i64,
    pub refunds: i64,
    pub refunded_commission: i64,
    pub adjustments: i64,
    pub net: i64,
}

impl SettlementTotals {
    pub fn compute(
        items: &[SettlementItem],
        adjustments: &[SettlementAdjustment],
    ) -> Result<Self, DomainError> {
        let overflow = || DomainError::invariant("settlement totals overflow");

        let mut totals = SettlementTotals::default();
        for item in items {
            totals.gross = totals
                .gross
                .checked_add(item.gross_amount)
                .ok_or_else(overflow)?;
            totals.shipping = totals
                .shipping
                .checked_add(item.shipping_amount)
                .ok_or_else(overflow)?;
            totals.commission = totals
                .commission
                .checked_add(item.commission_amount)
                .ok_or_else(overflow)?;
            totals.refunds = totals
                .refunds
                .checked_add(item.refunded_amount)
                .ok_or_else(overflow)?;
            totals.refunded_commission = totals
                .refunded_commission
                .checked_add(item.refunded_commission)
                .ok_or_else(overflow)?;
        }
        for adjustment in adjustments {
            totals.adjustments = totals
                .adjustments
                .checked_add(adjustment.amount)
                .ok_or_else(overflow)?;
        }

        totals.net = totals
            .gross
            .checked_add(totals.shipping)
            .and_then(|n| n.checked_sub(totals.commission))
            .and_then(|n| n.checked_sub(totals.refunds))
            .and_then(|n| n.checked_add(totals.refunded_commission))
            .and_then(|n| n.checked_add(totals.adjustments))
            .ok_or_else(overflow)?;

        Ok(totals)
    }
}

/// Aggregate root: Settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    id: SettlementId,
    tenant_id: Option<TenantId>,
    store_id: Option<StoreId>,
    period: Option<SettlementPeriod>,
    /// 1-based regeneration counter for this (store, period).
    version_no: u32,
    currency: Option<Currency>,
    status: SettlementStatus,
    superseded: bool,
    superseded_by: Option<SettlementId>,
    items: Vec<SettlementItem>,
    adjustments: Vec<SettlementAdjustment>,
    totals: SettlementTotals,
    export_reference: Option<String>,
    version: u64,
    created: bool,
}

impl Settlement {
    pub fn empty(id: SettlementId) -> Self {
        Self {
            id,
            tenant_id: None,
            store_id: None,
            period: None,
            version_no: 0,
            currency: None,
            status: SettlementStatus::Draft,
            superseded: false,
            superseded_by: None,
            items: Vec::new(),
            adjustments: Vec::new(),
            totals: SettlementTotals::default(),
            export_reference: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SettlementId {
        self.id
    }

    pub fn store_id(&self) -> Option<StoreId> {
        self.store_id
    }

    pub fn period(&self) -> Option<SettlementPeriod> {
        self.period
    }

    pub fn version_no(&self) -> u32 {
        self.version_no
    }

    pub fn status(&self) -> SettlementStatus {
        self.status
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded
    }

    pub fn items(&self) -> &[SettlementItem] {
        &self.items
    }

    pub fn adjustments(&self) -> &[SettlementAdjustment] {
        &self.adjustments
    }

    pub fn totals(&self) -> SettlementTotals {
        self.totals
    }

    pub fn net_amount(&self) -> i64 {
        self.totals.net
    }

    pub fn commission_total(&self) -> i64 {
        self.totals.commission
    }

    pub fn export_reference(&self) -> Option<&str> {
        self.export_reference.as_deref()
    }
}

impl AggregateRoot for Settlement {
    type Id = SettlementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: GenerateSettlement. Items and adjustments are assembled by the
/// engine from released escrow allocations and the carry-over registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateSettlement {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub store_id: StoreId,
    pub period: SettlementPeriod,
    pub version_no: u32,
    pub currency: Currency,
    pub items: Vec<SettlementItem>,
    pub adjustments: Vec<SettlementAdjustment>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddAdjustment (Draft only; finalized statements are immutable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAdjustment {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub adjustment: SettlementAdjustment,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FinalizeSettlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeSettlement {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveSettlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveSettlement {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkExported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkExported {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub export_reference: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SupersedeSettlement — issued against the OLD statement when a
/// period is regenerated. Only unapproved statements may be superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupersedeSettlement {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub superseded_by: SettlementId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementCommand {
    GenerateSettlement(GenerateSettlement),
    AddAdjustment(AddAdjustment),
    FinalizeSettlement(FinalizeSettlement),
    ApproveSettlement(ApproveSettlement),
    MarkExported(MarkExported),
    SupersedeSettlement(SupersedeSettlement),
}

/// Event: SettlementGenerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementGenerated {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub store_id: StoreId,
    pub period: SettlementPeriod,
    pub version_no: u32,
    pub currency: Currency,
    pub items: Vec<SettlementItem>,
    pub adjustments: Vec<SettlementAdjustment>,
    pub totals: SettlementTotals,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SettlementAdjustmentAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementAdjustmentAdded {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub adjustment: SettlementAdjustment,
    pub totals: SettlementTotals,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SettlementFinalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementFinalized {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub totals: SettlementTotals,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SettlementApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementApproved {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub approved_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SettlementExported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementExported {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub export_reference: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: SettlementSuperseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSuperseded {
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub superseded_by: SettlementId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementEvent {
    SettlementGenerated(SettlementGenerated),
    SettlementAdjustmentAdded(SettlementAdjustmentAdded),
    SettlementFinalized(SettlementFinalized),
    SettlementApproved(SettlementApproved),
    SettlementExported(SettlementExported),
    SettlementSuperseded(SettlementSuperseded),
}

impl Event for SettlementEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SettlementEvent::SettlementGenerated(_) => "settlement.statement.generated",
            SettlementEvent::SettlementAdjustmentAdded(_) => {
                "settlement.statement.adjustment_added"
            }
            SettlementEvent::SettlementFinalized(_) => "settlement.statement.finalized",
            SettlementEvent::SettlementApproved(_) => "settlement.statement.approved",
            SettlementEvent::SettlementExported(_) => "settlement.statement.exported",
            SettlementEvent::SettlementSuperseded(_) => "settlement.statement.superseded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SettlementEvent::SettlementGenerated(e) => e.occurred_at,
            SettlementEvent::SettlementAdjustmentAdded(e) => e.occurred_at,
            SettlementEvent::SettlementFinalized(e) => e.occurred_at,
            SettlementEvent::SettlementApproved(e) => e.occurred_at,
            SettlementEvent::SettlementExported(e) => e.occurred_at,
            SettlementEvent::SettlementSuperseded(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Settlement {
    type Command = SettlementCommand;
    type Event = SettlementEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SettlementEvent::SettlementGenerated(e) => {
                self.id = e.settlement_id;
                self.tenant_id = Some(e.tenant_id);
                self.store_id = Some(e.store_id);
                self.period = Some(e.period);
                self.version_no = e.version_no;
                self.currency = Some(e.currency.clone());
                self.status = SettlementStatus::Draft;
                self.items = e.items.clone();
                self.adjustments = e.adjustments.clone();
                self.totals = e.totals;
                self.created = true;
            }
            SettlementEvent::SettlementAdjustmentAdded(e) => {
                self.adjustments.push(e.adjustment.clone());
                self.totals = e.totals;
            }
            SettlementEvent::SettlementFinalized(e) => {
                self.status = SettlementStatus::Finalized;
                self.totals = e.totals;
            }
            SettlementEvent::SettlementApproved(_) => {
                self.status = SettlementStatus::Approved;
            }
            SettlementEvent::SettlementExported(e) => {
                self.status = SettlementStatus::Exported;
                self.export_reference = Some(e.export_reference.clone());
            }
            SettlementEvent::SettlementSuperseded(e) => {
                self.superseded = true;
                self.superseded_by = Some(e.superseded_by);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SettlementCommand::GenerateSettlement(cmd) => self.handle_generate(cmd),
            SettlementCommand::AddAdjustment(cmd) => self.handle_add_adjustment(cmd),
            SettlementCommand::FinalizeSettlement(cmd) => self.handle_finalize(cmd),
            SettlementCommand::ApproveSettlement(cmd) => self.handle_approve(cmd),
            SettlementCommand::MarkExported(cmd) => self.handle_export(cmd),
            SettlementCommand::SupersedeSettlement(cmd) => self.handle_supersede(cmd),
        }
    }
}

impl Settlement {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), DomainError> {
        if self.superseded {
            return Err(DomainError::invalid_state(
                "statement has been superseded by a newer version",
            ));
        }
        Ok(())
    }

    fn handle_generate(&self, cmd: &GenerateSettlement) -> Result<Vec<SettlementEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists(format!(
                "settlement {} already exists",
                cmd.settlement_id
            )));
        }
        if cmd.version_no == 0 {
            return Err(DomainError::validation("version_no starts at 1"));
        }
        if cmd.period.end < cmd.period.start {
            return Err(DomainError::validation("period end precedes period start"));
        }
        if cmd.items.is_empty() && cmd.adjustments.is_empty() {
            return Err(DomainError::validation(
                "statement needs at least one item or adjustment",
            ));
        }
        for item in &cmd.items {
            item.validate()?;
        }

        let totals = SettlementTotals::compute(&cmd.items, &cmd.adjustments)?;

        Ok(vec![SettlementEvent::SettlementGenerated(
            SettlementGenerated {
                tenant_id: cmd.tenant_id,
                settlement_id: cmd.settlement_id,
                store_id: cmd.store_id,
                period: cmd.period,
                version_no: cmd.version_no,
                currency: cmd.currency.clone(),
                items: cmd.items.clone(),
                adjustments: cmd.adjustments.clone(),
                totals,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_add_adjustment(&self, cmd: &AddAdjustment) -> Result<Vec<SettlementEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_live()?;
        if self.status != SettlementStatus::Draft {
            return Err(DomainError::invalid_state(
                "finalized statements are immutable; corrections go to the next period",
            ));
        }
        if cmd.adjustment.amount == 0 {
            return Err(DomainError::validation("adjustment amount cannot be zero"));
        }

        let mut adjustments = self.adjustments.clone();
        adjustments.push(cmd.adjustment.clone());
        let totals = SettlementTotals::compute(&self.items, &adjustments)?;

        Ok(vec![SettlementEvent::SettlementAdjustmentAdded(
            SettlementAdjustmentAdded {
                tenant_id: cmd.tenant_id,
                settlement_id: cmd.settlement_id,
                adjustment: cmd.adjustment.clone(),
                totals,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_finalize(&self, cmd: &FinalizeSettlement) -> Result<Vec<SettlementEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_live()?;
        if self.status != SettlementStatus::Draft {
            return Err(DomainError::invalid_state(format!(
                "statement is {:?}, only Draft can be finalized",
                self.status
            )));
        }

        Ok(vec![SettlementEvent::SettlementFinalized(
            SettlementFinalized {
                tenant_id: cmd.tenant_id,
                settlement_id: cmd.settlement_id,
                totals: self.totals,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_approve(&self, cmd: &ApproveSettlement) -> Result<Vec<SettlementEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_live()?;
        if self.status != SettlementStatus::Finalized {
            return Err(DomainError::invalid_state(format!(
                "statement is {:?}, only Finalized can be approved",
                self.status
            )));
        }

        Ok(vec![SettlementEvent::SettlementApproved(
            SettlementApproved {
                tenant_id: cmd.tenant_id,
                settlement_id: cmd.settlement_id,
                approved_by: cmd.approved_by,
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_export(&self, cmd: &MarkExported) -> Result<Vec<SettlementEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_live()?;
        if self.status != SettlementStatus::Approved {
            return Err(DomainError::invalid_state(format!(
                "statement is {:?}, only Approved can be exported",
                self.status
            )));
        }
        if cmd.export_reference.is_empty() {
            return Err(DomainError::validation("export reference is required"));
        }

        Ok(vec![SettlementEvent::SettlementExported(
            SettlementExported {
                tenant_id: cmd.tenant_id,
                settlement_id: cmd.settlement_id,
                export_reference: cmd.export_reference.clone(),
                occurred_at: cmd.occurred_at,
            },
        )])
    }

    fn handle_supersede(&self, cmd: &SupersedeSettlement) -> Result<Vec<SettlementEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.superseded {
            // Idempotent: superseding twice is a no-op.
            return Ok(Vec::new());
        }
        if matches!(
            self.status,
            SettlementStatus::Approved | SettlementStatus::Exported
        ) {
            return Err(DomainError::invalid_state(
                "approved statements cannot be regenerated",
            ));
        }

        Ok(vec![SettlementEvent::SettlementSuperseded(
            SettlementSuperseded {
                tenant_id: cmd.tenant_id,
                settlement_id: cmd.settlement_id,
                superseded_by: cmd.superseded_by,
                occurred_at: cmd.occurred_at,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn period() -> SettlementPeriod {
        SettlementPeriod {
            start: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        }
    }

    fn item(gross: i64, shipping: i64, commission: i64, refunded: i64) -> SettlementItem {
        SettlementItem {
            shipment_id: ShipmentId::new(),
            order_id: OrderId::new(),
            gross_amount: gross,
            shipping_amount: shipping,
            commission_amount: commission,
            refunded_amount: refunded,
            refunded_commission: 0,
        }
    }

    fn generate_cmd(items: Vec<SettlementItem>) -> GenerateSettlement {
        GenerateSettlement {
            tenant_id: TenantId::new(),
            settlement_id: SettlementId::new(AggregateId::new()),
            store_id: StoreId::new(),
            period: period(),
            version_no: 1,
            currency: Currency::usd(),
            items,
            adjustments: Vec::new(),
            occurred_at: Utc::now(),
        }
    }

    fn run(settlement: &mut Settlement, cmd: SettlementCommand) -> Result<(), DomainError> {
        let events = settlement.handle(&cmd)?;
        for e in &events {
            settlement.apply(e);
        }
        Ok(())
    }

    #[test]
    fn generate_computes_net_from_columns() {
        let cmd = generate_cmd(vec![item(8_000, 2_000, 800, 0), item(5_000, 500, 750, 1_000)]);
        let mut settlement = Settlement::empty(cmd.settlement_id);
        run(&mut settlement, SettlementCommand::GenerateSettlement(cmd)).unwrap();

        let totals = settlement.totals();
        assert_eq!(totals.gross, 13_000);
        assert_eq!(totals.shipping, 2_500);
        assert_eq!(totals.commission, 1_550);
        assert_eq!(totals.refunds, 1_000);
        // 13000 + 2500 - 1550 - 1000
        assert_eq!(totals.net, 12_950);
    }

    #[test]
    fn reversed_commission_is_credited_back_to_net() {
        let mut refunded_item = item(8_000, 2_000, 800, 3_000);
        refunded_item.refunded_commission = 300;
        let totals = SettlementTotals::compute(&[refunded_item], &[]).unwrap();
        // 8000 + 2000 - 800 - 3000 + 300
        assert_eq!(totals.net, 6_500);
    }

    #[test]
    fn adjacent_periods_do_not_overlap() {
        let march = period();
        let april = SettlementPeriod::new(
            NaiveDate::from_ymd_opt(2026, 4, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 4, 30).unwrap(),
        )
        .unwrap();
        assert!(!march.overlaps(&april));

        let straddling = SettlementPeriod::new(
            NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
            NaiveDate::from_ymd_opt(2026, 4, 15).unwrap(),
        )
        .unwrap();
        assert!(march.overlaps(&straddling));
        assert!(straddling.overlaps(&march));
    }

    #[test]
    fn adjustments_shift_net_and_are_draft_only() {
        let cmd = generate_cmd(vec![item(10_000, 0, 1_000, 0)]);
        let tenant_id = cmd.tenant_id;
        let settlement_id = cmd.settlement_id;
        let mut settlement = Settlement::empty(settlement_id);
        run(&mut settlement, SettlementCommand::GenerateSettlement(cmd)).unwrap();

        let adjustment = SettlementAdjustment {
            adjustment_id: AggregateId::new(),
            amount: -250,
            reason: "chargeback fee from prior period".to_string(),
            corrects_period: Some(SettlementPeriod {
                start: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
                end: NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
            }),
        };
        run(
            &mut settlement,
            SettlementCommand::AddAdjustment(AddAdjustment {
                tenant_id,
                settlement_id,
                adjustment: adjustment.clone(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert_eq!(settlement.net_amount(), 8_750);

        run(
            &mut settlement,
            SettlementCommand::FinalizeSettlement(FinalizeSettlement {
                tenant_id,
                settlement_id,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();

        let err = settlement
            .handle(&SettlementCommand::AddAdjustment(AddAdjustment {
                tenant_id,
                settlement_id,
                adjustment,
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn lifecycle_enforces_draft_finalized_approved_exported() {
        let cmd = generate_cmd(vec![item(10_000, 0, 1_000, 0)]);
        let tenant_id = cmd.tenant_id;
        let settlement_id = cmd.settlement_id;
        let mut settlement = Settlement::empty(settlement_id);
        run(&mut settlement, SettlementCommand::GenerateSettlement(cmd)).unwrap();

        // Cannot approve or export out of order.
        assert!(settlement
            .handle(&SettlementCommand::ApproveSettlement(ApproveSettlement {
                tenant_id,
                settlement_id,
                approved_by: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .is_err());

        run(
            &mut settlement,
            SettlementCommand::FinalizeSettlement(FinalizeSettlement {
                tenant_id,
                settlement_id,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        run(
            &mut settlement,
            SettlementCommand::ApproveSettlement(ApproveSettlement {
                tenant_id,
                settlement_id,
                approved_by: UserId::new(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        run(
            &mut settlement,
            SettlementCommand::MarkExported(MarkExported {
                tenant_id,
                settlement_id,
                export_reference: "export-2026-03".to_string(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        assert_eq!(settlement.status(), SettlementStatus::Exported);
        assert_eq!(settlement.export_reference(), Some("export-2026-03"));
    }

    #[test]
    fn approved_statements_cannot_be_superseded() {
        let cmd = generate_cmd(vec![item(10_000, 0, 1_000, 0)]);
        let tenant_id = cmd.tenant_id;
        let settlement_id = cmd.settlement_id;
        let mut settlement = Settlement::empty(settlement_id);
        run(&mut settlement, SettlementCommand::GenerateSettlement(cmd)).unwrap();
        run(
            &mut settlement,
            SettlementCommand::FinalizeSettlement(FinalizeSettlement {
                tenant_id,
                settlement_id,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        run(
            &mut settlement,
            SettlementCommand::ApproveSettlement(ApproveSettlement {
                tenant_id,
                settlement_id,
                approved_by: UserId::new(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();

        let err = settlement
            .handle(&SettlementCommand::SupersedeSettlement(SupersedeSettlement {
                tenant_id,
                settlement_id,
                superseded_by: SettlementId::new(AggregateId::new()),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn superseding_a_draft_is_allowed_and_idempotent() {
        let cmd = generate_cmd(vec![item(10_000, 0, 1_000, 0)]);
        let tenant_id = cmd.tenant_id;
        let settlement_id = cmd.settlement_id;
        let mut settlement = Settlement::empty(settlement_id);
        run(&mut settlement, SettlementCommand::GenerateSettlement(cmd)).unwrap();

        let supersede = SupersedeSettlement {
            tenant_id,
            settlement_id,
            superseded_by: SettlementId::new(AggregateId::new()),
            occurred_at: Utc::now(),
        };
        run(
            &mut settlement,
            SettlementCommand::SupersedeSettlement(supersede.clone()),
        )
        .unwrap();
        assert!(settlement.is_superseded());

        let events = settlement
            .handle(&SettlementCommand::SupersedeSettlement(supersede))
            .unwrap();
        assert!(events.is_empty());

        // A superseded statement rejects further lifecycle commands.
        assert!(settlement
            .handle(&SettlementCommand::FinalizeSettlement(FinalizeSettlement {
                tenant_id,
                settlement_id,
                occurred_at: Utc::now(),
            }))
            .is_err());
    }

    #[test]
    fn empty_statement_is_rejected() {
        let cmd = generate_cmd(Vec::new());
        let settlement = Settlement::empty(cmd.settlement_id);
        let err = settlement
            .handle(&SettlementCommand::GenerateSettlement(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    proptest! {
        #[test]
        fn net_equals_column_identity(
            gross in 0i64..1_000_000,
            shipping in 0i64..100_000,
            commission in 0i64..100_000,
            refunded in 0i64..100_000,
            adjustment in -50_000i64..50_000,
        ) {
            let items = vec![item(gross, shipping, commission, refunded)];
            let adjustments = if adjustment == 0 {
                Vec::new()
            } else {
                vec![SettlementAdjustment {
                    adjustment_id: AggregateId::new(),
                    amount: adjustment,
                    reason: "correction".to_string(),
                    corrects_period: None,
                }]
            };
            let totals = SettlementTotals::compute(&items, &adjustments).unwrap();
            prop_assert_eq!(
                totals.net,
                gross + shipping - commission - refunded + totals.adjustments
            );
        }
    }
}
