use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use marketpay_core::{
    Aggregate, AggregateId, AggregateRoot, Currency, DomainError, RoundingPolicy, StoreId,
    TenantId, ensure_rate,
};
use marketpay_events::Event;
use marketpay_settlement::{SettlementId, SettlementPeriod};

/// Commission invoice identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Human-facing invoice number: sequential and gap-free per tenant and
/// calendar year. Allocated by the engine's sequence counter at issue time,
/// never at creation, so cancelled drafts leave no holes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceNumber {
    pub year: i32,
    pub sequence: u32,
}

impl core::fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "INV-{}-{:06}", self.year, self.sequence)
    }
}

/// Invoice lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    Paid,
    Cancelled,
}

/// Aggregate root: CommissionInvoice.
///
/// The net amount is the commission total of the underlying settlement
/// statement; tax is applied on top at the configured rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionInvoice {
    id: InvoiceId,
    tenant_id: Option<TenantId>,
    store_id: Option<StoreId>,
    settlement_id: Option<SettlementId>,
    period: Option<SettlementPeriod>,
    currency: Option<Currency>,
    net_amount: i64,
    tax_rate: Decimal,
    tax_amount: i64,
    gross_amount: i64,
    status: InvoiceStatus,
    invoice_number: Option<InvoiceNumber>,
    issued_on: Option<NaiveDate>,
    due_on: Option<NaiveDate>,
    paid_on: Option<NaiveDate>,
    payment_reference: Option<String>,
    version: u64,
    created: bool,
}

impl CommissionInvoice {
    pub fn empty(id: InvoiceId) -> Self {
        Self {
            id,
            tenant_id: None,
            store_id: None,
            settlement_id: None,
            period: None,
            currency: None,
            net_amount: 0,
            tax_rate: Decimal::ZERO,
            tax_amount: 0,
            gross_amount: 0,
            status: InvoiceStatus::Draft,
            invoice_number: None,
            issued_on: None,
            due_on: None,
            paid_on: None,
            payment_reference: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn settlement_id(&self) -> Option<SettlementId> {
        self.settlement_id
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn net_amount(&self) -> i64 {
        self.net_amount
    }

    pub fn tax_amount(&self) -> i64 {
        self.tax_amount
    }

    pub fn gross_amount(&self) -> i64 {
        self.gross_amount
    }

    pub fn invoice_number(&self) -> Option<InvoiceNumber> {
        self.invoice_number
    }

    pub fn due_on(&self) -> Option<NaiveDate> {
        self.due_on
    }
}

impl AggregateRoot for CommissionInvoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateInvoice. `net_amount` is the approved settlement's
/// commission total; tax is computed here with the configured rounding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub store_id: StoreId,
    pub settlement_id: SettlementId,
    pub period: SettlementPeriod,
    pub currency: Currency,
    pub net_amount: i64,
    pub tax_rate: Decimal,
    pub rounding: RoundingPolicy,
    pub occurred_at: DateTime<Utc>,
}

/// Command: IssueInvoice. The number comes from the gap-free allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub invoice_number: InvoiceNumber,
    pub issued_on: NaiveDate,
    pub due_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkInvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkInvoicePaid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub paid_on: NaiveDate,
    pub payment_reference: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    CreateInvoice(CreateInvoice),
    IssueInvoice(IssueInvoice),
    MarkInvoicePaid(MarkInvoicePaid),
    CancelInvoice(CancelInvoice),
}

/// Event: InvoiceCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCreated {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub store_id: StoreId,
    pub settlement_id: SettlementId,
    pub period: SettlementPeriod,
    pub currency: Currency,
    pub net_amount: i64,
    pub tax_rate: Decimal,
    pub tax_amount: i64,
    pub gross_amount: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceIssued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceIssued {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub invoice_number: InvoiceNumber,
    pub issued_on: NaiveDate,
    pub due_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoicePaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePaid {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub paid_on: NaiveDate,
    pub payment_reference: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCancelled {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    InvoiceCreated(InvoiceCreated),
    InvoiceIssued(InvoiceIssued),
    InvoicePaid(InvoicePaid),
    InvoiceCancelled(InvoiceCancelled),
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::InvoiceCreated(_) => "invoicing.invoice.created",
            InvoiceEvent::InvoiceIssued(_) => "invoicing.invoice.issued",
            InvoiceEvent::InvoicePaid(_) => "invoicing.invoice.paid",
            InvoiceEvent::InvoiceCancelled(_) => "invoicing.invoice.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::InvoiceCreated(e) => e.occurred_at,
            InvoiceEvent::InvoiceIssued(e) => e.occurred_at,
            InvoiceEvent::InvoicePaid(e) => e.occurred_at,
            InvoiceEvent::InvoiceCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for CommissionInvoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::InvoiceCreated(e) => {
                self.id = e.invoice_id;
                self.tenant_id = Some(e.tenant_id);
                self.store_id = Some(e.store_id);
                self.settlement_id = Some(e.settlement_id);
                self.period = Some(e.period);
                self.currency = Some(e.currency.clone());
                self.net_amount = e.net_amount;
                self.tax_rate = e.tax_rate;
                self.tax_amount = e.tax_amount;
                self.gross_amount = e.gross_amount;
                self.status = InvoiceStatus::Draft;
                self.created = true;
            }
            InvoiceEvent::InvoiceIssued(e) => {
                self.status = InvoiceStatus::Issued;
                self.invoice_number = Some(e.invoice_number);
                self.issued_on = Some(e.issued_on);
                self.due_on = Some(e.due_on);
            }
            InvoiceEvent::InvoicePaid(e) => {
                self.status = InvoiceStatus::Paid;
                self.paid_on = Some(e.paid_on);
                self.payment_reference = Some(e.payment_reference.clone());
            }
            InvoiceEvent::InvoiceCancelled(_) => {
                self.status = InvoiceStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::CreateInvoice(cmd) => self.handle_create(cmd),
            InvoiceCommand::IssueInvoice(cmd) => self.handle_issue(cmd),
            InvoiceCommand::MarkInvoicePaid(cmd) => self.handle_paid(cmd),
            InvoiceCommand::CancelInvoice(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl CommissionInvoice {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists(format!(
                "invoice {} already exists",
                cmd.invoice_id
            )));
        }
        if cmd.net_amount <= 0 {
            return Err(DomainError::validation(
                "invoice net amount must be positive",
            ));
        }
        ensure_rate(cmd.tax_rate)?;

        let tax_amount = cmd.rounding.apply_rate(cmd.net_amount, cmd.tax_rate)?;
        let gross_amount = cmd
            .net_amount
            .checked_add(tax_amount)
            .ok_or_else(|| DomainError::invariant("invoice gross overflow"))?;

        Ok(vec![InvoiceEvent::InvoiceCreated(InvoiceCreated {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            store_id: cmd.store_id,
            settlement_id: cmd.settlement_id,
            period: cmd.period,
            currency: cmd.currency.clone(),
            net_amount: cmd.net_amount,
            tax_rate: cmd.tax_rate,
            tax_amount,
            gross_amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_issue(&self, cmd: &IssueInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.status != InvoiceStatus::Draft {
            return Err(DomainError::invalid_state(format!(
                "invoice is {:?}, only Draft can be issued",
                self.status
            )));
        }
        if cmd.due_on < cmd.issued_on {
            return Err(DomainError::validation("due date precedes issue date"));
        }

        Ok(vec![InvoiceEvent::InvoiceIssued(InvoiceIssued {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            invoice_number: cmd.invoice_number,
            issued_on: cmd.issued_on,
            due_on: cmd.due_on,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_paid(&self, cmd: &MarkInvoicePaid) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        if self.status != InvoiceStatus::Issued {
            return Err(DomainError::invalid_state(format!(
                "invoice is {:?}, only Issued can be paid",
                self.status
            )));
        }

        Ok(vec![InvoiceEvent::InvoicePaid(InvoicePaid {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            paid_on: cmd.paid_on,
            payment_reference: cmd.payment_reference.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        self.ensure_tenant(cmd.tenant_id)?;
        match self.status {
            InvoiceStatus::Draft | InvoiceStatus::Issued => {}
            InvoiceStatus::Paid => {
                return Err(DomainError::invalid_state(
                    "paid invoices cannot be cancelled; issue a credit note",
                ));
            }
            InvoiceStatus::Cancelled => {
                return Err(DomainError::invalid_state("invoice is already cancelled"));
            }
        }

        Ok(vec![InvoiceEvent::InvoiceCancelled(InvoiceCancelled {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
