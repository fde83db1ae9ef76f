use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use marketpay_core::{
    Aggregate, AggregateId, AggregateRoot, Currency, DomainError, RoundingPolicy, StoreId,
    TenantId, ensure_rate,
};
use marketpay_events::Event;

use crate::invoice::{InvoiceId, InvoiceNumber};

/// Credit note identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CreditNoteId(pub AggregateId);

impl CreditNoteId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for CreditNoteId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Why the credit note exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteKind {
    /// Reverses the invoice in full (e.g. the whole order was refunded).
    Full,
    /// Reverses the commission on a refunded slice.
    Partial,
    /// Fixes a billing error unrelated to a refund.
    Correction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditNoteStatus {
    Draft,
    Issued,
}

/// Aggregate root: CreditNote. Issued invoices are never edited; any
/// post-issue commission reversal is represented by one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditNote {
    id: CreditNoteId,
    tenant_id: Option<TenantId>,
    invoice_id: Option<InvoiceId>,
    store_id: Option<StoreId>,
    kind: CreditNoteKind,
    currency: Option<Currency>,
    net_amount: i64,
    tax_amount: i64,
    gross_amount: i64,
    reason: String,
    refund_reference: Option<String>,
    status: CreditNoteStatus,
    note_number: Option<InvoiceNumber>,
    issued_on: Option<NaiveDate>,
    version: u64,
    created: bool,
}

impl CreditNote {
    pub fn empty(id: CreditNoteId) -> Self {
        Self {
            id,
            tenant_id: None,
            invoice_id: None,
            store_id: None,
            kind: CreditNoteKind::Correction,
            currency: None,
            net_amount: 0,
            tax_amount: 0,
            gross_amount: 0,
            reason: String::new(),
            refund_reference: None,
            status: CreditNoteStatus::Draft,
            note_number: None,
            issued_on: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> CreditNoteId {
        self.id
    }

    pub fn invoice_id(&self) -> Option<InvoiceId> {
        self.invoice_id
    }

    pub fn kind(&self) -> CreditNoteKind {
        self.kind
    }

    pub fn status(&self) -> CreditNoteStatus {
        self.status
    }

    pub fn net_amount(&self) -> i64 {
        self.net_amount
    }

    pub fn gross_amount(&self) -> i64 {
        self.gross_amount
    }
}

impl AggregateRoot for CreditNote {
    type Id = CreditNoteId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateCreditNote. `net_amount` is the commission being
/// reversed; tax mirrors the invoice's rate so the credited gross matches
/// what was billed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCreditNote {
    pub tenant_id: TenantId,
    pub note_id: CreditNoteId,
    pub invoice_id: InvoiceId,
    pub store_id: StoreId,
    pub kind: CreditNoteKind,
    pub currency: Currency,
    pub net_amount: i64,
    pub tax_rate: Decimal,
    pub rounding: RoundingPolicy,
    pub reason: String,
    pub refund_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: IssueCreditNote. Numbers come from the same gap-free
/// per-tenant-year allocator as invoices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCreditNote {
    pub tenant_id: TenantId,
    pub note_id: CreditNoteId,
    pub note_number: InvoiceNumber,
    pub issued_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditNoteCommand {
    CreateCreditNote(CreateCreditNote),
    IssueCreditNote(IssueCreditNote),
}

/// Event: CreditNoteCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditNoteCreated {
    pub tenant_id: TenantId,
    pub note_id: CreditNoteId,
    pub invoice_id: InvoiceId,
    pub store_id: StoreId,
    pub kind: CreditNoteKind,
    pub currency: Currency,
    pub net_amount: i64,
    pub tax_amount: i64,
    pub gross_amount: i64,
    pub reason: String,
    pub refund_reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CreditNoteIssued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditNoteIssued {
    pub tenant_id: TenantId,
    pub note_id: CreditNoteId,
    pub note_number: InvoiceNumber,
    pub issued_on: NaiveDate,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditNoteEvent {
    CreditNoteCreated(CreditNoteCreated),
    CreditNoteIssued(CreditNoteIssued),
}

impl Event for CreditNoteEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CreditNoteEvent::CreditNoteCreated(_) => "invoicing.credit_note.created",
            CreditNoteEvent::CreditNoteIssued(_) => "invoicing.credit_note.issued",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CreditNoteEvent::CreditNoteCreated(e) => e.occurred_at,
            CreditNoteEvent::CreditNoteIssued(e) => e.occurred_at,
        }
    }
}

impl Aggregate for CreditNote {
    type Command = CreditNoteCommand;
    type Event = CreditNoteEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CreditNoteEvent::CreditNoteCreated(e) => {
                self.id = e.note_id;
                self.tenant_id = Some(e.tenant_id);
                self.invoice_id = Some(e.invoice_id);
                self.store_id = Some(e.store_id);
                self.kind = e.kind;
                self.currency = Some(e.currency.clone());
                self.net_amount = e.net_amount;
                self.tax_amount = e.tax_amount;
                self.gross_amount = e.gross_amount;
                self.reason = e.reason.clone();
                self.refund_reference = e.refund_reference.clone();
                self.status = CreditNoteStatus::Draft;
                self.created = true;
            }
            CreditNoteEvent::CreditNoteIssued(e) => {
                self.status = CreditNoteStatus::Issued;
                self.note_number = Some(e.note_number);
                self.issued_on = Some(e.issued_on);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CreditNoteCommand::CreateCreditNote(cmd) => self.handle_create(cmd),
            CreditNoteCommand::IssueCreditNote(cmd) => self.handle_issue(cmd),
        }
    }
}

impl CreditNote {
    fn handle_create(&self, cmd: &CreateCreditNote) -> Result<Vec<CreditNoteEvent>, DomainError> {
        if self.created {
            return Err(DomainError::already_exists(format!(
                "credit note {} already exists",
                cmd.note_id
            )));
        }
        if cmd.net_amount <= 0 {
            return Err(DomainError::validation(
                "credit note amount must be positive",
            ));
        }
        if cmd.reason.is_empty() {
            return Err(DomainError::validation("credit note reason is required"));
        }
        ensure_rate(cmd.tax_rate)?;

        let tax_amount = cmd.rounding.apply_rate(cmd.net_amount, cmd.tax_rate)?;
        let gross_amount = cmd
            .net_amount
            .checked_add(tax_amount)
            .ok_or_else(|| DomainError::invariant("credit note gross overflow"))?;

        Ok(vec![CreditNoteEvent::CreditNoteCreated(CreditNoteCreated {
            tenant_id: cmd.tenant_id,
            note_id: cmd.note_id,
            invoice_id: cmd.invoice_id,
            store_id: cmd.store_id,
            kind: cmd.kind,
            currency: cmd.currency.clone(),
            net_amount: cmd.net_amount,
            tax_amount,
            gross_amount,
            reason: cmd.reason.clone(),
            refund_reference: cmd.refund_reference.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_issue(&self, cmd: &IssueCreditNote) -> Result<Vec<CreditNoteEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(cmd.tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.status != CreditNoteStatus::Draft {
            return Err(DomainError::invalid_state("credit note is already issued"));
        }

        Ok(vec![CreditNoteEvent::CreditNoteIssued(CreditNoteIssued {
            tenant_id: cmd.tenant_id,
            note_id: cmd.note_id,
            note_number: cmd.note_number,
            issued_on: cmd.issued_on,
            occurred_at: cmd.occurred_at,
        })])
    }
}
