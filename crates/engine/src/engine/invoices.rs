//! Commission invoicing: one invoice per approved settlement, gap-free
//! numbering at issue time, credit notes for post-issue reversals.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use marketpay_core::{AggregateId, CategoryId, DomainError, TenantId};
use marketpay_events::{EventBus, EventEnvelope};
use marketpay_invoicing::{
    CommissionInvoice, CreditNote, CreditNoteId, CreditNoteKind, InvoiceId, InvoiceNumber,
};
use marketpay_invoicing::credit_note::{CreateCreditNote, CreditNoteCommand, IssueCreditNote};
use marketpay_invoicing::invoice::{
    CancelInvoice, CreateInvoice, InvoiceCommand, IssueInvoice, MarkInvoicePaid,
};
use marketpay_rates::CountryCode;
use marketpay_settlement::{SettlementId, SettlementStatus};

use crate::event_store::EventStore;
use crate::projections::{CreditNoteReadModel, InvoiceReadModel};
use crate::sequence::DocumentKind;

use super::{CREDIT_NOTE_AGGREGATE, Engine, EngineError, INVOICE_AGGREGATE};

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Draft the commission invoice for an approved settlement. The net is
    /// the settlement's commission minus reversed commission; VAT is
    /// resolved against the seller's country at invoicing time.
    pub fn generate_invoice(
        &self,
        tenant_id: TenantId,
        settlement_id: SettlementId,
        country: &CountryCode,
        category_id: Option<CategoryId>,
        now: DateTime<Utc>,
    ) -> Result<InvoiceId, EngineError> {
        let settlement = self
            .projections
            .settlements
            .get(tenant_id, &settlement_id)
            .ok_or_else(DomainError::not_found)?;
        if !matches!(
            settlement.status,
            SettlementStatus::Approved | SettlementStatus::Exported
        ) {
            return Err(DomainError::invalid_state(format!(
                "settlement is {:?}, only an approved settlement can be invoiced",
                settlement.status
            ))
            .into());
        }
        if settlement.superseded {
            return Err(DomainError::invalid_state(
                "a superseded settlement cannot be invoiced",
            )
            .into());
        }
        if let Some(existing) = self
            .projections
            .invoices
            .by_settlement(tenant_id, settlement_id)
        {
            return Err(DomainError::already_exists(format!(
                "settlement {settlement_id} is already invoiced by {}",
                existing.invoice_id
            ))
            .into());
        }

        let net_amount = settlement.totals.commission - settlement.totals.refunded_commission;
        if net_amount <= 0 {
            return Err(DomainError::validation(
                "settlement has no positive commission to invoice",
            )
            .into());
        }

        let tax_rate = self.resolve_vat_rate(tenant_id, country, category_id, now.date_naive())?;

        let invoice_id = InvoiceId::new(AggregateId::new());
        self.execute::<CommissionInvoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            InvoiceCommand::CreateInvoice(CreateInvoice {
                tenant_id,
                invoice_id,
                store_id: settlement.store_id,
                settlement_id,
                period: settlement.period,
                currency: settlement.currency.clone(),
                net_amount,
                tax_rate,
                rounding: self.config.rounding,
                occurred_at: now,
            }),
            |id| CommissionInvoice::empty(InvoiceId::new(id)),
        )?;

        info!(%tenant_id, %invoice_id, %settlement_id, net_amount, "invoice drafted");
        Ok(invoice_id)
    }

    /// Issue a drafted invoice, assigning the next gap-free number for the
    /// tenant and calendar year. A rejected issue burns no number.
    pub fn issue_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        now: DateTime<Utc>,
    ) -> Result<InvoiceNumber, EngineError> {
        let issued_on = now.date_naive();
        let due_on = issued_on + Duration::days(self.config.invoice_due_days);

        let number = self
            .sequences
            .allocate(tenant_id, DocumentKind::Invoice, issued_on.year(), |sequence| {
                let invoice_number = InvoiceNumber {
                    year: issued_on.year(),
                    sequence,
                };
                self.execute::<CommissionInvoice>(
                    tenant_id,
                    invoice_id.0,
                    INVOICE_AGGREGATE,
                    InvoiceCommand::IssueInvoice(IssueInvoice {
                        tenant_id,
                        invoice_id,
                        invoice_number,
                        issued_on,
                        due_on,
                        occurred_at: now,
                    }),
                    |id| CommissionInvoice::empty(InvoiceId::new(id)),
                )?;
                Ok::<_, EngineError>(invoice_number)
            })?;

        info!(%tenant_id, %invoice_id, %number, "invoice issued");
        Ok(number)
    }

    pub fn mark_invoice_paid(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        paid_on: NaiveDate,
        payment_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<CommissionInvoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            InvoiceCommand::MarkInvoicePaid(MarkInvoicePaid {
                tenant_id,
                invoice_id,
                paid_on,
                payment_reference: payment_reference.to_string(),
                occurred_at: now,
            }),
            |id| CommissionInvoice::empty(InvoiceId::new(id)),
        )?;
        Ok(())
    }

    pub fn cancel_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.execute::<CommissionInvoice>(
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE,
            InvoiceCommand::CancelInvoice(CancelInvoice {
                tenant_id,
                invoice_id,
                reason: reason.to_string(),
                occurred_at: now,
            }),
            |id| CommissionInvoice::empty(InvoiceId::new(id)),
        )?;
        Ok(())
    }

    /// Create and issue a credit note against an invoice, numbered from
    /// the credit-note series so the invoice sequence stays gap-free.
    pub fn issue_credit_note(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        kind: CreditNoteKind,
        net_amount: i64,
        reason: &str,
        refund_reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CreditNoteId, EngineError> {
        let invoice = self
            .projections
            .invoices
            .get(tenant_id, &invoice_id)
            .ok_or_else(DomainError::not_found)?;

        let note_id = CreditNoteId::new(AggregateId::new());
        self.execute::<CreditNote>(
            tenant_id,
            note_id.0,
            CREDIT_NOTE_AGGREGATE,
            CreditNoteCommand::CreateCreditNote(CreateCreditNote {
                tenant_id,
                note_id,
                invoice_id,
                store_id: invoice.store_id,
                kind,
                currency: invoice.currency.clone(),
                net_amount,
                tax_rate: invoice.tax_rate,
                rounding: self.config.rounding,
                reason: reason.to_string(),
                refund_reference,
                occurred_at: now,
            }),
            |id| CreditNote::empty(CreditNoteId::new(id)),
        )?;

        let issued_on = now.date_naive();
        self.sequences
            .allocate(tenant_id, DocumentKind::CreditNote, issued_on.year(), |sequence| {
                self.execute::<CreditNote>(
                    tenant_id,
                    note_id.0,
                    CREDIT_NOTE_AGGREGATE,
                    CreditNoteCommand::IssueCreditNote(IssueCreditNote {
                        tenant_id,
                        note_id,
                        note_number: InvoiceNumber {
                            year: issued_on.year(),
                            sequence,
                        },
                        issued_on,
                        occurred_at: now,
                    }),
                    |id| CreditNote::empty(CreditNoteId::new(id)),
                )?;
                Ok::<_, EngineError>(())
            })?;

        info!(%tenant_id, %note_id, %invoice_id, net_amount, "credit note issued");
        Ok(note_id)
    }

    pub fn invoice(&self, tenant_id: TenantId, invoice_id: &InvoiceId) -> Option<InvoiceReadModel> {
        self.projections.invoices.get(tenant_id, invoice_id)
    }

    pub fn credit_note(
        &self,
        tenant_id: TenantId,
        note_id: &CreditNoteId,
    ) -> Option<CreditNoteReadModel> {
        self.projections.invoices.get_credit_note(tenant_id, note_id)
    }
}
