use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;

use marketpay_core::{Currency, StoreId, TenantId};
use marketpay_events::EventEnvelope;
use marketpay_invoicing::{
    CreditNoteEvent, CreditNoteId, CreditNoteKind, CreditNoteStatus, InvoiceEvent, InvoiceId,
    InvoiceNumber, InvoiceStatus,
};
use marketpay_settlement::{SettlementId, SettlementPeriod};
use rust_decimal::Decimal;

use crate::read_model::{InMemoryTenantStore, TenantStore};

use super::{CursorCheck, ProjectionError, StreamCursors};

pub const INVOICE_AGGREGATE_TYPE: &str = "invoicing.invoice";
pub const CREDIT_NOTE_AGGREGATE_TYPE: &str = "invoicing.credit_note";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceReadModel {
    pub invoice_id: InvoiceId,
    pub store_id: StoreId,
    pub settlement_id: SettlementId,
    pub period: SettlementPeriod,
    pub currency: Currency,
    pub net_amount: i64,
    pub tax_rate: Decimal,
    pub tax_amount: i64,
    pub gross_amount: i64,
    pub status: InvoiceStatus,
    pub invoice_number: Option<InvoiceNumber>,
    pub issued_on: Option<NaiveDate>,
    pub due_on: Option<NaiveDate>,
    pub paid_on: Option<NaiveDate>,
    pub payment_reference: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditNoteReadModel {
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
    pub status: CreditNoteStatus,
    pub note_number: Option<InvoiceNumber>,
    pub issued_on: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

/// Invoice and credit-note read models plus the settlement → invoice
/// routing index (cleared on cancellation, so a settlement can be
/// re-invoiced after its invoice is cancelled).
#[derive(Debug, Default)]
pub struct InvoicesProjection {
    invoices: InMemoryTenantStore<InvoiceId, InvoiceReadModel>,
    credit_notes: InMemoryTenantStore<CreditNoteId, CreditNoteReadModel>,
    cursors: StreamCursors,
    by_settlement: RwLock<HashMap<(TenantId, SettlementId), InvoiceId>>,
}

impl InvoicesProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: TenantId, invoice_id: &InvoiceId) -> Option<InvoiceReadModel> {
        self.invoices.get(tenant_id, invoice_id)
    }

    pub fn by_settlement(
        &self,
        tenant_id: TenantId,
        settlement_id: SettlementId,
    ) -> Option<InvoiceReadModel> {
        let id = *self
            .by_settlement
            .read()
            .ok()?
            .get(&(tenant_id, settlement_id))?;
        self.invoices.get(tenant_id, &id)
    }

    pub fn get_credit_note(
        &self,
        tenant_id: TenantId,
        note_id: &CreditNoteId,
    ) -> Option<CreditNoteReadModel> {
        self.credit_notes.get(tenant_id, note_id)
    }

    pub fn credit_notes_for_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
    ) -> Vec<CreditNoteReadModel> {
        self.credit_notes
            .list(tenant_id)
            .into_iter()
            .filter(|n| n.invoice_id == invoice_id)
            .collect()
    }

    /// Issued invoices whose due date has passed without payment.
    pub fn overdue(&self, tenant_id: TenantId, today: NaiveDate) -> Vec<InvoiceReadModel> {
        self.invoices
            .list(tenant_id)
            .into_iter()
            .filter(|i| i.status == InvoiceStatus::Issued && i.due_on.is_some_and(|d| d < today))
            .collect()
    }

    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        match envelope.aggregate_type() {
            t if t == INVOICE_AGGREGATE_TYPE => self.apply_invoice(envelope),
            t if t == CREDIT_NOTE_AGGREGATE_TYPE => self.apply_credit_note(envelope),
            _ => Ok(()),
        }
    }

    fn apply_invoice(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), ProjectionError> {
        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if let CursorCheck::Duplicate = self.cursors.check(tenant_id, aggregate_id, seq)? {
            return Ok(());
        }

        let ev: InvoiceEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, invoice_id) = match &ev {
            InvoiceEvent::InvoiceCreated(e) => (e.tenant_id, e.invoice_id),
            InvoiceEvent::InvoiceIssued(e) => (e.tenant_id, e.invoice_id),
            InvoiceEvent::InvoicePaid(e) => (e.tenant_id, e.invoice_id),
            InvoiceEvent::InvoiceCancelled(e) => (e.tenant_id, e.invoice_id),
        };
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if invoice_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event invoice_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            InvoiceEvent::InvoiceCreated(e) => {
                if let Ok(mut index) = self.by_settlement.write() {
                    index.insert((tenant_id, e.settlement_id), e.invoice_id);
                }
                self.invoices.upsert(
                    tenant_id,
                    e.invoice_id,
                    InvoiceReadModel {
                        invoice_id: e.invoice_id,
                        store_id: e.store_id,
                        settlement_id: e.settlement_id,
                        period: e.period,
                        currency: e.currency,
                        net_amount: e.net_amount,
                        tax_rate: e.tax_rate,
                        tax_amount: e.tax_amount,
                        gross_amount: e.gross_amount,
                        status: InvoiceStatus::Draft,
                        invoice_number: None,
                        issued_on: None,
                        due_on: None,
                        paid_on: None,
                        payment_reference: None,
                        updated_at: e.occurred_at,
                    },
                );
            }
            InvoiceEvent::InvoiceIssued(e) => {
                if let Some(mut rm) = self.invoices.get(tenant_id, &e.invoice_id) {
                    rm.status = InvoiceStatus::Issued;
                    rm.invoice_number = Some(e.invoice_number);
                    rm.issued_on = Some(e.issued_on);
                    rm.due_on = Some(e.due_on);
                    rm.updated_at = e.occurred_at;
                    self.invoices.upsert(tenant_id, e.invoice_id, rm);
                }
            }
            InvoiceEvent::InvoicePaid(e) => {
                if let Some(mut rm) = self.invoices.get(tenant_id, &e.invoice_id) {
                    rm.status = InvoiceStatus::Paid;
                    rm.paid_on = Some(e.paid_on);
                    rm.payment_reference = Some(e.payment_reference);
                    rm.updated_at = e.occurred_at;
                    self.invoices.upsert(tenant_id, e.invoice_id, rm);
                }
            }
            InvoiceEvent::InvoiceCancelled(e) => {
                if let Some(mut rm) = self.invoices.get(tenant_id, &e.invoice_id) {
                    rm.status = InvoiceStatus::Cancelled;
                    rm.updated_at = e.occurred_at;
                    if let Ok(mut index) = self.by_settlement.write() {
                        let key = (tenant_id, rm.settlement_id);
                        if index.get(&key) == Some(&e.invoice_id) {
                            index.remove(&key);
                        }
                    }
                    self.invoices.upsert(tenant_id, e.invoice_id, rm);
                }
            }
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }

    fn apply_credit_note(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        if let CursorCheck::Duplicate = self.cursors.check(tenant_id, aggregate_id, seq)? {
            return Ok(());
        }

        let ev: CreditNoteEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let (event_tenant, note_id) = match &ev {
            CreditNoteEvent::CreditNoteCreated(e) => (e.tenant_id, e.note_id),
            CreditNoteEvent::CreditNoteIssued(e) => (e.tenant_id, e.note_id),
        };
        if event_tenant != tenant_id {
            return Err(ProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        if note_id.0 != aggregate_id {
            return Err(ProjectionError::TenantIsolation(
                "event note_id does not match envelope aggregate_id".to_string(),
            ));
        }

        match ev {
            CreditNoteEvent::CreditNoteCreated(e) => {
                self.credit_notes.upsert(
                    tenant_id,
                    e.note_id,
                    CreditNoteReadModel {
                        note_id: e.note_id,
                        invoice_id: e.invoice_id,
                        store_id: e.store_id,
                        kind: e.kind,
                        currency: e.currency,
                        net_amount: e.net_amount,
                        tax_amount: e.tax_amount,
                        gross_amount: e.gross_amount,
                        reason: e.reason,
                        refund_reference: e.refund_reference,
                        status: CreditNoteStatus::Draft,
                        note_number: None,
                        issued_on: None,
                        updated_at: e.occurred_at,
                    },
                );
            }
            CreditNoteEvent::CreditNoteIssued(e) => {
                if let Some(mut rm) = self.credit_notes.get(tenant_id, &e.note_id) {
                    rm.status = CreditNoteStatus::Issued;
                    rm.note_number = Some(e.note_number);
                    rm.issued_on = Some(e.issued_on);
                    rm.updated_at = e.occurred_at;
                    self.credit_notes.upsert(tenant_id, e.note_id, rm);
                }
            }
        }

        self.cursors.advance(tenant_id, aggregate_id, seq);
        Ok(())
    }
}
