//! `marketpay-invoicing` — commission invoices and credit notes.
//!
//! The platform invoices each seller for the commission it charged over a
//! settlement period. Invoice numbers are sequential and gap-free per
//! tenant and calendar year (the engine's sequence allocator hands them out
//! at issue time). Refund-driven commission reversals after an invoice is
//! issued become credit notes, never edits.

pub mod credit_note;
pub mod invoice;

pub use credit_note::{
    CreditNote, CreditNoteCommand, CreditNoteEvent, CreditNoteId, CreditNoteKind, CreditNoteStatus,
};
pub use invoice::{
    CommissionInvoice, InvoiceCommand, InvoiceEvent, InvoiceId, InvoiceNumber, InvoiceStatus,
};
