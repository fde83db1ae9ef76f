//! `marketpay-escrow` — the escrow ledger.
//!
//! One `EscrowPayment` aggregate per paid order, owning one allocation per
//! seller shipment. The aggregate's event stream is the append-only ledger:
//! every state change is an immutable event, the live state is the fold of
//! those events, and `ledger::replay` reconstructs it for reconciliation.

pub mod ledger;
pub mod payment;

pub use ledger::{LedgerAction, LedgerEntry, disbursed_total, ledger_entries, replay};
pub use payment::{
    AllocationSpec, AllocationStatus, EscrowAllocation, EscrowCommand, EscrowEvent, EscrowPayment,
    EscrowPaymentId, EscrowPaymentStatus,
};
