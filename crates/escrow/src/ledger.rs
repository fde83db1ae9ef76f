//! Ledger view over the escrow event stream.
//!
//! The event stream is the ledger: every entry here is derived from one
//! immutable event. Reconciliation folds the stream back into a payment and
//! compares it with the live aggregate — the two must always agree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marketpay_core::{Aggregate, Currency, ShipmentId};

use crate::payment::{EscrowEvent, EscrowPayment, EscrowPaymentId};

/// What happened to an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerAction {
    Created,
    MarkedEligible,
    Released,
    Refunded,
}

/// One immutable audit record of an allocation state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub action: LedgerAction,
    pub shipment_id: ShipmentId,
    /// Minor units moved by this entry (0 for eligibility marks).
    pub amount: i64,
    pub currency: Currency,
    pub reference: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Derive ledger entries from an escrow event stream.
///
/// Creation yields one `Created` entry per allocation; every other event
/// yields exactly one entry.
pub fn ledger_entries(events: &[EscrowEvent]) -> Vec<LedgerEntry> {
    let mut currency: Option<Currency> = None;
    let mut entries = Vec::new();

    for event in events {
        match event {
            EscrowEvent::EscrowCreated(e) => {
                currency = Some(e.currency.clone());
                for spec in &e.allocations {
                    entries.push(LedgerEntry {
                        action: LedgerAction::Created,
                        shipment_id: spec.shipment_id,
                        amount: spec.seller_amount + spec.shipping_amount,
                        currency: e.currency.clone(),
                        reference: None,
                        occurred_at: e.occurred_at,
                    });
                }
            }
            EscrowEvent::AllocationMarkedEligible(e) => {
                if let Some(currency) = currency.clone() {
                    entries.push(LedgerEntry {
                        action: LedgerAction::MarkedEligible,
                        shipment_id: e.shipment_id,
                        amount: 0,
                        currency,
                        reference: None,
                        occurred_at: e.occurred_at,
                    });
                }
            }
            EscrowEvent::AllocationReleased(e) => {
                if let Some(currency) = currency.clone() {
                    entries.push(LedgerEntry {
                        action: LedgerAction::Released,
                        shipment_id: e.shipment_id,
                        amount: e.amount,
                        currency,
                        reference: Some(e.payout_reference.clone()),
                        occurred_at: e.occurred_at,
                    });
                }
            }
            EscrowEvent::AllocationRefunded(e) => {
                if let Some(currency) = currency.clone() {
                    entries.push(LedgerEntry {
                        action: LedgerAction::Refunded,
                        shipment_id: e.shipment_id,
                        amount: e.amount,
                        currency,
                        reference: Some(e.reference.clone()),
                        occurred_at: e.occurred_at,
                    });
                }
            }
        }
    }

    entries
}

/// Rebuild a payment from its ledger (event stream).
///
/// Events must be in stream order. The result is byte-for-byte the live
/// aggregate state; reconciliation checks compare the two.
pub fn replay(id: EscrowPaymentId, events: &[EscrowEvent]) -> EscrowPayment {
    let mut payment = EscrowPayment::empty(id);
    for event in events {
        payment.apply(event);
    }
    payment
}

/// Fold the net money movement out of escrow from ledger entries.
/// `released + refunded` must equal the payment's disbursed total.
pub fn disbursed_total(entries: &[LedgerEntry]) -> i64 {
    entries
        .iter()
        .filter(|e| matches!(e.action, LedgerAction::Released | LedgerAction::Refunded))
        .map(|e| e.amount)
        .sum()
}
