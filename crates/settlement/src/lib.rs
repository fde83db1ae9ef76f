//! `marketpay-settlement` — periodic seller settlement statements.
//!
//! One `Settlement` aggregate per (tenant, store, period, version). A
//! statement is generated from released escrow data, walks Draft →
//! Finalized → Approved → Exported, and is immutable once finalized.
//! Post-finalization corrections never mutate the statement: they become
//! adjustment line items on the next period, and regeneration of an
//! unapproved period supersedes the old version with version_no + 1.

pub mod statement;

pub use statement::{
    Settlement, SettlementAdjustment, SettlementCommand, SettlementEvent, SettlementId,
    SettlementItem, SettlementPeriod, SettlementStatus, SettlementTotals,
};
