//! `marketpay-payouts` — seller payout scheduling and execution.
//!
//! Eligible escrow balances per seller are bundled into a `SellerPayout`
//! on the store's payout day, provided they clear the minimum threshold
//! (balances below it roll over to the next cycle). Failed transfers are
//! retried with exponential backoff up to a retry cap; exhausted payouts
//! stay visible as terminal failures until an operator resolves them.

pub mod payout;
pub mod schedule;

pub use payout::{
    PayoutCommand, PayoutEvent, PayoutStatus, SellerPayout, SellerPayoutId,
};
pub use schedule::{PayoutFrequency, RetryBackoff};
