use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use marketpay_core::RoundingPolicy;
use marketpay_payouts::{PayoutFrequency, RetryBackoff};

/// Engine-wide policy knobs. All money values are minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rounding applied to commission, tax, and pro-rata splits.
    pub rounding: RoundingPolicy,

    /// Fallback commission rate when no schedule rule matches.
    /// `None` makes an unmatched lookup an error.
    pub default_commission_rate: Option<Decimal>,

    /// Ceiling for a seller-initiated shipment refund.
    pub seller_refund_cap: i64,

    /// Provider attempts per refund request before it fails terminally.
    pub refund_max_attempts: u32,

    /// Days after delivery before an allocation becomes payable.
    pub escrow_hold_days: i64,

    /// Minimum balance to schedule a payout; anything below rolls over.
    pub payout_threshold: i64,

    pub payout_frequency: PayoutFrequency,

    /// Retries after the first failed transfer attempt.
    pub payout_max_retries: u32,

    pub payout_backoff: RetryBackoff,

    /// Payment terms: due date offset from the issue date.
    pub invoice_due_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rounding: RoundingPolicy::bankers(),
            default_commission_rate: Some(Decimal::new(10, 2)),
            seller_refund_cap: 50_000,
            refund_max_attempts: 3,
            escrow_hold_days: 7,
            payout_threshold: 2_500,
            payout_frequency: PayoutFrequency::Daily,
            payout_max_retries: 2,
            payout_backoff: RetryBackoff {
                base_secs: 60,
                cap_secs: 3_600,
            },
            invoice_due_days: 14,
        }
    }
}
