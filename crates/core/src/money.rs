//! Money and rate helpers.
//!
//! All persisted amounts are `i64` minor units (e.g. cents). Fractional math
//! (commission rates, tax rates, pro-rata refund splits) goes through
//! [`RoundingPolicy`] so the whole engine rounds the same way — the rounding
//! mode is a configuration constant, never a per-call-site choice.

use core::str::FromStr;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// ISO-4217 currency code (value object, compared by value).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> DomainResult<Self> {
        let code = code.into();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(DomainError::validation(format!(
                "currency code must be 3 uppercase ASCII letters, got '{code}'"
            )));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn eur() -> Self {
        Self("EUR".to_string())
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Validate a fractional rate (commission or tax): `0 <= rate <= 1`.
pub fn ensure_rate(rate: Decimal) -> DomainResult<()> {
    if rate < Decimal::ZERO || rate > Decimal::ONE {
        return Err(DomainError::validation(format!(
            "rate must be within [0, 1], got {rate}"
        )));
    }
    Ok(())
}

/// How fractional minor-unit results are rounded back to whole minor units.
///
/// One policy is configured engine-wide; it is never chosen per call site.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    /// Banker's rounding (midpoint to even). The engine-wide default.
    Bankers,
    /// Half-away-from-zero, for deployments that require "commercial" rounding.
    HalfUp,
}

impl RoundingPolicy {
    pub const fn bankers() -> Self {
        Self::Bankers
    }

    pub const fn half_up() -> Self {
        Self::HalfUp
    }

    fn strategy(&self) -> RoundingStrategy {
        match self {
            RoundingPolicy::Bankers => RoundingStrategy::MidpointNearestEven,
            RoundingPolicy::HalfUp => RoundingStrategy::MidpointAwayFromZero,
        }
    }

    /// `amount * rate`, rounded to whole minor units.
    ///
    /// Used for commission (`seller_portion * commission_rate`) and tax
    /// (`net * tax_rate`).
    pub fn apply_rate(&self, amount_minor: i64, rate: Decimal) -> DomainResult<i64> {
        ensure_rate(rate)?;
        let product = Decimal::from(amount_minor)
            .checked_mul(rate)
            .ok_or_else(|| DomainError::invariant("rate application overflow"))?;
        self.to_minor(product)
    }

    /// `value * part / whole`, rounded to whole minor units.
    ///
    /// Used for pro-rata commission reversal on partial refunds:
    /// `refunded_commission = refund_amount / seller_portion * commission`.
    pub fn prorate(&self, part: i64, whole: i64, value: i64) -> DomainResult<i64> {
        if whole == 0 {
            return Err(DomainError::validation("cannot prorate against zero"));
        }
        let scaled = Decimal::from(value)
            .checked_mul(Decimal::from(part))
            .and_then(|d| d.checked_div(Decimal::from(whole)))
            .ok_or_else(|| DomainError::invariant("proration overflow"))?;
        self.to_minor(scaled)
    }

    fn to_minor(&self, value: Decimal) -> DomainResult<i64> {
        value
            .round_dp_with_strategy(0, self.strategy())
            .to_i64()
            .ok_or_else(|| DomainError::invariant("amount does not fit in i64 minor units"))
    }
}

impl Default for RoundingPolicy {
    fn default() -> Self {
        Self::Bankers
    }
}
