use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Optional effective-date window for a rate rule.
///
/// `None` on either side means unbounded. Both bounds are inclusive: a rule
/// is active on `date` iff `from <= date` and `date <= to` for the bounds
/// that are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EffectiveWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl EffectiveWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    pub fn since(from: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn between(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// True when `from <= to` (or either side is open).
    pub fn is_ordered(&self) -> bool {
        match (self.from, self.to) {
            (Some(f), Some(t)) => f <= t,
            _ => true,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        if let Some(from) = self.from {
            if date < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if date > to {
                return false;
            }
        }
        true
    }

    /// True when the two windows share at least one date.
    pub fn overlaps(&self, other: &EffectiveWindow) -> bool {
        let starts_before_other_ends = match (self.from, other.to) {
            (Some(f), Some(t)) => f <= t,
            _ => true,
        };
        let other_starts_before_self_ends = match (other.from, self.to) {
            (Some(f), Some(t)) => f <= t,
            _ => true,
        };
        starts_before_other_ends && other_starts_before_self_ends
    }
}
