use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

use marketpay_core::DomainError;

/// How often a store gets paid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "frequency", content = "on")]
pub enum PayoutFrequency {
    Daily,
    Weekly(Weekday),
    /// Day of month, 1..=28. Days 29..31 are rejected so every month has
    /// the payout day.
    Monthly(u32),
}

impl PayoutFrequency {
    pub fn monthly(day: u32) -> Result<Self, DomainError> {
        if !(1..=28).contains(&day) {
            return Err(DomainError::validation(
                "monthly payout day must be within 1..=28",
            ));
        }
        Ok(PayoutFrequency::Monthly(day))
    }

    /// First payout date strictly after `after`.
    pub fn next_payout_date(&self, after: NaiveDate) -> NaiveDate {
        match *self {
            PayoutFrequency::Daily => after + Days::new(1),
            PayoutFrequency::Weekly(weekday) => {
                let days_ahead = (7 + weekday.num_days_from_monday()
                    - after.weekday().num_days_from_monday()
                    - 1)
                    % 7
                    + 1;
                after + Days::new(u64::from(days_ahead))
            }
            PayoutFrequency::Monthly(day) => {
                let same_month = after.with_day(day);
                match same_month {
                    Some(date) if date > after => date,
                    _ => {
                        let (year, month) = if after.month() == 12 {
                            (after.year() + 1, 1)
                        } else {
                            (after.year(), after.month() + 1)
                        };
                        // Day is 1..=28, valid in every month.
                        NaiveDate::from_ymd_opt(year, month, day)
                            .unwrap_or(after + Days::new(1))
                    }
                }
            }
        }
    }
}

/// Exponential retry backoff with a ceiling: base * 2^attempts, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBackoff {
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl RetryBackoff {
    pub fn new(base_secs: u64, cap_secs: u64) -> Result<Self, DomainError> {
        if base_secs == 0 {
            return Err(DomainError::validation("backoff base must be positive"));
        }
        if cap_secs < base_secs {
            return Err(DomainError::validation("backoff cap below base"));
        }
        Ok(Self { base_secs, cap_secs })
    }

    /// Delay before the next attempt, given how many attempts failed so far.
    pub fn delay_secs(&self, attempts: u32) -> u64 {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        self.base_secs
            .checked_mul(factor)
            .map_or(self.cap_secs, |d| d.min(self.cap_secs))
    }

    pub fn next_retry_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.delay_secs(attempts) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn daily_is_tomorrow() {
        assert_eq!(
            PayoutFrequency::Daily.next_payout_date(date(2026, 3, 14)),
            date(2026, 3, 15)
        );
    }

    #[test]
    fn weekly_lands_on_the_requested_weekday() {
        let friday = PayoutFrequency::Weekly(Weekday::Fri);
        // 2026-03-14 is a Saturday; next Friday is the 20th.
        assert_eq!(friday.next_payout_date(date(2026, 3, 14)), date(2026, 3, 20));
        // From a Friday, the next payout is a full week later.
        assert_eq!(friday.next_payout_date(date(2026, 3, 20)), date(2026, 3, 27));
    }

    #[test]
    fn monthly_rolls_into_next_month_and_year() {
        let first = PayoutFrequency::monthly(1).unwrap();
        assert_eq!(first.next_payout_date(date(2026, 3, 14)), date(2026, 4, 1));
        assert_eq!(first.next_payout_date(date(2026, 12, 15)), date(2027, 1, 1));

        let mid = PayoutFrequency::monthly(15).unwrap();
        assert_eq!(mid.next_payout_date(date(2026, 3, 14)), date(2026, 3, 15));
        assert_eq!(mid.next_payout_date(date(2026, 3, 15)), date(2026, 4, 15));
    }

    #[test]
    fn monthly_day_out_of_range_is_rejected() {
        assert!(PayoutFrequency::monthly(0).is_err());
        assert!(PayoutFrequency::monthly(29).is_err());
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let backoff = RetryBackoff::new(60, 3_600).unwrap();
        assert_eq!(backoff.delay_secs(0), 60);
        assert_eq!(backoff.delay_secs(1), 120);
        assert_eq!(backoff.delay_secs(2), 240);
        assert_eq!(backoff.delay_secs(10), 3_600);
        assert_eq!(backoff.delay_secs(63), 3_600);
        assert_eq!(backoff.delay_secs(64), 3_600);
    }

    proptest! {
        #[test]
        fn next_payout_is_always_in_the_future(
            days_from_epoch in 0i64..40_000,
            weekday_idx in 0u8..7,
            monthly_day in 1u32..=28,
        ) {
            let after = NaiveDate::from_num_days_from_ce_opt(730_000 + days_from_epoch as i32)
                .unwrap();
            let weekday = Weekday::try_from(weekday_idx).unwrap();
            for frequency in [
                PayoutFrequency::Daily,
                PayoutFrequency::Weekly(weekday),
                PayoutFrequency::Monthly(monthly_day),
            ] {
                let next = frequency.next_payout_date(after);
                prop_assert!(next > after);
            }
        }

        #[test]
        fn backoff_is_monotone_and_capped(attempts in 0u32..80) {
            let backoff = RetryBackoff::new(30, 7_200).unwrap();
            let d0 = backoff.delay_secs(attempts);
            let d1 = backoff.delay_secs(attempts + 1);
            prop_assert!(d0 <= d1);
            prop_assert!(d1 <= 7_200);
        }
    }
}
