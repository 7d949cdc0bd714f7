use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Window over which a quota counter accumulates before it resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Monthly,
    Yearly,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Daily => "daily",
            PeriodType::Monthly => "monthly",
            PeriodType::Yearly => "yearly",
        }
    }

    /// Key of the period containing `at`, e.g. `2024-03-17`, `2024-03` or `2024`.
    pub fn period_key(&self, at: DateTime<Utc>) -> String {
        match self {
            PeriodType::Daily => format!("{:04}-{:02}-{:02}", at.year(), at.month(), at.day()),
            PeriodType::Monthly => format!("{:04}-{:02}", at.year(), at.month()),
            PeriodType::Yearly => format!("{:04}", at.year()),
        }
    }

    /// Start of the period following the one containing `at`.
    pub fn next_reset_at(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let next = match self {
            PeriodType::Daily => date.succ_opt(),
            PeriodType::Monthly => first_of_month(date).checked_add_months(Months::new(1)),
            PeriodType::Yearly => NaiveDate::from_ymd_opt(date.year() + 1, 1, 1),
        };
        // None only past the end of chrono's calendar.
        midnight(next.unwrap_or(NaiveDate::MAX))
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeriodType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "daily" => Ok(PeriodType::Daily),
            "monthly" => Ok(PeriodType::Monthly),
            "yearly" => Ok(PeriodType::Yearly),
            other => Err(format!("invalid period type '{other}'")),
        }
    }
}

/// Monthly window that token balances are kept in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPeriod {
    pub key: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TokenPeriod {
    pub fn containing(at: DateTime<Utc>) -> Self {
        let start = midnight(first_of_month(at.date_naive()));
        Self {
            key: PeriodType::Monthly.period_key(at),
            start,
            end: PeriodType::Monthly.next_reset_at(at),
        }
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 30, 0).unwrap()
    }

    #[test]
    fn period_keys_per_type() {
        let now = at(2024, 3, 7, 15);
        assert_eq!(PeriodType::Daily.period_key(now), "2024-03-07");
        assert_eq!(PeriodType::Monthly.period_key(now), "2024-03");
        assert_eq!(PeriodType::Yearly.period_key(now), "2024");
    }

    #[test]
    fn next_reset_rolls_to_boundary() {
        let now = at(2024, 12, 31, 23);
        assert_eq!(
            PeriodType::Daily.next_reset_at(now),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            PeriodType::Monthly.next_reset_at(at(2024, 1, 31, 8)),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            PeriodType::Yearly.next_reset_at(now),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn token_period_spans_calendar_month() {
        let period = TokenPeriod::containing(at(2024, 2, 29, 10));
        assert_eq!(period.key, "2024-02");
        assert_eq!(period.start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }
}
