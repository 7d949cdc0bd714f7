use std::fmt;

use serde::{Deserialize, Serialize};

/// Stored value for an unlimited quota.
pub const UNLIMITED: i64 = -1;

/// Largest amount or counter the store can hold (SQLite INTEGER).
pub const MAX_AMOUNT: u64 = i64::MAX as u64;

/// Plan limit for a feature; persisted as `-1` when unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum UsageLimit {
    Unlimited,
    Capped(u64),
}

impl UsageLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, UsageLimit::Unlimited)
    }

    /// Whether `amount` more fits. Unlimited quotas are still bounded by
    /// `MAX_AMOUNT`.
    pub fn allows(&self, current_usage: u64, amount: u64) -> bool {
        let Some(total) = current_usage.checked_add(amount) else {
            return false;
        };
        match self {
            UsageLimit::Unlimited => total <= MAX_AMOUNT,
            UsageLimit::Capped(limit) => total <= *limit && total <= MAX_AMOUNT,
        }
    }

    /// `limit - usage`, saturating at zero; `None` when unlimited.
    pub fn remaining(&self, current_usage: u64) -> Option<u64> {
        match self {
            UsageLimit::Unlimited => None,
            UsageLimit::Capped(limit) => Some(limit.saturating_sub(current_usage)),
        }
    }

    /// `usage / limit * 100`; unlimited quotas always report 0.
    pub fn percentage(&self, current_usage: u64) -> f64 {
        match self {
            UsageLimit::Unlimited => 0.0,
            UsageLimit::Capped(0) => 100.0,
            UsageLimit::Capped(limit) => (current_usage as f64 / *limit as f64) * 100.0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        i64::from(*self)
    }
}

impl TryFrom<i64> for UsageLimit {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            UNLIMITED => Ok(UsageLimit::Unlimited),
            v if v >= 0 => Ok(UsageLimit::Capped(v.unsigned_abs())),
            other => Err(format!("invalid usage limit {other}; use -1 for unlimited")),
        }
    }
}

impl From<UsageLimit> for i64 {
    fn from(limit: UsageLimit) -> Self {
        match limit {
            UsageLimit::Unlimited => UNLIMITED,
            UsageLimit::Capped(value) => i64::try_from(value).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for UsageLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageLimit::Unlimited => f.write_str("unlimited"),
            UsageLimit::Capped(limit) => write!(f, "{limit}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_limit_formulas() {
        let limit = UsageLimit::Capped(10);
        assert!(limit.allows(9, 1));
        assert!(!limit.allows(9, 2));
        assert_eq!(limit.remaining(9), Some(1));
        assert_eq!(limit.remaining(12), Some(0));
        assert_eq!(limit.percentage(5), 50.0);
    }

    #[test]
    fn unlimited_reports_zero_percent() {
        let limit = UsageLimit::Unlimited;
        assert!(limit.allows(1_000_000, 1));
        assert!(!limit.allows(MAX_AMOUNT, 1));
        assert!(!limit.allows(0, u64::MAX));
        assert_eq!(limit.remaining(1_000), None);
        assert_eq!(limit.percentage(1_000), 0.0);
        assert_eq!(limit.as_i64(), -1);
    }

    #[test]
    fn serde_uses_minus_one_for_unlimited() {
        let parsed: UsageLimit = serde_json::from_str("-1").unwrap();
        assert_eq!(parsed, UsageLimit::Unlimited);
        let parsed: UsageLimit = serde_json::from_str("250").unwrap();
        assert_eq!(parsed, UsageLimit::Capped(250));
        assert!(serde_json::from_str::<UsageLimit>("-7").is_err());
    }
}
