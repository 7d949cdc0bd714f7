use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feature::{ConsumptionContext, Feature};
use crate::period::PeriodType;
use crate::usage::UsageLimit;

/// Per-customer, per-feature quota counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub id: i64,
    pub customer_id: String,
    pub subscription_id: String,
    pub plan_id: String,
    pub feature: Feature,
    pub limit_value: UsageLimit,
    pub current_usage: u64,
    pub period_type: PeriodType,
    pub usage_period: String,
    pub reset_at: DateTime<Utc>,
    pub is_active: bool,
    pub warning_threshold: u8,
    pub warning_sent: bool,
    pub created_at: DateTime<Utc>,
    /// Set once a plan change replaced this row.
    pub superseded_at: Option<DateTime<Utc>>,
}

impl QuotaLimit {
    pub fn remaining_usage(&self) -> Option<u64> {
        self.limit_value.remaining(self.current_usage)
    }

    pub fn usage_percentage(&self) -> f64 {
        self.limit_value.percentage(self.current_usage)
    }

    pub fn is_due_for_reset(&self, now: DateTime<Utc>) -> bool {
        self.reset_at <= now
    }
}

/// Row to seed when a plan is (re)applied to a customer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQuotaLimit {
    pub feature: Feature,
    pub limit_value: UsageLimit,
    pub period_type: PeriodType,
    pub usage_period: String,
    pub reset_at: DateTime<Utc>,
    pub warning_threshold: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerPlan {
    pub customer_id: String,
    pub subscription_id: String,
    pub plan_id: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodUsage {
    pub customer_id: String,
    pub feature: Feature,
    pub usage_period: String,
    pub used: u64,
    pub last_updated: DateTime<Utc>,
}

/// Token pool for one customer and one monthly period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBalance {
    pub customer_id: String,
    pub current_period: String,
    pub monthly_allocation: u64,
    pub purchased_tokens: u64,
    pub bonus_tokens: u64,
    pub rolled_over_tokens: u64,
    /// Age in periods of the oldest carried-over tokens; 0 when nothing was carried.
    pub rollover_depth: u32,
    pub total_tokens: u64,
    pub used_tokens: u64,
    pub remaining_tokens: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenBalance {
    pub fn is_consistent(&self) -> bool {
        self.total_tokens.checked_sub(self.used_tokens) == Some(self.remaining_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTransactionKind {
    Consumption,
    Purchase,
    Bonus,
    Allocation,
    Rollover,
}

impl TokenTransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenTransactionKind::Consumption => "consumption",
            TokenTransactionKind::Purchase => "purchase",
            TokenTransactionKind::Bonus => "bonus",
            TokenTransactionKind::Allocation => "allocation",
            TokenTransactionKind::Rollover => "rollover",
        }
    }
}

impl fmt::Display for TokenTransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenTransactionKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "consumption" => Ok(TokenTransactionKind::Consumption),
            "purchase" => Ok(TokenTransactionKind::Purchase),
            "bonus" => Ok(TokenTransactionKind::Bonus),
            "allocation" => Ok(TokenTransactionKind::Allocation),
            "rollover" => Ok(TokenTransactionKind::Rollover),
            other => Err(format!("invalid token transaction kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub id: String,
    pub customer_id: String,
    pub period: String,
    pub kind: TokenTransactionKind,
    pub amount: u64,
    pub balance_before: u64,
    pub balance_after: u64,
    pub feature: Option<Feature>,
    pub related_entity_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Credit applied to an existing balance.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenCredit {
    pub kind: TokenTransactionKind,
    pub amount: u64,
    pub related_entity_id: Option<String>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenDebit {
    Applied {
        balance: TokenBalance,
        transaction: TokenTransaction,
    },
    Insufficient {
        remaining: u64,
    },
    MissingBalance,
}

/// Audit entry for one consumption attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub id: String,
    pub customer_id: String,
    pub feature: Feature,
    pub amount: u64,
    pub service_name: String,
    pub action_type: String,
    pub resource_id: Option<String>,
    pub context: Option<ConsumptionContext>,
    pub success: bool,
    pub error_message: Option<String>,
    pub consumed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Warning,
    LimitReached,
    LimitExceeded,
    UpgradeSuggested,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Warning => "warning",
            AlertType::LimitReached => "limit_reached",
            AlertType::LimitExceeded => "limit_exceeded",
            AlertType::UpgradeSuggested => "upgrade_suggested",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "warning" => Ok(AlertType::Warning),
            "limit_reached" => Ok(AlertType::LimitReached),
            "limit_exceeded" => Ok(AlertType::LimitExceeded),
            "upgrade_suggested" => Ok(AlertType::UpgradeSuggested),
            other => Err(format!("invalid alert type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub customer_id: String,
    pub feature: Feature,
    pub alert_type: AlertType,
    pub current_usage: u64,
    pub limit_value: UsageLimit,
    pub usage_percentage: f64,
    pub suggested_plan_id: Option<String>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}
