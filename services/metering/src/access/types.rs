use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feature::{ConsumptionContext, Feature, ServiceCategory};
use crate::period::PeriodType;
use crate::reservation::Reservation;
use crate::storage::QuotaLimit;
use crate::usage::{UsageLimit, MAX_AMOUNT};

/// Why a check or consumption was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum DenialReason {
    NotInPlan,
    FeatureDisabled,
    QuotaExceeded,
    InsufficientTokens,
    InvalidRequest(String),
    /// Storage could not be consulted; access fails closed.
    Unavailable,
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::NotInPlan => "not_in_plan",
            DenialReason::FeatureDisabled => "feature_disabled",
            DenialReason::QuotaExceeded => "quota_exceeded",
            DenialReason::InsufficientTokens => "insufficient_tokens",
            DenialReason::InvalidRequest(_) => "invalid_request",
            DenialReason::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::NotInPlan => f.write_str("no active subscription or feature not in plan"),
            DenialReason::FeatureDisabled => f.write_str("feature disabled"),
            DenialReason::QuotaExceeded => f.write_str("usage limit exceeded"),
            DenialReason::InsufficientTokens => f.write_str("insufficient tokens"),
            DenialReason::InvalidRequest(detail) => write!(f, "invalid request: {detail}"),
            DenialReason::Unavailable => f.write_str("unable to verify access"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessResult {
    pub allowed: bool,
    pub customer_id: String,
    pub feature: Feature,
    pub amount: u64,
    pub reason: Option<DenialReason>,
    pub current_usage: Option<u64>,
    pub limit_value: Option<UsageLimit>,
    /// `None` when the quota is unlimited or unknown.
    pub remaining_usage: Option<u64>,
    pub usage_percentage: f64,
    pub suggested_plan_id: Option<String>,
    pub reservation: Option<Reservation>,
}

impl AccessResult {
    pub(crate) fn denied(
        customer_id: &str,
        feature: Feature,
        amount: u64,
        reason: DenialReason,
        limit: Option<&QuotaLimit>,
    ) -> Self {
        Self {
            allowed: false,
            customer_id: customer_id.to_string(),
            feature,
            amount,
            reason: Some(reason),
            current_usage: limit.map(|row| row.current_usage),
            limit_value: limit.map(|row| row.limit_value),
            remaining_usage: limit.and_then(QuotaLimit::remaining_usage),
            usage_percentage: limit.map(QuotaLimit::usage_percentage).unwrap_or(0.0),
            suggested_plan_id: None,
            reservation: None,
        }
    }

    pub(crate) fn allowed(limit: &QuotaLimit, amount: u64, reservation: Option<Reservation>) -> Self {
        Self {
            allowed: true,
            customer_id: limit.customer_id.clone(),
            feature: limit.feature,
            amount,
            reason: None,
            current_usage: Some(limit.current_usage),
            limit_value: Some(limit.limit_value),
            remaining_usage: limit.remaining_usage(),
            usage_percentage: limit.usage_percentage(),
            suggested_plan_id: None,
            reservation,
        }
    }

    pub fn consumption_token(&self) -> Option<&str> {
        self.reservation
            .as_ref()
            .map(|reservation| reservation.token.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRequest {
    pub customer_id: String,
    pub feature: Feature,
    pub amount: u64,
    pub service_name: String,
    pub action_type: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub context: Option<ConsumptionContext>,
    #[serde(default)]
    pub consumption_token: Option<String>,
}

impl ConsumptionRequest {
    pub fn new(
        customer_id: impl Into<String>,
        feature: Feature,
        amount: u64,
        service_name: impl Into<String>,
        action_type: impl Into<String>,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            feature,
            amount,
            service_name: service_name.into(),
            action_type: action_type.into(),
            resource_id: None,
            context: None,
            consumption_token: None,
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_context(mut self, context: ConsumptionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.consumption_token = Some(token.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.customer_id.trim().is_empty() {
            return Err("customer_id cannot be empty".into());
        }
        if self.amount == 0 {
            return Err("amount must be greater than zero".into());
        }
        if self.amount > MAX_AMOUNT {
            return Err(format!("amount must not exceed {MAX_AMOUNT}"));
        }
        if self.service_name.trim().is_empty() {
            return Err("service_name cannot be empty".into());
        }
        if let Some(context) = &self.context {
            if context.feature() != self.feature {
                return Err(format!(
                    "context for {} attached to a {} request",
                    context.feature(),
                    self.feature
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionResult {
    pub success: bool,
    pub customer_id: String,
    pub feature: Feature,
    pub amount: u64,
    pub new_usage: Option<u64>,
    pub remaining_usage: Option<u64>,
    pub reason: Option<DenialReason>,
    pub error_message: Option<String>,
    /// Ledger id of the attempt; `None` for requests rejected before metering.
    pub record_id: Option<String>,
    pub redeemed_reservation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetType {
    Manual,
    Upgrade,
    Period,
}

impl fmt::Display for ResetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResetType::Manual => "manual",
            ResetType::Upgrade => "upgrade",
            ResetType::Period => "period",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanActivation {
    pub customer_id: String,
    pub subscription_id: String,
    pub plan_id: String,
    pub superseded: usize,
    pub activated: Vec<Feature>,
}

/// Read model of one feature's quota for a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureUsage {
    pub feature: Feature,
    pub category: ServiceCategory,
    pub is_active: bool,
    pub limit_value: UsageLimit,
    pub current_usage: u64,
    pub remaining_usage: Option<u64>,
    pub usage_percentage: f64,
    pub period_type: PeriodType,
    pub usage_period: String,
    pub reset_at: DateTime<Utc>,
}

impl From<&QuotaLimit> for FeatureUsage {
    fn from(limit: &QuotaLimit) -> Self {
        Self {
            feature: limit.feature,
            category: limit.feature.category(),
            is_active: limit.is_active,
            limit_value: limit.limit_value,
            current_usage: limit.current_usage,
            remaining_usage: limit.remaining_usage(),
            usage_percentage: limit.usage_percentage(),
            period_type: limit.period_type,
            usage_period: limit.usage_period.clone(),
            reset_at: limit.reset_at,
        }
    }
}
