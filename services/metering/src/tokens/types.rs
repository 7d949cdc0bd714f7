use serde::{Deserialize, Serialize};

use crate::access::DenialReason;
use crate::feature::Feature;
use crate::storage::{TokenBalance, TokenTransaction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenConsumptionResult {
    pub success: bool,
    pub customer_id: String,
    pub amount: u64,
    pub feature: Option<Feature>,
    pub period: Option<String>,
    /// Balance left after the attempt; `None` when it could not be read.
    pub remaining_tokens: Option<u64>,
    pub reason: Option<DenialReason>,
    pub error_message: Option<String>,
    pub transaction_id: Option<String>,
}

impl TokenConsumptionResult {
    pub(crate) fn applied(balance: &TokenBalance, transaction: &TokenTransaction) -> Self {
        Self {
            success: true,
            customer_id: balance.customer_id.clone(),
            amount: transaction.amount,
            feature: transaction.feature,
            period: Some(balance.current_period.clone()),
            remaining_tokens: Some(balance.remaining_tokens),
            reason: None,
            error_message: None,
            transaction_id: Some(transaction.id.clone()),
        }
    }

    pub(crate) fn refused(
        customer_id: &str,
        amount: u64,
        feature: Option<Feature>,
        period: Option<String>,
        remaining_tokens: Option<u64>,
        reason: DenialReason,
    ) -> Self {
        Self {
            success: false,
            customer_id: customer_id.to_string(),
            amount,
            feature,
            period,
            remaining_tokens,
            error_message: Some(reason.to_string()),
            reason: Some(reason),
            transaction_id: None,
        }
    }
}

/// Outcome of crediting tokens to the current balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub balance: TokenBalance,
    pub transaction: TokenTransaction,
}
