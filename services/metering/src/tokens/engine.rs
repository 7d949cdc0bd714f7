use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access::{DenialReason, MeteringError};
use crate::catalog::{PlanCatalog, PlanDefinition};
use crate::feature::Feature;
use crate::ledger::ConsumptionLedger;
use crate::period::TokenPeriod;
use crate::storage::{
    ConsumptionRecord, MeteringStore, StorageError, TokenBalance, TokenCredit, TokenDebit,
    TokenTransaction, TokenTransactionKind,
};
use crate::usage::MAX_AMOUNT;

use super::types::{TokenConsumptionResult, TokenGrant};

/// Service name written to the ledger for token debits tied to a feature.
pub const TOKEN_METER_SERVICE: &str = "token_meter";

/// Token balance lifecycle: lazy period opening with allocation and
/// rollover, guarded debits and credits.
#[derive(Clone)]
pub struct TokenMeteringEngine {
    store: Arc<dyn MeteringStore>,
    catalog: Arc<dyn PlanCatalog>,
    ledger: ConsumptionLedger,
}

impl TokenMeteringEngine {
    pub fn new(store: Arc<dyn MeteringStore>, catalog: Arc<dyn PlanCatalog>) -> Self {
        Self {
            ledger: ConsumptionLedger::new(Arc::clone(&store)),
            store,
            catalog,
        }
    }

    pub fn get_or_create_balance(&self, customer_id: &str) -> Result<TokenBalance, MeteringError> {
        self.open_period(customer_id, Utc::now())
    }

    /// Returns the balance of the monthly period containing `now`, creating
    /// it if needed. Safe to race: only the caller whose insert lands writes
    /// the allocation and rollover transactions.
    pub fn open_period(
        &self,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TokenBalance, MeteringError> {
        if customer_id.trim().is_empty() {
            return Err(MeteringError::Validation("customer_id cannot be empty".into()));
        }

        let period = TokenPeriod::containing(now);
        if let Some(balance) = self.store.find_balance(customer_id, &period.key)? {
            return Ok(balance);
        }

        let plan = self.plan_for(customer_id)?;
        let allocation = plan
            .as_ref()
            .map(|plan| plan.monthly_token_allocation)
            .unwrap_or(0);

        let (rolled_over, rollover_depth) = match &plan {
            Some(plan) => match self.store.latest_balance_before(customer_id, &period.key)? {
                Some(previous) if previous.period_end == period.start => {
                    carry_over(&previous, plan)
                }
                _ => (0, 0),
            },
            None => (0, 0),
        };

        let total = allocation.saturating_add(rolled_over);
        let balance = TokenBalance {
            customer_id: customer_id.to_string(),
            current_period: period.key.clone(),
            monthly_allocation: allocation,
            purchased_tokens: 0,
            bonus_tokens: 0,
            rolled_over_tokens: rolled_over,
            rollover_depth,
            total_tokens: total,
            used_tokens: 0,
            remaining_tokens: total,
            period_start: period.start,
            period_end: period.end,
            created_at: now,
            updated_at: now,
        };

        let mut transactions = Vec::with_capacity(2);
        if allocation > 0 {
            transactions.push(opening_transaction(
                &balance,
                TokenTransactionKind::Allocation,
                allocation,
                0,
                now,
            ));
        }
        if rolled_over > 0 {
            transactions.push(opening_transaction(
                &balance,
                TokenTransactionKind::Rollover,
                rolled_over,
                allocation,
                now,
            ));
        }

        if self.store.insert_balance_if_absent(&balance, &transactions)? {
            info!(
                customer_id,
                period = %period.key,
                allocation,
                rolled_over,
                rollover_depth,
                "opened token period"
            );
        }

        self.store
            .find_balance(customer_id, &period.key)?
            .ok_or_else(|| MeteringError::MissingBalance {
                customer_id: customer_id.to_string(),
                period: period.key,
            })
    }

    pub fn consume_tokens(
        &self,
        customer_id: &str,
        amount: u64,
        feature: Option<Feature>,
    ) -> TokenConsumptionResult {
        self.consume_tokens_at(customer_id, amount, feature, Utc::now())
    }

    pub fn consume_tokens_at(
        &self,
        customer_id: &str,
        amount: u64,
        feature: Option<Feature>,
        now: DateTime<Utc>,
    ) -> TokenConsumptionResult {
        let invalid = if amount == 0 {
            Some("amount must be greater than zero".to_string())
        } else if amount > MAX_AMOUNT {
            Some(format!("amount must not exceed {MAX_AMOUNT}"))
        } else if customer_id.trim().is_empty() {
            Some("customer_id cannot be empty".to_string())
        } else {
            None
        };
        if let Some(detail) = invalid {
            return TokenConsumptionResult::refused(
                customer_id,
                amount,
                feature,
                None,
                None,
                DenialReason::InvalidRequest(detail),
            );
        }

        let balance = match self.open_period(customer_id, now) {
            Ok(balance) => balance,
            Err(err) => {
                error!(customer_id, amount, error = %err, "failed to open token balance; denying");
                return self.refuse(
                    customer_id,
                    amount,
                    feature,
                    None,
                    None,
                    DenialReason::Unavailable,
                    now,
                );
            }
        };
        let period = balance.current_period;

        match self.store.debit_tokens(customer_id, &period, amount, feature, now) {
            Ok(TokenDebit::Applied {
                balance,
                transaction,
            }) => {
                debug!(
                    customer_id,
                    amount,
                    remaining = balance.remaining_tokens,
                    "consumed tokens"
                );
                if let Some(feature) = feature {
                    self.ledger.append(&token_record(customer_id, feature, amount, None, now));
                }
                TokenConsumptionResult::applied(&balance, &transaction)
            }
            Ok(TokenDebit::Insufficient { remaining }) => {
                debug!(customer_id, amount, remaining, "insufficient tokens");
                self.refuse(
                    customer_id,
                    amount,
                    feature,
                    Some(period),
                    Some(remaining),
                    DenialReason::InsufficientTokens,
                    now,
                )
            }
            Ok(TokenDebit::MissingBalance) => {
                error!(customer_id, period = %period, "token balance disappeared during debit");
                self.refuse(
                    customer_id,
                    amount,
                    feature,
                    Some(period),
                    None,
                    DenialReason::Unavailable,
                    now,
                )
            }
            Err(err) => {
                error!(customer_id, amount, error = %err, "token debit failed; denying");
                self.refuse(
                    customer_id,
                    amount,
                    feature,
                    Some(period),
                    None,
                    DenialReason::Unavailable,
                    now,
                )
            }
        }
    }

    /// Credits `amount` of `kind` to the current period's balance.
    pub fn add_tokens(
        &self,
        customer_id: &str,
        amount: u64,
        kind: TokenTransactionKind,
        related_entity_id: Option<String>,
        cost_usd: Option<f64>,
    ) -> Result<TokenGrant, MeteringError> {
        if amount == 0 {
            return Err(MeteringError::Validation("amount must be greater than zero".into()));
        }
        if amount > MAX_AMOUNT {
            return Err(MeteringError::Validation(format!(
                "amount must not exceed {MAX_AMOUNT}"
            )));
        }
        if kind == TokenTransactionKind::Consumption {
            return Err(MeteringError::Validation(
                "consumption is not a credit; use consume_tokens".into(),
            ));
        }
        if matches!(cost_usd, Some(cost) if !cost.is_finite() || cost < 0.0) {
            return Err(MeteringError::Validation(
                "cost_usd must be a non-negative number".into(),
            ));
        }

        let now = Utc::now();
        let balance = self.open_period(customer_id, now)?;
        if balance
            .total_tokens
            .checked_add(amount)
            .map_or(true, |total| total > MAX_AMOUNT)
        {
            return Err(MeteringError::Validation(format!(
                "crediting {amount} tokens would overflow the {} balance",
                balance.current_period
            )));
        }
        let credit = TokenCredit {
            kind,
            amount,
            related_entity_id,
            cost_usd,
        };

        let (balance, transaction) = self
            .store
            .credit_tokens(customer_id, &balance.current_period, &credit, now)?
            .ok_or_else(|| MeteringError::MissingBalance {
                customer_id: customer_id.to_string(),
                period: balance.current_period.clone(),
            })?;

        info!(
            customer_id,
            amount,
            kind = %kind,
            remaining = balance.remaining_tokens,
            "credited tokens"
        );
        Ok(TokenGrant {
            balance,
            transaction,
        })
    }

    pub fn transaction_history(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<TokenTransaction>, MeteringError> {
        Ok(self.store.token_transactions(customer_id, limit)?)
    }

    fn plan_for(&self, customer_id: &str) -> Result<Option<Arc<PlanDefinition>>, StorageError> {
        let Some(assignment) = self.store.customer_plan(customer_id)? else {
            return Ok(None);
        };
        let plan = self.catalog.plan(&assignment.plan_id);
        if plan.is_none() {
            warn!(
                customer_id,
                plan_id = %assignment.plan_id,
                "customer plan missing from catalog; opening period without allocation"
            );
        }
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn refuse(
        &self,
        customer_id: &str,
        amount: u64,
        feature: Option<Feature>,
        period: Option<String>,
        remaining: Option<u64>,
        reason: DenialReason,
        now: DateTime<Utc>,
    ) -> TokenConsumptionResult {
        if let Some(feature) = feature {
            self.ledger.append(&token_record(
                customer_id,
                feature,
                amount,
                Some(reason.to_string()),
                now,
            ));
        }
        TokenConsumptionResult::refused(customer_id, amount, feature, period, remaining, reason)
    }
}

/// Tokens carried from `previous` into the period that directly follows it,
/// with the resulting rollover depth.
///
/// Spending drains rolled-over tokens before fresh ones, so what is left of
/// the carried part is `rolled_over - used`. That part survives only while
/// its age stays within `max_rollover_months`; the cap then trims the oldest
/// tokens first.
pub fn carry_over(previous: &TokenBalance, plan: &PlanDefinition) -> (u64, u32) {
    if plan.max_rollover_months == 0 || plan.rollover_limit == 0 {
        return (0, 0);
    }

    let carried_left = previous
        .rolled_over_tokens
        .saturating_sub(previous.used_tokens)
        .min(previous.remaining_tokens);
    let fresh_left = previous.remaining_tokens - carried_left;

    let old_survives = carried_left > 0 && previous.rollover_depth < plan.max_rollover_months;
    let eligible = if old_survives {
        previous.remaining_tokens
    } else {
        fresh_left
    };

    let amount = eligible.min(plan.rollover_limit);
    let depth = if amount == 0 {
        0
    } else if old_survives && amount > fresh_left {
        previous.rollover_depth + 1
    } else {
        1
    };
    (amount, depth)
}

fn opening_transaction(
    balance: &TokenBalance,
    kind: TokenTransactionKind,
    amount: u64,
    balance_before: u64,
    now: DateTime<Utc>,
) -> TokenTransaction {
    TokenTransaction {
        id: Uuid::new_v4().to_string(),
        customer_id: balance.customer_id.clone(),
        period: balance.current_period.clone(),
        kind,
        amount,
        balance_before,
        balance_after: balance_before + amount,
        feature: None,
        related_entity_id: None,
        cost_usd: None,
        created_at: now,
    }
}

fn token_record(
    customer_id: &str,
    feature: Feature,
    amount: u64,
    error_message: Option<String>,
    now: DateTime<Utc>,
) -> ConsumptionRecord {
    ConsumptionRecord {
        id: Uuid::new_v4().to_string(),
        customer_id: customer_id.to_string(),
        feature,
        amount,
        service_name: TOKEN_METER_SERVICE.to_string(),
        action_type: "consume_tokens".to_string(),
        resource_id: None,
        context: None,
        success: error_message.is_none(),
        error_message,
        consumed_at: now,
    }
}
