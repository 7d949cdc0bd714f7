use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertEmitter;
use crate::catalog::PlanCatalog;
use crate::config::MeteringConfig;
use crate::events::{ConsumptionEvent, DomainEvent, EventPublisher};
use crate::feature::Feature;
use crate::ledger::ConsumptionLedger;
use crate::reservation::ReservationRegistry;
use crate::storage::{
    AlertRecord, AlertType, ConsumptionRecord, CustomerPlan, MeteringStore, NewQuotaLimit,
    QuotaLimit, StorageError,
};
use crate::usage::{UsageLimit, MAX_AMOUNT};

use super::error::MeteringError;
use super::types::{
    AccessResult, ConsumptionRequest, ConsumptionResult, DenialReason, FeatureUsage,
    PlanActivation, ResetType,
};

/// Gatekeeper for plan-limited features: check, reserve, consume, audit, alert.
///
/// Checks read without locking and are advisory. Commits go through the
/// store's guarded increment, which is the only place a limit is enforced
/// authoritatively.
#[derive(Clone)]
pub struct AccessControlEngine {
    store: Arc<dyn MeteringStore>,
    catalog: Arc<dyn PlanCatalog>,
    reservations: ReservationRegistry,
    publisher: Arc<dyn EventPublisher>,
    alerts: AlertEmitter,
    ledger: ConsumptionLedger,
    default_warning_threshold: u8,
    enable_auto_reset: bool,
}

impl AccessControlEngine {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        catalog: Arc<dyn PlanCatalog>,
        reservations: ReservationRegistry,
        publisher: Arc<dyn EventPublisher>,
        config: &MeteringConfig,
    ) -> Self {
        Self {
            alerts: AlertEmitter::new(Arc::clone(&store), Arc::clone(&publisher)),
            ledger: ConsumptionLedger::new(Arc::clone(&store)),
            store,
            catalog,
            reservations,
            publisher,
            default_warning_threshold: config.default_warning_threshold,
            enable_auto_reset: config.enable_auto_reset,
        }
    }

    pub fn reservations(&self) -> &ReservationRegistry {
        &self.reservations
    }

    pub fn check_access(
        &self,
        customer_id: &str,
        feature: Feature,
        amount: u64,
        user_id: Option<&str>,
    ) -> AccessResult {
        self.evaluate(customer_id, feature, amount, user_id, true)
    }

    pub fn consume_feature(&self, request: ConsumptionRequest) -> ConsumptionResult {
        if let Err(detail) = request.validate() {
            debug!(
                customer_id = %request.customer_id,
                feature = %request.feature,
                detail = %detail,
                "rejected malformed consumption request"
            );
            return rejected(&request, DenialReason::InvalidRequest(detail), None, false);
        }

        let now = Utc::now();
        let redeemed = match &request.consumption_token {
            Some(token) => match self.reservations.redeem(
                token,
                &request.customer_id,
                request.feature,
                request.amount,
            ) {
                Ok(_) => true,
                Err(err) => {
                    debug!(
                        customer_id = %request.customer_id,
                        feature = %request.feature,
                        error = %err,
                        "reservation not redeemed; re-validating"
                    );
                    false
                }
            },
            None => false,
        };

        if !redeemed {
            let check = self.evaluate(
                &request.customer_id,
                request.feature,
                request.amount,
                None,
                false,
            );
            if !check.allowed {
                let reason = check.reason.unwrap_or(DenialReason::Unavailable);
                let record_id = self.record_attempt(&request, Some(reason.to_string()), now);
                return rejected(&request, reason, Some(record_id), false);
            }
        }

        match self.commit(&request, now) {
            Ok(Some(updated)) => self.finish_success(&request, &updated, redeemed, now),
            Ok(None) => {
                let reason = self.explain_rejected_commit(&request);
                let record_id = self.record_attempt(&request, Some(reason.to_string()), now);
                rejected(&request, reason, Some(record_id), redeemed)
            }
            Err(err) => {
                error!(
                    customer_id = %request.customer_id,
                    feature = %request.feature,
                    amount = request.amount,
                    error = %err,
                    "failed to commit feature consumption; denying"
                );
                let reason = DenialReason::Unavailable;
                let record_id = self.record_attempt(&request, Some(reason.to_string()), now);
                rejected(&request, reason, Some(record_id), redeemed)
            }
        }
    }

    /// Replaces the customer's limits with fresh rows from `plan_id`.
    pub fn update_customer_feature_limits(
        &self,
        customer_id: &str,
        subscription_id: &str,
        plan_id: &str,
    ) -> Result<PlanActivation, MeteringError> {
        if customer_id.trim().is_empty() {
            return Err(MeteringError::Validation("customer_id cannot be empty".into()));
        }
        if subscription_id.trim().is_empty() {
            return Err(MeteringError::Validation(
                "subscription_id cannot be empty".into(),
            ));
        }

        let plan = self
            .catalog
            .plan(plan_id)
            .ok_or_else(|| MeteringError::UnknownPlan(plan_id.to_string()))?;

        let now = Utc::now();
        let rows: Vec<NewQuotaLimit> = plan
            .enabled_features()
            .map(|(feature, config)| NewQuotaLimit {
                feature,
                limit_value: config.limit,
                period_type: config.period_type,
                usage_period: config.period_type.period_key(now),
                reset_at: config.period_type.next_reset_at(now),
                warning_threshold: config
                    .warning_threshold
                    .unwrap_or(self.default_warning_threshold),
            })
            .collect();

        let customer_plan = CustomerPlan {
            customer_id: customer_id.to_string(),
            subscription_id: subscription_id.to_string(),
            plan_id: plan_id.to_string(),
            updated_at: now,
        };
        let superseded = self.store.replace_limits(&customer_plan, &rows, now)?;

        info!(
            customer_id,
            subscription_id,
            plan_id,
            superseded,
            activated = rows.len(),
            "applied plan feature limits"
        );

        Ok(PlanActivation {
            customer_id: customer_id.to_string(),
            subscription_id: subscription_id.to_string(),
            plan_id: plan_id.to_string(),
            superseded,
            activated: rows.iter().map(|row| row.feature).collect(),
        })
    }

    /// Zeroes usage for `features`, or every feature when `None`.
    pub fn reset_feature_counters(
        &self,
        customer_id: &str,
        reset_type: ResetType,
        features: Option<&[Feature]>,
    ) -> Result<usize, MeteringError> {
        let reset = self.store.reset_usage(customer_id, features)?;
        info!(
            customer_id,
            reset_type = %reset_type,
            features = ?features,
            reset,
            "reset feature counters"
        );
        Ok(reset)
    }

    pub fn set_feature_enabled(
        &self,
        customer_id: &str,
        feature: Feature,
        enabled: bool,
    ) -> Result<bool, MeteringError> {
        let changed = self.store.set_limit_active(customer_id, feature, enabled)?;
        info!(customer_id, feature = %feature, enabled, changed, "updated feature availability");
        Ok(changed)
    }

    pub fn usage_summary(&self, customer_id: &str) -> Result<Vec<FeatureUsage>, MeteringError> {
        let limits = self.store.list_limits(customer_id)?;
        Ok(limits.iter().map(FeatureUsage::from).collect())
    }

    pub fn alerts(
        &self,
        customer_id: &str,
        unresolved_only: bool,
    ) -> Result<Vec<AlertRecord>, MeteringError> {
        Ok(self.store.list_alerts(customer_id, unresolved_only)?)
    }

    pub fn resolve_alert(&self, alert_id: &str) -> Result<bool, MeteringError> {
        Ok(self.store.resolve_alert(alert_id)?)
    }

    pub fn consumption_history(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<ConsumptionRecord>, MeteringError> {
        Ok(self.ledger.history(customer_id, limit)?)
    }

    fn evaluate(
        &self,
        customer_id: &str,
        feature: Feature,
        amount: u64,
        user_id: Option<&str>,
        issue_reservation: bool,
    ) -> AccessResult {
        match self.try_evaluate(customer_id, feature, amount, issue_reservation) {
            Ok(result) => {
                debug!(
                    customer_id,
                    feature = %feature,
                    amount,
                    user_id = user_id.unwrap_or("-"),
                    allowed = result.allowed,
                    "evaluated feature access"
                );
                result
            }
            Err(err) => {
                error!(
                    customer_id,
                    feature = %feature,
                    amount,
                    error = %err,
                    "access check failed; denying"
                );
                AccessResult::denied(customer_id, feature, amount, DenialReason::Unavailable, None)
            }
        }
    }

    fn try_evaluate(
        &self,
        customer_id: &str,
        feature: Feature,
        amount: u64,
        issue_reservation: bool,
    ) -> Result<AccessResult, StorageError> {
        if customer_id.trim().is_empty() {
            return Ok(AccessResult::denied(
                customer_id,
                feature,
                amount,
                DenialReason::InvalidRequest("customer_id cannot be empty".into()),
                None,
            ));
        }
        if amount == 0 {
            return Ok(AccessResult::denied(
                customer_id,
                feature,
                amount,
                DenialReason::InvalidRequest("amount must be greater than zero".into()),
                None,
            ));
        }
        if amount > MAX_AMOUNT {
            return Ok(AccessResult::denied(
                customer_id,
                feature,
                amount,
                DenialReason::InvalidRequest(format!("amount must not exceed {MAX_AMOUNT}")),
                None,
            ));
        }

        let Some(limit) = self.current_limit(customer_id, feature, Utc::now())? else {
            return Ok(AccessResult::denied(
                customer_id,
                feature,
                amount,
                DenialReason::NotInPlan,
                None,
            ));
        };

        if !limit.is_active {
            return Ok(AccessResult::denied(
                customer_id,
                feature,
                amount,
                DenialReason::FeatureDisabled,
                Some(&limit),
            ));
        }

        let projected = limit.current_usage.saturating_add(amount).min(MAX_AMOUNT);
        if !limit.limit_value.allows(limit.current_usage, amount) {
            let suggested_plan_id = self.suggested_plan(&limit);
            self.alerts
                .emit(&limit, AlertType::LimitExceeded, projected, suggested_plan_id.clone());
            if suggested_plan_id.is_some() {
                self.alerts.emit(
                    &limit,
                    AlertType::UpgradeSuggested,
                    projected,
                    suggested_plan_id.clone(),
                );
            }

            let mut result = AccessResult::denied(
                customer_id,
                feature,
                amount,
                DenialReason::QuotaExceeded,
                Some(&limit),
            );
            result.suggested_plan_id = suggested_plan_id;
            return Ok(result);
        }

        self.maybe_warn(&limit, projected);

        let reservation =
            issue_reservation.then(|| self.reservations.issue(customer_id, feature, amount));
        Ok(AccessResult::allowed(&limit, amount, reservation))
    }

    /// Loads the current row, first rolling it into the present period when
    /// its reset time has passed.
    fn current_limit(
        &self,
        customer_id: &str,
        feature: Feature,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaLimit>, StorageError> {
        let limit = self.store.find_limit(customer_id, feature)?;

        match limit {
            Some(limit) if self.enable_auto_reset && limit.is_due_for_reset(now) => {
                let usage_period = limit.period_type.period_key(now);
                let reset_at = limit.period_type.next_reset_at(now);
                if self.store.roll_limit_period(
                    limit.id,
                    &limit.usage_period,
                    &usage_period,
                    reset_at,
                )? {
                    info!(
                        customer_id,
                        feature = %feature,
                        previous_period = %limit.usage_period,
                        usage_period = %usage_period,
                        "rolled quota into new period"
                    );
                }
                self.store.find_limit(customer_id, feature)
            }
            other => Ok(other),
        }
    }

    fn maybe_warn(&self, limit: &QuotaLimit, projected: u64) {
        if limit.warning_sent || limit.limit_value.is_unlimited() {
            return;
        }
        if limit.limit_value.percentage(projected) < f64::from(limit.warning_threshold) {
            return;
        }

        match self.store.mark_warning_sent(limit.id) {
            Ok(true) => {
                self.alerts.emit(limit, AlertType::Warning, projected, None);
            }
            Ok(false) => {}
            Err(err) => {
                warn!(
                    customer_id = %limit.customer_id,
                    feature = %limit.feature,
                    error = %err,
                    "failed to flag usage warning"
                );
            }
        }
    }

    fn suggested_plan(&self, limit: &QuotaLimit) -> Option<String> {
        self.catalog
            .plan(&limit.plan_id)
            .and_then(|plan| plan.upgrade_plan_id.clone())
    }

    fn commit(
        &self,
        request: &ConsumptionRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaLimit>, StorageError> {
        let Some(limit) = self.current_limit(&request.customer_id, request.feature, now)? else {
            return Ok(None);
        };
        self.store.try_increment_usage(limit.id, request.amount, now)
    }

    /// Works out why the guarded increment refused a request that passed its check.
    fn explain_rejected_commit(&self, request: &ConsumptionRequest) -> DenialReason {
        match self.store.find_limit(&request.customer_id, request.feature) {
            Ok(None) => DenialReason::NotInPlan,
            Ok(Some(limit)) if !limit.is_active => DenialReason::FeatureDisabled,
            Ok(Some(limit)) => {
                let projected = limit.current_usage.saturating_add(request.amount).min(MAX_AMOUNT);
                let suggested_plan_id = self.suggested_plan(&limit);
                self.alerts
                    .emit(&limit, AlertType::LimitExceeded, projected, suggested_plan_id);
                DenialReason::QuotaExceeded
            }
            Err(err) => {
                error!(
                    customer_id = %request.customer_id,
                    feature = %request.feature,
                    error = %err,
                    "failed to reload quota after rejected commit"
                );
                DenialReason::Unavailable
            }
        }
    }

    fn finish_success(
        &self,
        request: &ConsumptionRequest,
        updated: &QuotaLimit,
        redeemed: bool,
        now: DateTime<Utc>,
    ) -> ConsumptionResult {
        let record_id = self.record_attempt(request, None, now);

        let event = DomainEvent::FeatureConsumption(ConsumptionEvent {
            event_id: Uuid::new_v4().to_string(),
            customer_id: request.customer_id.clone(),
            feature: request.feature,
            category: request.feature.category(),
            amount: request.amount,
            service_name: request.service_name.clone(),
            action_type: request.action_type.clone(),
            resource_id: request.resource_id.clone(),
            new_usage: updated.current_usage,
            remaining_usage: updated.remaining_usage(),
            timestamp: now,
        });
        if let Err(err) = self.publisher.publish(event) {
            warn!(
                customer_id = %request.customer_id,
                feature = %request.feature,
                error = %err,
                "failed to publish consumption event"
            );
        }

        if let UsageLimit::Capped(limit) = updated.limit_value {
            if updated.current_usage == limit {
                self.alerts
                    .emit(updated, AlertType::LimitReached, updated.current_usage, None);
            }
        }

        debug!(
            customer_id = %request.customer_id,
            feature = %request.feature,
            amount = request.amount,
            new_usage = updated.current_usage,
            redeemed,
            "consumed feature"
        );

        ConsumptionResult {
            success: true,
            customer_id: request.customer_id.clone(),
            feature: request.feature,
            amount: request.amount,
            new_usage: Some(updated.current_usage),
            remaining_usage: updated.remaining_usage(),
            reason: None,
            error_message: None,
            record_id: Some(record_id),
            redeemed_reservation: redeemed,
        }
    }

    fn record_attempt(
        &self,
        request: &ConsumptionRequest,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> String {
        let record = ConsumptionRecord {
            id: Uuid::new_v4().to_string(),
            customer_id: request.customer_id.clone(),
            feature: request.feature,
            amount: request.amount,
            service_name: request.service_name.clone(),
            action_type: request.action_type.clone(),
            resource_id: request.resource_id.clone(),
            context: request.context.clone(),
            success: error_message.is_none(),
            error_message,
            consumed_at: now,
        };
        self.ledger.append(&record);
        record.id
    }
}

fn rejected(
    request: &ConsumptionRequest,
    reason: DenialReason,
    record_id: Option<String>,
    redeemed: bool,
) -> ConsumptionResult {
    debug!(
        customer_id = %request.customer_id,
        feature = %request.feature,
        amount = request.amount,
        reason = reason.code(),
        "consumption denied"
    );
    ConsumptionResult {
        success: false,
        customer_id: request.customer_id.clone(),
        feature: request.feature,
        amount: request.amount,
        new_usage: None,
        remaining_usage: None,
        error_message: Some(reason.to_string()),
        reason: Some(reason),
        record_id,
        redeemed_reservation: redeemed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FeatureConfig, PlanDefinition, StaticPlanCatalog};
    use crate::events::BroadcastPublisher;
    use crate::feature::ConsumptionContext;
    use crate::period::PeriodType;
    use crate::storage::SqliteStore;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn feature(limit: UsageLimit, enabled: bool) -> FeatureConfig {
        FeatureConfig {
            enabled,
            limit,
            period_type: PeriodType::Monthly,
            warning_threshold: None,
        }
    }

    fn catalog() -> StaticPlanCatalog {
        let mut basic = BTreeMap::new();
        basic.insert(Feature::CreditScoring, feature(UsageLimit::Capped(10), true));
        basic.insert(Feature::AiAssistant, feature(UsageLimit::Capped(100), true));
        basic.insert(Feature::ReportExport, feature(UsageLimit::Capped(5), false));

        let mut pro = BTreeMap::new();
        pro.insert(Feature::CreditScoring, feature(UsageLimit::Unlimited, true));
        pro.insert(Feature::FinancialForecast, feature(UsageLimit::Capped(20), true));

        StaticPlanCatalog::from_plans(vec![
            PlanDefinition {
                plan_id: "basic".to_string(),
                name: None,
                monthly_token_allocation: 0,
                rollover_limit: 0,
                max_rollover_months: 0,
                upgrade_plan_id: Some("pro".to_string()),
                features: basic,
            },
            PlanDefinition {
                plan_id: "pro".to_string(),
                name: None,
                monthly_token_allocation: 0,
                rollover_limit: 0,
                max_rollover_months: 0,
                upgrade_plan_id: None,
                features: pro,
            },
        ])
        .unwrap()
    }

    struct Fixture {
        engine: AccessControlEngine,
        store: Arc<SqliteStore>,
        bus: Arc<BroadcastPublisher>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus = Arc::new(BroadcastPublisher::new(64));
        let engine = AccessControlEngine::new(
            store.clone(),
            Arc::new(catalog()),
            ReservationRegistry::new(Duration::from_secs(300), Duration::from_secs(60)),
            bus.clone(),
            &MeteringConfig::default(),
        );
        engine
            .update_customer_feature_limits("cust-1", "sub-1", "basic")
            .unwrap();
        Fixture { engine, store, bus }
    }

    fn consume(engine: &AccessControlEngine, feature: Feature, amount: u64) -> ConsumptionResult {
        engine.consume_feature(ConsumptionRequest::new(
            "cust-1",
            feature,
            amount,
            "scoring-service",
            "score",
        ))
    }

    fn alerts_of(store: &SqliteStore, alert_type: AlertType) -> usize {
        store
            .list_alerts("cust-1", false)
            .unwrap()
            .into_iter()
            .filter(|alert| alert.alert_type == alert_type)
            .count()
    }

    #[test]
    fn check_issues_reservation_that_consume_redeems() {
        let fx = fixture();
        let check = fx
            .engine
            .check_access("cust-1", Feature::CreditScoring, 3, Some("user-7"));
        assert!(check.allowed);
        assert_eq!(check.remaining_usage, Some(10));
        let token = check.consumption_token().unwrap().to_string();
        assert_eq!(fx.engine.reservations().len(), 1);

        let result = fx.engine.consume_feature(
            ConsumptionRequest::new("cust-1", Feature::CreditScoring, 3, "scoring-service", "score")
                .with_token(token),
        );
        assert!(result.success);
        assert!(result.redeemed_reservation);
        assert_eq!(result.new_usage, Some(3));
        assert_eq!(result.remaining_usage, Some(7));
        assert!(fx.engine.reservations().is_empty());
    }

    #[test]
    fn overrun_is_denied_with_exceeded_and_upgrade_alerts() {
        let fx = fixture();
        assert!(consume(&fx.engine, Feature::CreditScoring, 9).success);

        let check = fx.engine.check_access("cust-1", Feature::CreditScoring, 2, None);
        assert!(!check.allowed);
        assert_eq!(check.reason, Some(DenialReason::QuotaExceeded));
        assert_eq!(check.suggested_plan_id.as_deref(), Some("pro"));
        assert!(check.reservation.is_none());

        let result = consume(&fx.engine, Feature::CreditScoring, 2);
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("usage limit exceeded"));

        let limit = fx.store.find_limit("cust-1", Feature::CreditScoring).unwrap().unwrap();
        assert_eq!(limit.current_usage, 9);
        assert_eq!(alerts_of(&fx.store, AlertType::LimitExceeded), 2);
        assert_eq!(alerts_of(&fx.store, AlertType::UpgradeSuggested), 2);

        let history = fx.engine.consumption_history("cust-1", 10).unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history[0].success);
        assert!(history[1].success);
    }

    #[test]
    fn warning_fires_once_per_period() {
        let fx = fixture();
        assert!(consume(&fx.engine, Feature::AiAssistant, 81).success);
        assert_eq!(alerts_of(&fx.store, AlertType::Warning), 1);

        assert!(consume(&fx.engine, Feature::AiAssistant, 4).success);
        assert_eq!(alerts_of(&fx.store, AlertType::Warning), 1);
    }

    #[test]
    fn reaching_the_limit_exactly_raises_limit_reached() {
        let fx = fixture();
        let result = consume(&fx.engine, Feature::CreditScoring, 10);
        assert!(result.success);
        assert_eq!(result.remaining_usage, Some(0));
        assert_eq!(alerts_of(&fx.store, AlertType::LimitReached), 1);
    }

    #[test]
    fn plan_change_supersedes_every_row() {
        let fx = fixture();
        assert!(consume(&fx.engine, Feature::CreditScoring, 4).success);

        let activation = fx
            .engine
            .update_customer_feature_limits("cust-1", "sub-2", "pro")
            .unwrap();
        assert_eq!(activation.superseded, 2);
        assert_eq!(
            activation.activated,
            vec![Feature::CreditScoring, Feature::FinancialForecast]
        );

        let summary = fx.engine.usage_summary("cust-1").unwrap();
        assert_eq!(summary.len(), 2);
        assert!(summary.iter().all(|usage| usage.is_active && usage.current_usage == 0));

        let ai = fx.engine.check_access("cust-1", Feature::AiAssistant, 1, None);
        assert_eq!(ai.reason, Some(DenialReason::NotInPlan));

        let scoring = fx.engine.check_access("cust-1", Feature::CreditScoring, 1_000, None);
        assert!(scoring.allowed);
        assert_eq!(scoring.remaining_usage, None);
        assert_eq!(scoring.usage_percentage, 0.0);
    }

    #[test]
    fn unknown_plan_is_an_error() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.update_customer_feature_limits("cust-1", "sub-1", "platinum"),
            Err(MeteringError::UnknownPlan(_))
        ));
    }

    #[test]
    fn disabled_and_missing_features_are_denied() {
        let fx = fixture();
        let export = fx.engine.check_access("cust-1", Feature::ReportExport, 1, None);
        assert_eq!(export.reason, Some(DenialReason::NotInPlan));

        assert!(fx
            .engine
            .set_feature_enabled("cust-1", Feature::CreditScoring, false)
            .unwrap());
        let scoring = consume(&fx.engine, Feature::CreditScoring, 1);
        assert_eq!(scoring.reason, Some(DenialReason::FeatureDisabled));
        assert_eq!(scoring.error_message.as_deref(), Some("feature disabled"));

        fx.engine
            .set_feature_enabled("cust-1", Feature::CreditScoring, true)
            .unwrap();
        assert!(consume(&fx.engine, Feature::CreditScoring, 1).success);
    }

    #[test]
    fn invalid_requests_leave_no_record() {
        let fx = fixture();
        let zero = consume(&fx.engine, Feature::CreditScoring, 0);
        assert!(matches!(zero.reason, Some(DenialReason::InvalidRequest(_))));
        assert!(zero.record_id.is_none());

        let mismatched = fx.engine.consume_feature(
            ConsumptionRequest::new("cust-1", Feature::CreditScoring, 1, "docs", "analyze")
                .with_context(ConsumptionContext::DocumentAnalysis {
                    document_type: "pdf".to_string(),
                    page_count: 3,
                }),
        );
        assert!(matches!(mismatched.reason, Some(DenialReason::InvalidRequest(_))));

        assert!(fx.engine.consumption_history("cust-1", 10).unwrap().is_empty());
    }

    #[test]
    fn oversized_amounts_are_invalid_even_when_unlimited() {
        let fx = fixture();
        fx.engine
            .update_customer_feature_limits("cust-1", "sub-1", "pro")
            .unwrap();
        assert!(consume(&fx.engine, Feature::CreditScoring, 5).success);

        for amount in [u64::MAX, MAX_AMOUNT + 1] {
            let check = fx.engine.check_access("cust-1", Feature::CreditScoring, amount, None);
            assert!(!check.allowed);
            assert!(matches!(check.reason, Some(DenialReason::InvalidRequest(_))));
            assert!(check.consumption_token().is_none());

            let result = consume(&fx.engine, Feature::CreditScoring, amount);
            assert!(!result.success);
            assert!(result.record_id.is_none());
            assert_eq!(result.new_usage, None);
            assert_eq!(result.reason.as_ref().map(DenialReason::code), Some("invalid_request"));
        }

        let limit = fx.store.find_limit("cust-1", Feature::CreditScoring).unwrap().unwrap();
        assert_eq!(limit.current_usage, 5);
        assert_eq!(fx.engine.consumption_history("cust-1", 10).unwrap().len(), 1);
        assert!(fx.engine.reservations().is_empty());
    }

    #[test]
    fn unlimited_usage_stops_at_storage_ceiling() {
        let fx = fixture();
        fx.engine
            .update_customer_feature_limits("cust-1", "sub-1", "pro")
            .unwrap();
        assert!(consume(&fx.engine, Feature::CreditScoring, 5).success);

        let result = consume(&fx.engine, Feature::CreditScoring, MAX_AMOUNT);
        assert!(!result.success);
        assert_eq!(result.reason, Some(DenialReason::QuotaExceeded));

        let limit = fx.store.find_limit("cust-1", Feature::CreditScoring).unwrap().unwrap();
        assert_eq!(limit.current_usage, 5);
    }

    #[test]
    fn mismatched_token_falls_back_to_revalidation() {
        let fx = fixture();
        let check = fx.engine.check_access("cust-1", Feature::CreditScoring, 2, None);
        let token = check.consumption_token().unwrap().to_string();

        let result = fx.engine.consume_feature(
            ConsumptionRequest::new("cust-1", Feature::CreditScoring, 3, "scoring-service", "score")
                .with_token(token),
        );
        assert!(result.success);
        assert!(!result.redeemed_reservation);
        assert_eq!(fx.engine.reservations().len(), 1);
    }

    #[test]
    fn reset_zeroes_selected_counters() {
        let fx = fixture();
        assert!(consume(&fx.engine, Feature::CreditScoring, 5).success);
        assert!(consume(&fx.engine, Feature::AiAssistant, 90).success);

        let reset = fx
            .engine
            .reset_feature_counters("cust-1", ResetType::Manual, Some(&[Feature::AiAssistant]))
            .unwrap();
        assert_eq!(reset, 1);

        let ai = fx.store.find_limit("cust-1", Feature::AiAssistant).unwrap().unwrap();
        assert_eq!(ai.current_usage, 0);
        assert!(!ai.warning_sent);
        let scoring = fx.store.find_limit("cust-1", Feature::CreditScoring).unwrap().unwrap();
        assert_eq!(scoring.current_usage, 5);

        fx.engine
            .reset_feature_counters("cust-1", ResetType::Upgrade, None)
            .unwrap();
        let scoring = fx.store.find_limit("cust-1", Feature::CreditScoring).unwrap().unwrap();
        assert_eq!(scoring.current_usage, 0);
    }

    #[test]
    fn elapsed_period_is_rolled_lazily() {
        let fx = fixture();
        assert!(consume(&fx.engine, Feature::CreditScoring, 10).success);

        let last_month = Utc::now() - chrono::Duration::days(40);
        let limit = fx.store.find_limit("cust-1", Feature::CreditScoring).unwrap().unwrap();
        fx.store
            .roll_limit_period(
                limit.id,
                &limit.usage_period,
                &PeriodType::Monthly.period_key(last_month),
                PeriodType::Monthly.next_reset_at(last_month),
            )
            .unwrap();
        fx.store.try_increment_usage(limit.id, 10, last_month).unwrap();

        let check = fx.engine.check_access("cust-1", Feature::CreditScoring, 1, None);
        assert!(check.allowed);
        assert_eq!(check.current_usage, Some(0));
    }

    #[tokio::test]
    async fn consumption_is_published() {
        let fx = fixture();
        let mut events = fx.bus.subscribe();
        assert!(consume(&fx.engine, Feature::CreditScoring, 2).success);

        match events.recv().await.unwrap() {
            DomainEvent::FeatureConsumption(event) => {
                assert_eq!(event.amount, 2);
                assert_eq!(event.new_usage, 2);
                assert_eq!(event.remaining_usage, Some(8));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn alerts_can_be_resolved() {
        let fx = fixture();
        assert!(consume(&fx.engine, Feature::CreditScoring, 8).success);
        let open = fx.engine.alerts("cust-1", true).unwrap();
        assert_eq!(open.len(), 1);

        assert!(fx.engine.resolve_alert(&open[0].id).unwrap());
        assert!(!fx.engine.resolve_alert(&open[0].id).unwrap());
        assert!(fx.engine.alerts("cust-1", true).unwrap().is_empty());
    }
}
