use chrono::{DateTime, Utc};

use crate::feature::Feature;

pub mod database;
pub mod error;
pub mod records;
pub mod schema;

pub use database::SqliteStore;
pub use error::StorageError;
pub use records::{
    AlertRecord, AlertType, ConsumptionRecord, CustomerPlan, NewQuotaLimit, PeriodUsage,
    QuotaLimit, TokenBalance, TokenCredit, TokenDebit, TokenTransaction, TokenTransactionKind,
};

pub const METERING_DB_FILENAME: &str = "metering.db";

/// Repository contract the metering engines run against.
///
/// Every counter mutation is a compare-and-swap evaluated by the store, so two
/// callers racing on the same `(customer, feature)` or `(customer, period)`
/// key serialize there and neither can push a counter past its bound.
pub trait MeteringStore: Send + Sync {
    /// Current (non-superseded) quota row, active or suspended.
    fn find_limit(
        &self,
        customer_id: &str,
        feature: Feature,
    ) -> Result<Option<QuotaLimit>, StorageError>;

    fn list_limits(&self, customer_id: &str) -> Result<Vec<QuotaLimit>, StorageError>;

    /// Supersedes every current row for the customer and inserts `limits`
    /// in one transaction. Returns the number of rows superseded.
    fn replace_limits(
        &self,
        plan: &CustomerPlan,
        limits: &[NewQuotaLimit],
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError>;

    fn customer_plan(&self, customer_id: &str) -> Result<Option<CustomerPlan>, StorageError>;

    fn list_customer_plans(&self) -> Result<Vec<CustomerPlan>, StorageError>;

    fn set_limit_active(
        &self,
        customer_id: &str,
        feature: Feature,
        active: bool,
    ) -> Result<bool, StorageError>;

    /// Adds `amount` to the row only if it stays within the limit, and bumps
    /// the period usage counter. `None` means the guard rejected the update.
    fn try_increment_usage(
        &self,
        limit_id: i64,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaLimit>, StorageError>;

    /// Flips `warning_sent` from false to true. Returns whether this call did it.
    fn mark_warning_sent(&self, limit_id: i64) -> Result<bool, StorageError>;

    fn reset_usage(
        &self,
        customer_id: &str,
        features: Option<&[Feature]>,
    ) -> Result<usize, StorageError>;

    /// Moves the row into a new period if it is still in `expected_period`.
    fn roll_limit_period(
        &self,
        limit_id: i64,
        expected_period: &str,
        usage_period: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    fn limits_due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<QuotaLimit>, StorageError>;

    fn period_usage(
        &self,
        customer_id: &str,
        feature: Feature,
        usage_period: &str,
    ) -> Result<Option<PeriodUsage>, StorageError>;

    fn record_consumption(&self, record: &ConsumptionRecord) -> Result<(), StorageError>;

    fn consumption_history(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<ConsumptionRecord>, StorageError>;

    fn record_alert(&self, alert: &AlertRecord) -> Result<(), StorageError>;

    fn list_alerts(
        &self,
        customer_id: &str,
        unresolved_only: bool,
    ) -> Result<Vec<AlertRecord>, StorageError>;

    fn resolve_alert(&self, alert_id: &str) -> Result<bool, StorageError>;

    fn find_balance(
        &self,
        customer_id: &str,
        period: &str,
    ) -> Result<Option<TokenBalance>, StorageError>;

    /// Most recent balance strictly before `period`.
    fn latest_balance_before(
        &self,
        customer_id: &str,
        period: &str,
    ) -> Result<Option<TokenBalance>, StorageError>;

    /// Inserts the balance and its opening transactions unless a row for the
    /// same `(customer, period)` exists. Returns whether the insert happened.
    fn insert_balance_if_absent(
        &self,
        balance: &TokenBalance,
        transactions: &[TokenTransaction],
    ) -> Result<bool, StorageError>;

    fn debit_tokens(
        &self,
        customer_id: &str,
        period: &str,
        amount: u64,
        feature: Option<Feature>,
        now: DateTime<Utc>,
    ) -> Result<TokenDebit, StorageError>;

    /// `None` when no balance exists for the period.
    fn credit_tokens(
        &self,
        customer_id: &str,
        period: &str,
        credit: &TokenCredit,
        now: DateTime<Utc>,
    ) -> Result<Option<(TokenBalance, TokenTransaction)>, StorageError>;

    fn token_transactions(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<TokenTransaction>, StorageError>;
}
