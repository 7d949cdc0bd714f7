use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::feature::{ConsumptionContext, Feature};
use crate::usage::{UsageLimit, MAX_AMOUNT};

use super::error::StorageError;
use super::records::{
    AlertRecord, ConsumptionRecord, CustomerPlan, NewQuotaLimit, PeriodUsage, QuotaLimit,
    TokenBalance, TokenCredit, TokenDebit, TokenTransaction, TokenTransactionKind,
};
use super::schema::init_database;
use super::{MeteringStore, METERING_DB_FILENAME};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const LIMIT_COLUMNS: &str = "id, customer_id, subscription_id, plan_id, feature, limit_value, \
    current_usage, period_type, usage_period, reset_at, is_active, warning_threshold, \
    warning_sent, created_at, superseded_at";

const BALANCE_COLUMNS: &str = "customer_id, period, monthly_allocation, purchased_tokens, \
    bonus_tokens, rolled_over_tokens, rollover_depth, total_tokens, used_tokens, \
    remaining_tokens, period_start, period_end, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, customer_id, period, kind, amount, balance_before, \
    balance_after, feature, related_entity_id, cost_usd, created_at";

const CONSUMPTION_COLUMNS: &str = "id, customer_id, feature, amount, service_name, action_type, \
    resource_id, context, success, error_message, consumed_at";

const ALERT_COLUMNS: &str = "id, customer_id, feature, alert_type, current_usage, limit_value, \
    usage_percentage, suggested_plan_id, resolved, created_at";

/// SQLite-backed metering store. One connection, serialized by a mutex;
/// counter updates additionally run in immediate transactions so other
/// processes sharing the file queue behind the write lock.
pub struct SqliteStore {
    data_dir: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(data_dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&data_dir)?;
        let db_path = data_dir.join(METERING_DB_FILENAME);
        let is_new = !db_path.exists();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_database(&conn)?;

        if is_new {
            info!(path = %db_path.display(), "initialized metering database");
        }

        Ok(Self {
            data_dir: Some(data_dir),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        init_database(&conn)?;
        Ok(Self {
            data_dir: None,
            conn: Mutex::new(conn),
        })
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::ConnectionPoisoned)
    }
}

impl MeteringStore for SqliteStore {
    fn find_limit(
        &self,
        customer_id: &str,
        feature: Feature,
    ) -> Result<Option<QuotaLimit>, StorageError> {
        let conn = self.lock()?;
        select_current_limit(&conn, customer_id, feature)
    }

    fn list_limits(&self, customer_id: &str) -> Result<Vec<QuotaLimit>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LIMIT_COLUMNS} FROM quota_limits \
             WHERE customer_id = ?1 AND superseded_at IS NULL ORDER BY feature"
        ))?;
        let rows = stmt.query_map(params![customer_id], map_limit)?;

        let mut limits = Vec::new();
        for row in rows {
            limits.push(row?);
        }
        Ok(limits)
    }

    fn replace_limits(
        &self,
        plan: &CustomerPlan,
        limits: &[NewQuotaLimit],
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let superseded = tx.execute(
            r#"
            UPDATE quota_limits
            SET is_active = 0, superseded_at = ?2
            WHERE customer_id = ?1 AND superseded_at IS NULL
            "#,
            params![plan.customer_id, now],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO quota_limits (
                    customer_id, subscription_id, plan_id, feature, limit_value,
                    current_usage, period_type, usage_period, reset_at, is_active,
                    warning_threshold, warning_sent, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, 1, ?9, 0, ?10)
                "#,
            )?;

            for limit in limits {
                stmt.execute(params![
                    plan.customer_id,
                    plan.subscription_id,
                    plan.plan_id,
                    limit.feature.as_str(),
                    limit.limit_value.as_i64(),
                    limit.period_type.as_str(),
                    limit.usage_period,
                    limit.reset_at,
                    i64::from(limit.warning_threshold),
                    now,
                ])?;
            }
        }

        tx.execute(
            r#"
            INSERT INTO customer_plans (customer_id, subscription_id, plan_id, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(customer_id) DO UPDATE SET
                subscription_id = excluded.subscription_id,
                plan_id = excluded.plan_id,
                updated_at = excluded.updated_at
            "#,
            params![plan.customer_id, plan.subscription_id, plan.plan_id, plan.updated_at],
        )?;

        tx.commit()?;
        debug!(
            customer_id = %plan.customer_id,
            superseded,
            inserted = limits.len(),
            "replaced quota limits"
        );
        Ok(superseded)
    }

    fn customer_plan(&self, customer_id: &str) -> Result<Option<CustomerPlan>, StorageError> {
        let conn = self.lock()?;
        let plan = conn
            .query_row(
                r#"
                SELECT customer_id, subscription_id, plan_id, updated_at
                FROM customer_plans
                WHERE customer_id = ?1
                "#,
                params![customer_id],
                map_customer_plan,
            )
            .optional()?;
        Ok(plan)
    }

    fn list_customer_plans(&self) -> Result<Vec<CustomerPlan>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT customer_id, subscription_id, plan_id, updated_at
            FROM customer_plans
            ORDER BY customer_id
            "#,
        )?;
        let rows = stmt.query_map([], map_customer_plan)?;

        let mut plans = Vec::new();
        for row in rows {
            plans.push(row?);
        }
        Ok(plans)
    }

    fn set_limit_active(
        &self,
        customer_id: &str,
        feature: Feature,
        active: bool,
    ) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE quota_limits
            SET is_active = ?3
            WHERE customer_id = ?1 AND feature = ?2 AND superseded_at IS NULL
            "#,
            params![customer_id, feature.as_str(), active],
        )?;
        Ok(changed > 0)
    }

    fn try_increment_usage(
        &self,
        limit_id: i64,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaLimit>, StorageError> {
        let amount = to_sql(amount)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            r#"
            UPDATE quota_limits
            SET current_usage = current_usage + ?2
            WHERE id = ?1
              AND is_active = 1
              AND superseded_at IS NULL
              AND ?2 <= ?3 - current_usage
              AND (limit_value = -1 OR current_usage + ?2 <= limit_value)
            "#,
            params![limit_id, amount, i64::MAX],
        )?;

        if changed == 0 {
            return Ok(None);
        }

        let updated = tx.query_row(
            &format!("SELECT {LIMIT_COLUMNS} FROM quota_limits WHERE id = ?1"),
            params![limit_id],
            map_limit,
        )?;

        tx.execute(
            r#"
            INSERT INTO feature_usage (customer_id, feature, usage_period, used, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(customer_id, feature, usage_period) DO UPDATE SET
                used = used + excluded.used,
                last_updated = excluded.last_updated
            "#,
            params![
                updated.customer_id,
                updated.feature.as_str(),
                updated.usage_period,
                amount,
                now,
            ],
        )?;

        tx.commit()?;
        Ok(Some(updated))
    }

    fn mark_warning_sent(&self, limit_id: i64) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE quota_limits SET warning_sent = 1 WHERE id = ?1 AND warning_sent = 0",
            params![limit_id],
        )?;
        Ok(changed == 1)
    }

    fn reset_usage(
        &self,
        customer_id: &str,
        features: Option<&[Feature]>,
    ) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let reset = match features {
            None => tx.execute(
                r#"
                UPDATE quota_limits
                SET current_usage = 0, warning_sent = 0
                WHERE customer_id = ?1 AND superseded_at IS NULL
                "#,
                params![customer_id],
            )?,
            Some(features) => {
                let mut total = 0usize;
                let mut stmt = tx.prepare(
                    r#"
                    UPDATE quota_limits
                    SET current_usage = 0, warning_sent = 0
                    WHERE customer_id = ?1 AND feature = ?2 AND superseded_at IS NULL
                    "#,
                )?;
                for feature in features {
                    total += stmt.execute(params![customer_id, feature.as_str()])?;
                }
                total
            }
        };

        tx.commit()?;
        Ok(reset)
    }

    fn roll_limit_period(
        &self,
        limit_id: i64,
        expected_period: &str,
        usage_period: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE quota_limits
            SET current_usage = 0, warning_sent = 0, usage_period = ?3, reset_at = ?4
            WHERE id = ?1 AND usage_period = ?2 AND superseded_at IS NULL
            "#,
            params![limit_id, expected_period, usage_period, reset_at],
        )?;
        Ok(changed == 1)
    }

    fn limits_due_for_reset(&self, now: DateTime<Utc>) -> Result<Vec<QuotaLimit>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LIMIT_COLUMNS} FROM quota_limits \
             WHERE superseded_at IS NULL AND reset_at <= ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![now], map_limit)?;

        let mut limits = Vec::new();
        for row in rows {
            limits.push(row?);
        }
        Ok(limits)
    }

    fn period_usage(
        &self,
        customer_id: &str,
        feature: Feature,
        usage_period: &str,
    ) -> Result<Option<PeriodUsage>, StorageError> {
        let conn = self.lock()?;
        let usage = conn
            .query_row(
                r#"
                SELECT customer_id, feature, usage_period, used, last_updated
                FROM feature_usage
                WHERE customer_id = ?1 AND feature = ?2 AND usage_period = ?3
                "#,
                params![customer_id, feature.as_str(), usage_period],
                |row| {
                    Ok(PeriodUsage {
                        customer_id: row.get(0)?,
                        feature: text_column(row, 1)?,
                        usage_period: row.get(2)?,
                        used: count_column(row, 3)?,
                        last_updated: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(usage)
    }

    fn record_consumption(&self, record: &ConsumptionRecord) -> Result<(), StorageError> {
        let context = record
            .context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let amount = to_sql(record.amount)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO consumption_records (
                id, customer_id, feature, amount, service_name, action_type,
                resource_id, context, success, error_message, consumed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id,
                record.customer_id,
                record.feature.as_str(),
                amount,
                record.service_name,
                record.action_type,
                record.resource_id,
                context,
                record.success,
                record.error_message,
                record.consumed_at,
            ],
        )?;
        Ok(())
    }

    fn consumption_history(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<ConsumptionRecord>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONSUMPTION_COLUMNS} FROM consumption_records \
             WHERE customer_id = ?1 ORDER BY consumed_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![customer_id, row_limit(limit)], map_consumption)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn record_alert(&self, alert: &AlertRecord) -> Result<(), StorageError> {
        let current_usage = to_sql(alert.current_usage)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO feature_alerts (
                id, customer_id, feature, alert_type, current_usage, limit_value,
                usage_percentage, suggested_plan_id, resolved, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                alert.id,
                alert.customer_id,
                alert.feature.as_str(),
                alert.alert_type.as_str(),
                current_usage,
                alert.limit_value.as_i64(),
                alert.usage_percentage,
                alert.suggested_plan_id,
                alert.resolved,
                alert.created_at,
            ],
        )?;
        Ok(())
    }

    fn list_alerts(
        &self,
        customer_id: &str,
        unresolved_only: bool,
    ) -> Result<Vec<AlertRecord>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM feature_alerts \
             WHERE customer_id = ?1 AND (?2 = 0 OR resolved = 0) \
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![customer_id, unresolved_only], map_alert)?;

        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }

    fn resolve_alert(&self, alert_id: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE feature_alerts SET resolved = 1 WHERE id = ?1 AND resolved = 0",
            params![alert_id],
        )?;
        Ok(changed == 1)
    }

    fn find_balance(
        &self,
        customer_id: &str,
        period: &str,
    ) -> Result<Option<TokenBalance>, StorageError> {
        let conn = self.lock()?;
        select_balance(&conn, customer_id, period)
    }

    fn latest_balance_before(
        &self,
        customer_id: &str,
        period: &str,
    ) -> Result<Option<TokenBalance>, StorageError> {
        let conn = self.lock()?;
        let balance = conn
            .query_row(
                &format!(
                    "SELECT {BALANCE_COLUMNS} FROM token_balances \
                     WHERE customer_id = ?1 AND period < ?2 ORDER BY period DESC LIMIT 1"
                ),
                params![customer_id, period],
                map_balance,
            )
            .optional()?;
        Ok(balance)
    }

    fn insert_balance_if_absent(
        &self,
        balance: &TokenBalance,
        transactions: &[TokenTransaction],
    ) -> Result<bool, StorageError> {
        if !balance.is_consistent() {
            return Err(StorageError::InvalidValue(format!(
                "balance for {} {} does not satisfy remaining = total - used",
                balance.customer_id, balance.current_period
            )));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            r#"
            INSERT INTO token_balances (
                customer_id, period, monthly_allocation, purchased_tokens, bonus_tokens,
                rolled_over_tokens, rollover_depth, total_tokens, used_tokens,
                remaining_tokens, period_start, period_end, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(customer_id, period) DO NOTHING
            "#,
            params![
                balance.customer_id,
                balance.current_period,
                to_sql(balance.monthly_allocation)?,
                to_sql(balance.purchased_tokens)?,
                to_sql(balance.bonus_tokens)?,
                to_sql(balance.rolled_over_tokens)?,
                i64::from(balance.rollover_depth),
                to_sql(balance.total_tokens)?,
                to_sql(balance.used_tokens)?,
                to_sql(balance.remaining_tokens)?,
                balance.period_start,
                balance.period_end,
                balance.created_at,
                balance.updated_at,
            ],
        )?;

        if inserted == 0 {
            return Ok(false);
        }

        for transaction in transactions {
            insert_transaction(&tx, transaction)?;
        }

        tx.commit()?;
        Ok(true)
    }

    fn debit_tokens(
        &self,
        customer_id: &str,
        period: &str,
        amount: u64,
        feature: Option<Feature>,
        now: DateTime<Utc>,
    ) -> Result<TokenDebit, StorageError> {
        let delta = to_sql(amount)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(before) = select_balance(&tx, customer_id, period)? else {
            return Ok(TokenDebit::MissingBalance);
        };

        if before.remaining_tokens < amount {
            return Ok(TokenDebit::Insufficient {
                remaining: before.remaining_tokens,
            });
        }

        let changed = tx.execute(
            r#"
            UPDATE token_balances
            SET used_tokens = used_tokens + ?3,
                remaining_tokens = remaining_tokens - ?3,
                updated_at = ?4
            WHERE customer_id = ?1 AND period = ?2 AND remaining_tokens >= ?3
            "#,
            params![customer_id, period, delta, now],
        )?;

        if changed == 0 {
            return Ok(TokenDebit::Insufficient {
                remaining: before.remaining_tokens,
            });
        }

        let balance = select_balance(&tx, customer_id, period)?.ok_or_else(|| {
            StorageError::InvalidValue(format!("balance {customer_id}/{period} vanished"))
        })?;

        let transaction = TokenTransaction {
            id: Uuid::new_v4().to_string(),
            customer_id: customer_id.to_string(),
            period: period.to_string(),
            kind: TokenTransactionKind::Consumption,
            amount,
            balance_before: before.remaining_tokens,
            balance_after: balance.remaining_tokens,
            feature,
            related_entity_id: None,
            cost_usd: None,
            created_at: now,
        };
        insert_transaction(&tx, &transaction)?;

        tx.commit()?;
        Ok(TokenDebit::Applied {
            balance,
            transaction,
        })
    }

    fn credit_tokens(
        &self,
        customer_id: &str,
        period: &str,
        credit: &TokenCredit,
        now: DateTime<Utc>,
    ) -> Result<Option<(TokenBalance, TokenTransaction)>, StorageError> {
        let column = match credit.kind {
            TokenTransactionKind::Purchase => "purchased_tokens",
            TokenTransactionKind::Bonus => "bonus_tokens",
            TokenTransactionKind::Allocation => "monthly_allocation",
            TokenTransactionKind::Rollover => "rolled_over_tokens",
            TokenTransactionKind::Consumption => {
                return Err(StorageError::InvalidValue(
                    "consumption cannot be applied as a credit".into(),
                ))
            }
        };

        let delta = to_sql(credit.amount)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(before) = select_balance(&tx, customer_id, period)? else {
            return Ok(None);
        };

        let fits = before
            .total_tokens
            .checked_add(credit.amount)
            .is_some_and(|total| total <= MAX_AMOUNT);
        if !fits {
            return Err(StorageError::InvalidValue(format!(
                "crediting {} tokens overflows balance {customer_id}/{period}",
                credit.amount
            )));
        }

        tx.execute(
            &format!(
                "UPDATE token_balances \
                 SET {column} = {column} + ?3, \
                     total_tokens = total_tokens + ?3, \
                     remaining_tokens = remaining_tokens + ?3, \
                     updated_at = ?4 \
                 WHERE customer_id = ?1 AND period = ?2"
            ),
            params![customer_id, period, delta, now],
        )?;

        let balance = select_balance(&tx, customer_id, period)?.ok_or_else(|| {
            StorageError::InvalidValue(format!("balance {customer_id}/{period} vanished"))
        })?;

        let transaction = TokenTransaction {
            id: Uuid::new_v4().to_string(),
            customer_id: customer_id.to_string(),
            period: period.to_string(),
            kind: credit.kind,
            amount: credit.amount,
            balance_before: before.remaining_tokens,
            balance_after: balance.remaining_tokens,
            feature: None,
            related_entity_id: credit.related_entity_id.clone(),
            cost_usd: credit.cost_usd,
            created_at: now,
        };
        insert_transaction(&tx, &transaction)?;

        tx.commit()?;
        Ok(Some((balance, transaction)))
    }

    fn token_transactions(
        &self,
        customer_id: &str,
        limit: usize,
    ) -> Result<Vec<TokenTransaction>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM token_transactions \
             WHERE customer_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![customer_id, row_limit(limit)], map_transaction)?;

        let mut transactions = Vec::new();
        for row in rows {
            transactions.push(row?);
        }
        Ok(transactions)
    }
}

fn select_current_limit(
    conn: &Connection,
    customer_id: &str,
    feature: Feature,
) -> Result<Option<QuotaLimit>, StorageError> {
    let limit = conn
        .query_row(
            &format!(
                "SELECT {LIMIT_COLUMNS} FROM quota_limits \
                 WHERE customer_id = ?1 AND feature = ?2 AND superseded_at IS NULL"
            ),
            params![customer_id, feature.as_str()],
            map_limit,
        )
        .optional()?;
    Ok(limit)
}

fn select_balance(
    conn: &Connection,
    customer_id: &str,
    period: &str,
) -> Result<Option<TokenBalance>, StorageError> {
    let balance = conn
        .query_row(
            &format!(
                "SELECT {BALANCE_COLUMNS} FROM token_balances \
                 WHERE customer_id = ?1 AND period = ?2"
            ),
            params![customer_id, period],
            map_balance,
        )
        .optional()?;
    Ok(balance)
}

fn insert_transaction(conn: &Connection, transaction: &TokenTransaction) -> Result<(), StorageError> {
    conn.execute(
        r#"
        INSERT INTO token_transactions (
            id, customer_id, period, kind, amount, balance_before, balance_after,
            feature, related_entity_id, cost_usd, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            transaction.id,
            transaction.customer_id,
            transaction.period,
            transaction.kind.as_str(),
            to_sql(transaction.amount)?,
            to_sql(transaction.balance_before)?,
            to_sql(transaction.balance_after)?,
            transaction.feature.map(|feature| feature.as_str()),
            transaction.related_entity_id,
            transaction.cost_usd,
            transaction.created_at,
        ],
    )?;
    Ok(())
}

fn map_limit(row: &Row<'_>) -> rusqlite::Result<QuotaLimit> {
    Ok(QuotaLimit {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        subscription_id: row.get(2)?,
        plan_id: row.get(3)?,
        feature: text_column(row, 4)?,
        limit_value: limit_column(row, 5)?,
        current_usage: count_column(row, 6)?,
        period_type: text_column(row, 7)?,
        usage_period: row.get(8)?,
        reset_at: row.get(9)?,
        is_active: row.get(10)?,
        warning_threshold: narrow_column(row, 11)?,
        warning_sent: row.get(12)?,
        created_at: row.get(13)?,
        superseded_at: row.get(14)?,
    })
}

fn map_customer_plan(row: &Row<'_>) -> rusqlite::Result<CustomerPlan> {
    Ok(CustomerPlan {
        customer_id: row.get(0)?,
        subscription_id: row.get(1)?,
        plan_id: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn map_balance(row: &Row<'_>) -> rusqlite::Result<TokenBalance> {
    Ok(TokenBalance {
        customer_id: row.get(0)?,
        current_period: row.get(1)?,
        monthly_allocation: count_column(row, 2)?,
        purchased_tokens: count_column(row, 3)?,
        bonus_tokens: count_column(row, 4)?,
        rolled_over_tokens: count_column(row, 5)?,
        rollover_depth: narrow_column(row, 6)?,
        total_tokens: count_column(row, 7)?,
        used_tokens: count_column(row, 8)?,
        remaining_tokens: count_column(row, 9)?,
        period_start: row.get(10)?,
        period_end: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn map_transaction(row: &Row<'_>) -> rusqlite::Result<TokenTransaction> {
    let feature: Option<String> = row.get(7)?;
    Ok(TokenTransaction {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        period: row.get(2)?,
        kind: text_column(row, 3)?,
        amount: count_column(row, 4)?,
        balance_before: count_column(row, 5)?,
        balance_after: count_column(row, 6)?,
        feature: feature
            .map(|code| parse_text(7, &code))
            .transpose()?,
        related_entity_id: row.get(8)?,
        cost_usd: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn map_consumption(row: &Row<'_>) -> rusqlite::Result<ConsumptionRecord> {
    let context: Option<String> = row.get(7)?;
    let context = match context {
        Some(raw) => Some(serde_json::from_str::<ConsumptionContext>(&raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(err))
        })?),
        None => None,
    };

    Ok(ConsumptionRecord {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        feature: text_column(row, 2)?,
        amount: count_column(row, 3)?,
        service_name: row.get(4)?,
        action_type: row.get(5)?,
        resource_id: row.get(6)?,
        context,
        success: row.get(8)?,
        error_message: row.get(9)?,
        consumed_at: row.get(10)?,
    })
}

fn map_alert(row: &Row<'_>) -> rusqlite::Result<AlertRecord> {
    Ok(AlertRecord {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        feature: text_column(row, 2)?,
        alert_type: text_column(row, 3)?,
        current_usage: count_column(row, 4)?,
        limit_value: limit_column(row, 5)?,
        usage_percentage: row.get(6)?,
        suggested_plan_id: row.get(7)?,
        resolved: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn text_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: String = row.get(idx)?;
    parse_text(idx, &raw)
}

fn parse_text<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.to_string().into()))
}

fn limit_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<UsageLimit> {
    let raw: i64 = row.get(idx)?;
    UsageLimit::try_from(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, err.into()))
}

/// Reads a non-negative counter column.
fn count_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    narrow_column(row, idx)
}

fn narrow_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: TryFrom<i64, Error = std::num::TryFromIntError>,
{
    let raw: i64 = row.get(idx)?;
    T::try_from(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(err))
    })
}

fn to_sql(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidValue(format!("{value} does not fit in an INTEGER column")))
}

fn row_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::PeriodType;
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    fn plan(customer_id: &str, plan_id: &str) -> CustomerPlan {
        CustomerPlan {
            customer_id: customer_id.to_string(),
            subscription_id: format!("sub-{customer_id}"),
            plan_id: plan_id.to_string(),
            updated_at: Utc::now(),
        }
    }

    fn seed(feature: Feature, limit: UsageLimit) -> NewQuotaLimit {
        let now = Utc::now();
        NewQuotaLimit {
            feature,
            limit_value: limit,
            period_type: PeriodType::Monthly,
            usage_period: PeriodType::Monthly.period_key(now),
            reset_at: PeriodType::Monthly.next_reset_at(now),
            warning_threshold: 80,
        }
    }

    #[test]
    fn opens_database_file_in_data_dir() {
        let temp = tempdir().expect("failed to create temp dir");
        let store = SqliteStore::new(temp.path().join("nested")).expect("store should open");
        assert!(temp.path().join("nested").join(METERING_DB_FILENAME).exists());
        assert!(store.data_dir().is_some());

        // Reopening an existing file keeps the schema intact.
        drop(store);
        let store = SqliteStore::new(temp.path().join("nested")).expect("store should reopen");
        assert!(store.list_limits("nobody").unwrap().is_empty());
    }

    #[test]
    fn increment_guard_blocks_overrun() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_limits(
                &plan("cust-1", "starter"),
                &[seed(Feature::CreditScoring, UsageLimit::Capped(3))],
                Utc::now(),
            )
            .unwrap();
        let limit = store.find_limit("cust-1", Feature::CreditScoring).unwrap().unwrap();

        let updated = store.try_increment_usage(limit.id, 2, Utc::now()).unwrap();
        assert_eq!(updated.map(|row| row.current_usage), Some(2));
        assert!(store.try_increment_usage(limit.id, 2, Utc::now()).unwrap().is_none());
        let updated = store.try_increment_usage(limit.id, 1, Utc::now()).unwrap().unwrap();
        assert_eq!(updated.current_usage, 3);

        let usage = store
            .period_usage("cust-1", Feature::CreditScoring, &limit.usage_period)
            .unwrap()
            .unwrap();
        assert_eq!(usage.used, 3);
    }

    #[test]
    fn replace_limits_supersedes_previous_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_limits(
                &plan("cust-2", "starter"),
                &[
                    seed(Feature::DocumentAnalysis, UsageLimit::Capped(10)),
                    seed(Feature::ApiCalls, UsageLimit::Unlimited),
                ],
                Utc::now(),
            )
            .unwrap();
        let superseded = store
            .replace_limits(
                &plan("cust-2", "business"),
                &[seed(Feature::DocumentAnalysis, UsageLimit::Capped(100))],
                Utc::now(),
            )
            .unwrap();

        assert_eq!(superseded, 2);
        let current = store.list_limits("cust-2").unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].plan_id, "business");
        assert!(store.find_limit("cust-2", Feature::ApiCalls).unwrap().is_none());
        assert_eq!(
            store.customer_plan("cust-2").unwrap().map(|p| p.plan_id),
            Some("business".to_string())
        );
    }

    #[test]
    fn warning_flag_flips_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_limits(
                &plan("cust-3", "starter"),
                &[seed(Feature::AiAssistant, UsageLimit::Capped(10))],
                Utc::now(),
            )
            .unwrap();
        let limit = store.find_limit("cust-3", Feature::AiAssistant).unwrap().unwrap();

        assert!(store.mark_warning_sent(limit.id).unwrap());
        assert!(!store.mark_warning_sent(limit.id).unwrap());
    }

    #[test]
    fn roll_limit_period_is_compare_and_swap() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_limits(
                &plan("cust-4", "starter"),
                &[seed(Feature::ReportExport, UsageLimit::Capped(10))],
                Utc::now(),
            )
            .unwrap();
        let limit = store.find_limit("cust-4", Feature::ReportExport).unwrap().unwrap();
        store.try_increment_usage(limit.id, 4, Utc::now()).unwrap();

        let next_reset = limit.reset_at + ChronoDuration::days(31);
        assert!(store
            .roll_limit_period(limit.id, &limit.usage_period, "next", next_reset)
            .unwrap());
        assert!(!store
            .roll_limit_period(limit.id, &limit.usage_period, "next", next_reset)
            .unwrap());

        let rolled = store.find_limit("cust-4", Feature::ReportExport).unwrap().unwrap();
        assert_eq!(rolled.current_usage, 0);
        assert_eq!(rolled.usage_period, "next");
    }

    #[test]
    fn consumption_records_keep_typed_context() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = ConsumptionRecord {
            id: Uuid::new_v4().to_string(),
            customer_id: "cust-5".into(),
            feature: Feature::DocumentAnalysis,
            amount: 1,
            service_name: "ocr".into(),
            action_type: "analyze".into(),
            resource_id: Some("doc-9".into()),
            context: Some(ConsumptionContext::DocumentAnalysis {
                document_type: "invoice".into(),
                page_count: 3,
            }),
            success: true,
            error_message: None,
            consumed_at: Utc::now(),
        };
        store.record_consumption(&record).unwrap();

        let history = store.consumption_history("cust-5", 10).unwrap();
        assert_eq!(history, vec![record]);
    }

    fn balance(customer_id: &str, allocation: u64) -> TokenBalance {
        let now = Utc::now();
        TokenBalance {
            customer_id: customer_id.to_string(),
            current_period: "2025-03".to_string(),
            monthly_allocation: allocation,
            purchased_tokens: 0,
            bonus_tokens: 0,
            rolled_over_tokens: 0,
            rollover_depth: 0,
            total_tokens: allocation,
            used_tokens: 0,
            remaining_tokens: allocation,
            period_start: now,
            period_end: now + ChronoDuration::days(31),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn oversized_increment_is_refused_without_wrapping() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_limits(
                &plan("cust-6", "enterprise"),
                &[seed(Feature::ApiCalls, UsageLimit::Unlimited)],
                Utc::now(),
            )
            .unwrap();
        let limit = store.find_limit("cust-6", Feature::ApiCalls).unwrap().unwrap();
        store.try_increment_usage(limit.id, 5, Utc::now()).unwrap();

        let err = store.try_increment_usage(limit.id, u64::MAX, Utc::now()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidValue(_)));
        assert!(store.try_increment_usage(limit.id, MAX_AMOUNT, Utc::now()).unwrap().is_none());

        let current = store.find_limit("cust-6", Feature::ApiCalls).unwrap().unwrap();
        assert_eq!(current.current_usage, 5);
        let usage = store
            .period_usage("cust-6", Feature::ApiCalls, &limit.usage_period)
            .unwrap()
            .unwrap();
        assert_eq!(usage.used, 5);
    }

    #[test]
    fn oversized_credit_leaves_balance_untouched() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.insert_balance_if_absent(&balance("cust-7", 100), &[]).unwrap());

        for amount in [u64::MAX, MAX_AMOUNT] {
            let credit = TokenCredit {
                kind: TokenTransactionKind::Purchase,
                amount,
                related_entity_id: None,
                cost_usd: None,
            };
            let err = store
                .credit_tokens("cust-7", "2025-03", &credit, Utc::now())
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidValue(_)));
        }

        let current = store.find_balance("cust-7", "2025-03").unwrap().unwrap();
        assert_eq!(current.total_tokens, 100);
        assert_eq!(current.purchased_tokens, 0);
        assert_eq!(current.remaining_tokens, 100);
        assert!(store.token_transactions("cust-7", 10).unwrap().is_empty());

        let err = store
            .debit_tokens("cust-7", "2025-03", u64::MAX, None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidValue(_)));
    }

    #[test]
    fn negative_counter_fails_to_read() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = ConsumptionRecord {
            id: Uuid::new_v4().to_string(),
            customer_id: "cust-8".into(),
            feature: Feature::ApiCalls,
            amount: 1,
            service_name: "gateway".into(),
            action_type: "call".into(),
            resource_id: None,
            context: None,
            success: true,
            error_message: None,
            consumed_at: Utc::now(),
        };
        store.record_consumption(&record).unwrap();
        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE consumption_records SET amount = -1 WHERE id = ?1",
                params![record.id],
            )
            .unwrap();

        let err = store.consumption_history("cust-8", 10).unwrap_err();
        assert!(matches!(
            err,
            StorageError::DatabaseError(rusqlite::Error::FromSqlConversionFailure(3, Type::Integer, _))
        ));
    }
}
