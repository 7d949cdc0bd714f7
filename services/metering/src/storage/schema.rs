use rusqlite::Connection;

pub const QUOTA_LIMITS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quota_limits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    customer_id TEXT NOT NULL,
    subscription_id TEXT NOT NULL,
    plan_id TEXT NOT NULL,
    feature TEXT NOT NULL,
    limit_value INTEGER NOT NULL,
    current_usage INTEGER NOT NULL DEFAULT 0,
    period_type TEXT NOT NULL,
    usage_period TEXT NOT NULL,
    reset_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    warning_threshold INTEGER NOT NULL,
    warning_sent INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    superseded_at TEXT,
    CHECK (current_usage >= 0),
    CHECK (limit_value = -1 OR current_usage <= limit_value)
);
"#;

pub const QUOTA_LIMITS_INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_limits_one_active
    ON quota_limits(customer_id, feature) WHERE is_active = 1;
CREATE UNIQUE INDEX IF NOT EXISTS idx_limits_one_current
    ON quota_limits(customer_id, feature) WHERE superseded_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_limits_reset_at ON quota_limits(reset_at);
"#;

pub const FEATURE_USAGE_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feature_usage (
    customer_id TEXT NOT NULL,
    feature TEXT NOT NULL,
    usage_period TEXT NOT NULL,
    used INTEGER NOT NULL,
    last_updated TEXT NOT NULL,
    PRIMARY KEY (customer_id, feature, usage_period)
);
"#;

pub const CUSTOMER_PLANS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS customer_plans (
    customer_id TEXT PRIMARY KEY,
    subscription_id TEXT NOT NULL,
    plan_id TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub const TOKEN_BALANCES_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS token_balances (
    customer_id TEXT NOT NULL,
    period TEXT NOT NULL,
    monthly_allocation INTEGER NOT NULL,
    purchased_tokens INTEGER NOT NULL DEFAULT 0,
    bonus_tokens INTEGER NOT NULL DEFAULT 0,
    rolled_over_tokens INTEGER NOT NULL DEFAULT 0,
    rollover_depth INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL,
    used_tokens INTEGER NOT NULL DEFAULT 0,
    remaining_tokens INTEGER NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (customer_id, period),
    CHECK (remaining_tokens >= 0),
    CHECK (remaining_tokens = total_tokens - used_tokens)
);
"#;

pub const TOKEN_TRANSACTIONS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS token_transactions (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    period TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    balance_before INTEGER NOT NULL,
    balance_after INTEGER NOT NULL,
    feature TEXT,
    related_entity_id TEXT,
    cost_usd REAL,
    created_at TEXT NOT NULL
);
"#;

pub const CONSUMPTION_RECORDS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS consumption_records (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    feature TEXT NOT NULL,
    amount INTEGER NOT NULL,
    service_name TEXT NOT NULL,
    action_type TEXT NOT NULL,
    resource_id TEXT,
    context TEXT,
    success INTEGER NOT NULL,
    error_message TEXT,
    consumed_at TEXT NOT NULL
);
"#;

pub const FEATURE_ALERTS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feature_alerts (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    feature TEXT NOT NULL,
    alert_type TEXT NOT NULL,
    current_usage INTEGER NOT NULL,
    limit_value INTEGER NOT NULL,
    usage_percentage REAL NOT NULL,
    suggested_plan_id TEXT,
    resolved INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

pub const LEDGER_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_consumption_customer_time ON consumption_records(customer_id, consumed_at);
CREATE INDEX IF NOT EXISTS idx_alerts_customer ON feature_alerts(customer_id, resolved);
CREATE INDEX IF NOT EXISTS idx_token_tx_customer_time ON token_transactions(customer_id, created_at);
"#;

pub fn init_database(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(QUOTA_LIMITS_TABLE_SCHEMA)?;
    conn.execute_batch(QUOTA_LIMITS_INDEXES)?;
    conn.execute_batch(FEATURE_USAGE_TABLE_SCHEMA)?;
    conn.execute_batch(CUSTOMER_PLANS_TABLE_SCHEMA)?;
    conn.execute_batch(TOKEN_BALANCES_TABLE_SCHEMA)?;
    conn.execute_batch(TOKEN_TRANSACTIONS_TABLE_SCHEMA)?;
    conn.execute_batch(CONSUMPTION_RECORDS_TABLE_SCHEMA)?;
    conn.execute_batch(FEATURE_ALERTS_TABLE_SCHEMA)?;
    conn.execute_batch(LEDGER_INDEXES)?;
    Ok(())
}
