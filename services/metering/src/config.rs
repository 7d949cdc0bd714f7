use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::reservation::{DEFAULT_RESERVATION_TTL_SECS, DEFAULT_SWEEP_INTERVAL_SECS};

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub data_dir: PathBuf,
    pub plan_catalog_path: PathBuf,
    pub reservation_ttl_secs: u64,
    pub reservation_sweep_interval_secs: u64,
    pub rollover_interval_secs: u64,
    pub default_warning_threshold: u8,
    pub enable_auto_reset: bool,
    pub event_channel_capacity: usize,
    pub log_level: String,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/metering"),
            plan_catalog_path: PathBuf::from("config/plans.json"),
            reservation_ttl_secs: DEFAULT_RESERVATION_TTL_SECS,
            reservation_sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            rollover_interval_secs: 3_600,
            default_warning_threshold: 80,
            enable_auto_reset: true,
            event_channel_capacity: 1_024,
            log_level: "info".to_string(),
        }
    }
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(dir) = env::var("METERING_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("METERING_PLAN_CATALOG") {
            cfg.plan_catalog_path = PathBuf::from(path);
        }
        if let Ok(ttl) = env::var("RESERVATION_TTL_SECS") {
            cfg.reservation_ttl_secs = ttl
                .parse()
                .context("RESERVATION_TTL_SECS must be a positive integer")?;
        }
        if let Ok(interval) = env::var("RESERVATION_SWEEP_INTERVAL_SECS") {
            cfg.reservation_sweep_interval_secs = interval
                .parse()
                .context("RESERVATION_SWEEP_INTERVAL_SECS must be a positive integer")?;
        }
        if let Ok(interval) = env::var("ROLLOVER_INTERVAL_SECS") {
            cfg.rollover_interval_secs = interval
                .parse()
                .context("ROLLOVER_INTERVAL_SECS must be a positive integer")?;
        }
        if let Ok(threshold) = env::var("DEFAULT_WARNING_THRESHOLD") {
            cfg.default_warning_threshold = threshold
                .parse()
                .context("DEFAULT_WARNING_THRESHOLD must be an integer percentage")?;
        }
        if let Ok(flag) = env::var("ENABLE_AUTO_RESET") {
            cfg.enable_auto_reset = parse_bool(&flag)
                .with_context(|| format!("ENABLE_AUTO_RESET is invalid: {flag}"))?;
        }
        if let Ok(capacity) = env::var("EVENT_CHANNEL_CAPACITY") {
            cfg.event_channel_capacity = capacity
                .parse()
                .context("EVENT_CHANNEL_CAPACITY must be a positive integer")?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            cfg.log_level = level;
        }

        cfg.validate()?;
        ensure_directory(&cfg.data_dir)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reservation_ttl_secs == 0 {
            anyhow::bail!("RESERVATION_TTL_SECS must be greater than zero");
        }
        if self.reservation_sweep_interval_secs == 0 {
            anyhow::bail!("RESERVATION_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        if self.rollover_interval_secs == 0 {
            anyhow::bail!("ROLLOVER_INTERVAL_SECS must be greater than zero");
        }
        if self.default_warning_threshold == 0 || self.default_warning_threshold > 100 {
            anyhow::bail!("DEFAULT_WARNING_THRESHOLD must be between 1 and 100");
        }
        if self.event_channel_capacity == 0 {
            anyhow::bail!("EVENT_CHANNEL_CAPACITY must be greater than zero");
        }

        Ok(())
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn reservation_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.reservation_sweep_interval_secs)
    }

    pub fn rollover_interval(&self) -> Duration {
        Duration::from_secs(self.rollover_interval_secs)
    }
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            anyhow::bail!("{} exists but is not a directory", path.display());
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create data directory {}", path.display()))?;
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => anyhow::bail!("invalid boolean value {value}"),
    }
}
