//! Configuration management with validation and defaults
//!
//! Centralized configuration for the cashier: storage tuning, bonus
//! housekeeping, withdrawal policy, risk scoring thresholds and provider
//! callback settings. Loaded from TOML with `CASHIER_*` environment overrides.

use crate::errors::{CashierError, CashierResult};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CashierConfig {
    pub storage: StorageConfig,
    pub bonus: BonusConfig,
    pub withdrawal: WithdrawalPolicy,
    pub risk: RiskConfig,
    pub provider: ProviderConfig,
    pub monitoring: MonitoringConfig,
}

/// Storage configuration with optimization settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    pub write_buffer_size_mb: usize,
    pub max_write_buffer_number: i32,
    /// How long a transaction waits for a row lock before giving up
    pub lock_timeout_ms: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/cashier_data".to_string(),
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            lock_timeout_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BonusConfig {
    /// Interval between expiry sweeps run by the worker
    pub expiry_sweep_interval_secs: u64,
    /// Expiry used by plans that leave `expiry_days` at zero
    pub default_expiry_days: u32,
}

impl Default for BonusConfig {
    fn default() -> Self {
        Self {
            expiry_sweep_interval_secs: 60,
            default_expiry_days: 30,
        }
    }
}

/// Daily wall-clock range (UTC) in which auto-approved withdrawals are
/// dispatched immediately. `start > end` wraps past midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ProcessingWindow {
    pub fn all_day() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

/// Withdrawal gating thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WithdrawalPolicy {
    pub min_amount: u64,
    pub max_amount: u64,
    pub require_kyc: bool,
    pub min_account_age_days: u32,
    pub min_lifetime_deposit: u64,
    pub max_pending_requests: usize,
    pub daily_limit: u64,
    pub weekly_limit: u64,
    pub monthly_limit: u64,
    /// Percentage fee in basis points (250 = 2.5%)
    pub fee_bps: u32,
    pub fee_fixed: u64,
    pub auto_approve_limit: u64,
    pub auto_processing_enabled: bool,
    pub processing_window: ProcessingWindow,
    pub gateway_timeout_ms: u64,
    pub gateway_max_attempts: u32,
    pub gateway_retry_backoff_ms: u64,
    pub payout_currency: String,
    /// Rate from account currency into `payout_currency`
    pub conversion_rates: HashMap<String, f64>,
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        let mut conversion_rates = HashMap::new();
        conversion_rates.insert("USD".to_string(), 1.0);
        Self {
            min_amount: 1_000,
            max_amount: 1_000_000,
            require_kyc: true,
            min_account_age_days: 1,
            min_lifetime_deposit: 1_000,
            max_pending_requests: 3,
            daily_limit: 1_000_000,
            weekly_limit: 3_000_000,
            monthly_limit: 10_000_000,
            fee_bps: 0,
            fee_fixed: 0,
            auto_approve_limit: 10_000,
            auto_processing_enabled: false,
            processing_window: ProcessingWindow {
                start: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
                end: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(NaiveTime::MIN),
            },
            gateway_timeout_ms: 15_000,
            gateway_max_attempts: 2,
            gateway_retry_backoff_ms: 500,
            payout_currency: "USDT".to_string(),
            conversion_rates,
        }
    }
}

impl WithdrawalPolicy {
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn gateway_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.gateway_retry_backoff_ms)
    }
}

/// Additive risk points and level thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Earlier requests within the last hour above which a new one scores as rapid
    pub rapid_withdrawal_max_per_hour: usize,
    pub rapid_withdrawal_points: u32,
    pub deposit_ratio_multiplier: u64,
    pub deposit_ratio_points: u32,
    pub new_ip_points: u32,
    pub recent_failures_window_days: i64,
    pub recent_failures_max: usize,
    pub recent_failures_points: u32,
    pub medium_threshold: u32,
    pub high_threshold: u32,
    pub critical_threshold: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            rapid_withdrawal_max_per_hour: 2,
            rapid_withdrawal_points: 30,
            deposit_ratio_multiplier: 2,
            deposit_ratio_points: 40,
            new_ip_points: 20,
            recent_failures_window_days: 7,
            recent_failures_max: 2,
            recent_failures_points: 25,
            medium_threshold: 30,
            high_threshold: 50,
            critical_threshold: 70,
        }
    }
}

/// Provider callback settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Advisory replay cache in front of the persisted markers
    pub replay_cache_capacity: usize,
    pub replay_cache_ttl_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            replay_cache_capacity: 10_000,
            replay_cache_ttl_secs: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enable_metrics: bool,
    pub log_level: LogLevel,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            log_level: LogLevel::Info,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl CashierConfig {
    /// Local development: everything small and auto-processing on all day
    pub fn development() -> Self {
        Self {
            storage: StorageConfig {
                data_directory: "./DB/cashier_dev".to_string(),
                ..Default::default()
            },
            withdrawal: WithdrawalPolicy {
                require_kyc: false,
                min_account_age_days: 0,
                min_lifetime_deposit: 0,
                auto_processing_enabled: true,
                processing_window: ProcessingWindow::all_day(),
                gateway_timeout_ms: 2_000,
                gateway_retry_backoff_ms: 10,
                ..Default::default()
            },
            monitoring: MonitoringConfig {
                log_level: LogLevel::Debug,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            storage: StorageConfig {
                data_directory: "./DB/cashier_data".to_string(),
                write_buffer_size_mb: 128,
                max_write_buffer_number: 6,
                lock_timeout_ms: 5_000,
            },
            withdrawal: WithdrawalPolicy {
                auto_processing_enabled: true,
                gateway_max_attempts: 3,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate configuration for logical consistency
    pub fn validate(&self) -> CashierResult<()> {
        let w = &self.withdrawal;
        if w.min_amount == 0 || w.max_amount < w.min_amount {
            return Err(CashierError::Configuration(
                "withdrawal min_amount must be > 0 and <= max_amount".to_string(),
            ));
        }
        if w.auto_approve_limit > w.max_amount {
            return Err(CashierError::Configuration(
                "auto_approve_limit must not exceed max_amount".to_string(),
            ));
        }
        if w.daily_limit > w.weekly_limit || w.weekly_limit > w.monthly_limit {
            return Err(CashierError::Configuration(
                "withdrawal limits must satisfy daily <= weekly <= monthly".to_string(),
            ));
        }
        if w.fee_bps >= 10_000 {
            return Err(CashierError::Configuration(
                "fee_bps must be below 10000 (100%)".to_string(),
            ));
        }
        if w.gateway_max_attempts == 0 {
            return Err(CashierError::Configuration(
                "gateway_max_attempts must be > 0".to_string(),
            ));
        }
        if w.payout_currency.is_empty() {
            return Err(CashierError::Configuration(
                "payout_currency is required".to_string(),
            ));
        }
        if let Some((currency, rate)) = w.conversion_rates.iter().find(|(_, r)| **r <= 0.0) {
            return Err(CashierError::Configuration(format!(
                "conversion rate for {} must be positive, got {}",
                currency, rate
            )));
        }

        let r = &self.risk;
        if !(r.medium_threshold < r.high_threshold && r.high_threshold < r.critical_threshold) {
            return Err(CashierError::Configuration(
                "risk thresholds must satisfy medium < high < critical".to_string(),
            ));
        }

        if self.storage.lock_timeout_ms <= 0 {
            return Err(CashierError::Configuration(
                "lock_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.provider.replay_cache_capacity == 0 {
            return Err(CashierError::Configuration(
                "replay_cache_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> CashierResult<CashierConfig> {
        let mut config = match self.config_path {
            Some(ref path) => Self::load_from_file(path)?,
            None => CashierConfig::default(),
        };

        Self::apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(path: &str) -> CashierResult<CashierConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CashierError::Configuration(format!("Failed to read {}: {}", path, e))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CashierResult<CashierConfig> {
        toml::from_str(content)
            .map_err(|e| CashierError::Configuration(format!("Failed to parse TOML: {}", e)))
    }

    fn apply_env_overrides(config: &mut CashierConfig) -> CashierResult<()> {
        if let Ok(dir) = env::var("CASHIER_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Ok(value) = env::var("CASHIER_AUTO_PROCESSING") {
            config.withdrawal.auto_processing_enabled = parse_env("CASHIER_AUTO_PROCESSING", &value)?;
        }
        if let Ok(value) = env::var("CASHIER_AUTO_APPROVE_LIMIT") {
            config.withdrawal.auto_approve_limit = parse_env("CASHIER_AUTO_APPROVE_LIMIT", &value)?;
        }
        if let Ok(value) = env::var("CASHIER_GATEWAY_TIMEOUT_MS") {
            config.withdrawal.gateway_timeout_ms = parse_env("CASHIER_GATEWAY_TIMEOUT_MS", &value)?;
        }
        if let Ok(value) = env::var("CASHIER_LOG_LEVEL") {
            config.monitoring.log_level = match value.to_lowercase().as_str() {
                "error" => LogLevel::Error,
                "warn" => LogLevel::Warn,
                "info" => LogLevel::Info,
                "debug" => LogLevel::Debug,
                "trace" => LogLevel::Trace,
                _ => {
                    return Err(CashierError::Configuration(format!(
                        "Invalid CASHIER_LOG_LEVEL '{}'",
                        value
                    )))
                }
            };
        }
        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> CashierResult<T> {
    value
        .parse()
        .map_err(|_| CashierError::Configuration(format!("Invalid value for {}: '{}'", name, value)))
}
