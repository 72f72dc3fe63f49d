//! Quota configuration loaded from environment variables
//!
//! - `QUOTA_ENFORCEMENT_ENABLED`: enforce tier limits (default: true)
//! - `QUOTA_STORE_TIMEOUT_MS`: bound on one store transaction (default: 5000)
//! - `QUOTA_CYCLE_DAYS`: length of a usage cycle in days (default: 30)

use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CYCLE_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaConfig {
    /// When false every limit is treated as unlimited. Counters still move so
    /// usage stays auditable.
    pub enforcement_enabled: bool,
    pub store_timeout: Duration,
    pub cycle_length: time::Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enforcement_enabled: true,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            cycle_length: time::Duration::days(DEFAULT_CYCLE_DAYS),
        }
    }
}

impl QuotaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let enforcement_enabled = match env::var("QUOTA_ENFORCEMENT_ENABLED") {
            Ok(value) => parse_bool("QUOTA_ENFORCEMENT_ENABLED", &value)?,
            Err(_) => true,
        };

        let store_timeout_ms: u64 = parse_or("QUOTA_STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?;
        if store_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "QUOTA_STORE_TIMEOUT_MS",
                value: "0".to_string(),
            });
        }

        let cycle_days: i64 = parse_or("QUOTA_CYCLE_DAYS", DEFAULT_CYCLE_DAYS)?;
        if cycle_days <= 0 {
            return Err(ConfigError::Invalid {
                key: "QUOTA_CYCLE_DAYS",
                value: cycle_days.to_string(),
            });
        }

        Ok(Self {
            enforcement_enabled,
            store_timeout: Duration::from_millis(store_timeout_ms),
            cycle_length: time::Duration::days(cycle_days),
        })
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
