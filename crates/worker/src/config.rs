//! Worker configuration from environment variables

use std::env;
use std::time::Duration;

use quotaguard_quota::{ConfigError, QuotaConfig};
use quotaguard_shared::PoolSettings;

/// Every 15 minutes, on the minute (seconds field first)
const DEFAULT_RECONCILE_CRON: &str = "0 */15 * * * *";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub pool: PoolSettings,
    pub reconcile_cron: String,
    pub quota: QuotaConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let max_connections = match env::var("DATABASE_MAX_CONNECTIONS") {
            Ok(value) => value
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    key: "DATABASE_MAX_CONNECTIONS",
                    value,
                })?,
            Err(_) => DEFAULT_MAX_CONNECTIONS,
        };

        let reconcile_cron =
            env::var("RECONCILE_CRON").unwrap_or_else(|_| DEFAULT_RECONCILE_CRON.to_string());

        let quota = QuotaConfig::from_env()?;
        let pool = PoolSettings {
            max_connections,
            acquire_timeout: quota.store_timeout.min(Duration::from_secs(3)),
        };

        Ok(Self {
            database_url,
            pool,
            reconcile_cron,
            quota,
        })
    }
}
