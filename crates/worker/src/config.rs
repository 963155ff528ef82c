//! Worker configuration

use std::env;

use tenantops_billing::{BillingError, DunningConfig};

/// Default schedule: daily at 06:00 UTC (seconds field first)
pub const DEFAULT_RETRY_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub stripe_secret_key: String,
    pub retry_cron: String,
    /// Run one retry cycle immediately on startup
    pub run_on_start: bool,
    pub dunning: DunningConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid dunning configuration: {0}")]
    Dunning(#[from] BillingError),
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, WorkerConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| WorkerConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .map_err(|_| WorkerConfigError::Missing("STRIPE_SECRET_KEY"))?,
            retry_cron: env::var("BILLING_RETRY_CRON")
                .unwrap_or_else(|_| DEFAULT_RETRY_CRON.to_string()),
            run_on_start: env::var("BILLING_RETRY_ON_START")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            dunning: DunningConfig::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_without_webhook_secret() {
        env::set_var("DATABASE_URL", "postgres://localhost/tenantops_test");
        env::set_var("STRIPE_SECRET_KEY", "sk_test_worker");
        env::remove_var("STRIPE_WEBHOOK_SECRET");
        env::remove_var("BILLING_RETRY_CRON");
        env::remove_var("BILLING_RETRY_ON_START");

        let config = WorkerConfig::from_env().unwrap();
        assert_eq!(config.stripe_secret_key, "sk_test_worker");
        assert_eq!(config.retry_cron, DEFAULT_RETRY_CRON);
        assert!(!config.run_on_start);
    }
}
