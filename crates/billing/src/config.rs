//! Dunning configuration
//!
//! Retry cadence and escalation thresholds shared by the retry scheduler and
//! the manual recovery path.
//!
//! Configuration via environment variables:
//! - `BILLING_RETRY_INTERVAL_DAYS`: days between scheduler retries (default: 3)
//! - `BILLING_WARNING_THRESHOLD`: failed retries before the warning email (default: 3)
//! - `BILLING_RETRY_CONCURRENCY`: tenants processed in parallel per run (default: 8)
//! - `BILLING_GATEWAY_TIMEOUT_SECS`: per gateway call timeout (default: 15)
//! - `BILLING_MANUAL_TIMEOUT_SECS`: budget for a manual "pay now" request (default: 25)
//! - `BILLING_MAX_CONFLICT_RETRIES`: read-compute-write attempts on version conflict (default: 3)

use std::str::FromStr;
use std::time::Duration as StdDuration;

use time::Duration;

use crate::error::{BillingError, BillingResult};

const DEFAULT_RETRY_INTERVAL_DAYS: i64 = 3;
const DEFAULT_WARNING_THRESHOLD: i32 = 3;
const DEFAULT_RETRY_CONCURRENCY: usize = 8;
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MANUAL_TIMEOUT_SECS: u64 = 25;
const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Dunning policy and resource limits
#[derive(Debug, Clone)]
pub struct DunningConfig {
    /// Minimum time between two scheduler attempts for the same tenant
    pub retry_interval: Duration,
    /// Retry count at which the owner receives the warning email
    pub warning_threshold: i32,
    /// Worker pool size for a scheduler run
    pub max_concurrency: usize,
    /// Timeout applied to every gateway call
    pub gateway_timeout: StdDuration,
    /// Overall budget for the manual recovery request
    pub manual_timeout: StdDuration,
    /// Bounded attempts for a read-compute-write cycle that hits a version conflict
    pub max_conflict_retries: u32,
}

impl Default for DunningConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::days(DEFAULT_RETRY_INTERVAL_DAYS),
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            max_concurrency: DEFAULT_RETRY_CONCURRENCY,
            gateway_timeout: StdDuration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS),
            manual_timeout: StdDuration::from_secs(DEFAULT_MANUAL_TIMEOUT_SECS),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

impl DunningConfig {
    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> BillingResult<Self> {
        let config = Self {
            retry_interval: Duration::days(env_or(
                "BILLING_RETRY_INTERVAL_DAYS",
                DEFAULT_RETRY_INTERVAL_DAYS,
            )?),
            warning_threshold: env_or("BILLING_WARNING_THRESHOLD", DEFAULT_WARNING_THRESHOLD)?,
            max_concurrency: env_or("BILLING_RETRY_CONCURRENCY", DEFAULT_RETRY_CONCURRENCY)?,
            gateway_timeout: StdDuration::from_secs(env_or(
                "BILLING_GATEWAY_TIMEOUT_SECS",
                DEFAULT_GATEWAY_TIMEOUT_SECS,
            )?),
            manual_timeout: StdDuration::from_secs(env_or(
                "BILLING_MANUAL_TIMEOUT_SECS",
                DEFAULT_MANUAL_TIMEOUT_SECS,
            )?),
            max_conflict_retries: env_or(
                "BILLING_MAX_CONFLICT_RETRIES",
                DEFAULT_MAX_CONFLICT_RETRIES,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break the retry cadence
    pub fn validate(&self) -> BillingResult<()> {
        if self.retry_interval <= Duration::ZERO {
            return Err(BillingError::Config(
                "BILLING_RETRY_INTERVAL_DAYS must be positive".to_string(),
            ));
        }
        if self.warning_threshold < 1 {
            return Err(BillingError::Config(
                "BILLING_WARNING_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(BillingError::Config(
                "BILLING_RETRY_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.max_conflict_retries == 0 {
            return Err(BillingError::Config(
                "BILLING_MAX_CONFLICT_RETRIES must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}
