//! Application configuration

use std::env;

use tenantops_billing::DunningConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Bearer secret for the internal cron routes
    pub cron_secret: String,

    // Stripe
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,

    // Dunning policy
    pub dunning: DunningConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Authentication
            jwt_secret: strong_secret("JWT_SECRET")?,
            jwt_expiry_hours: env::var("JWT_EXPIRY_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .unwrap_or(24),
            cron_secret: strong_secret("CRON_SECRET")?,

            // Stripe
            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .map_err(|_| ConfigError::Missing("STRIPE_SECRET_KEY"))?,
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?,

            dunning: DunningConfig::from_env()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?,
        })
    }
}

/// Secrets used for signing or bearer comparison must be at least 32 characters
fn strong_secret(key: &'static str) -> Result<String, ConfigError> {
    let secret = env::var(key).map_err(|_| ConfigError::Missing(key))?;
    if secret.len() < 32 {
        return Err(ConfigError::WeakSecret(key));
    }
    Ok(secret)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0} must be at least 32 characters")]
    WeakSecret(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Config tests share process env vars
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        env::set_var("CRON_SECRET", "test-cron-secret-must-be-at-least-32-chars");
        env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test_123");
    }

    fn cleanup_config() {
        for key in [
            "DATABASE_URL",
            "JWT_SECRET",
            "CRON_SECRET",
            "STRIPE_SECRET_KEY",
            "STRIPE_WEBHOOK_SECRET",
            "BILLING_RETRY_CONCURRENCY",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_minimal_config_loads_with_dunning_defaults() {
        let _guard = CONFIG_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.dunning.warning_threshold, 3);
        assert_eq!(config.dunning.retry_interval, time::Duration::days(3));

        cleanup_config();
    }

    #[test]
    fn test_short_cron_secret_rejected() {
        let _guard = CONFIG_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        setup_minimal_config();
        env::set_var("CRON_SECRET", "short");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::WeakSecret("CRON_SECRET"))));

        cleanup_config();
    }

    #[test]
    fn test_invalid_dunning_config_rejected() {
        let _guard = CONFIG_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        setup_minimal_config();
        env::set_var("BILLING_RETRY_CONCURRENCY", "0");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        cleanup_config();
    }
}
