//! Billing error types

use thiserror::Error;

use crate::gateway::GatewayError;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Billing record not found for tenant: {0}")]
    RecordNotFound(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Billing record already exists for tenant: {0}")]
    AlreadyExists(String),

    /// The record's version changed between read and write
    #[error("Concurrent modification detected for tenant {tenant_id} (expected version {expected_version})")]
    ConcurrencyConflict {
        tenant_id: String,
        expected_version: i64,
    },

    #[error("Billing not configured: {0}")]
    NotConfigured(String),

    #[error("No overdue balance for tenant: {0}")]
    NothingOverdue(String),

    #[error("Payment failed: {reason}")]
    PaymentFailed { reason: String, details: String },

    #[error("Invalid status change: {0}")]
    InvalidTransition(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BillingError::ConcurrencyConflict { .. })
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<tenantops_shared::SharedError> for BillingError {
    fn from(err: tenantops_shared::SharedError) -> Self {
        match err {
            tenantops_shared::SharedError::InvalidTransition(msg) => {
                BillingError::InvalidTransition(msg)
            }
            tenantops_shared::SharedError::NotFound(msg) => BillingError::TenantNotFound(msg),
            other => BillingError::Internal(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
