//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use tenantops_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Billing errors
    #[error("Account restricted: {0}")]
    AccessRestricted(String),
    #[error("No overdue balance")]
    NothingOverdue,
    #[error("{reason}")]
    PaymentFailed { reason: String, details: String },
    #[error("Payment gateway error: {0}")]
    BadGateway(String),
    #[error("Payment gateway timed out")]
    GatewayTimeout,

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Billing
            ApiError::AccessRestricted(msg) => (StatusCode::PAYMENT_REQUIRED, "ACCESS_RESTRICTED", msg.clone()),
            ApiError::NothingOverdue => (StatusCode::CONFLICT, "NOTHING_OVERDUE", "There is no overdue balance to pay.".to_string()),
            ApiError::PaymentFailed { reason, .. } => (StatusCode::PAYMENT_REQUIRED, "PAYMENT_FAILED", reason.clone()),
            ApiError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "GATEWAY_ERROR", "The payment provider rejected the request.".to_string()),
            ApiError::GatewayTimeout => (StatusCode::GATEWAY_TIMEOUT, "GATEWAY_TIMEOUT", "The payment provider did not respond in time. Please try again.".to_string()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
        };

        let mut body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });
        if let ApiError::PaymentFailed { details, .. } = &self {
            body["error"]["details"] = json!(details);
        }

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NothingOverdue(_) => ApiError::NothingOverdue,
            BillingError::PaymentFailed { reason, details } => {
                ApiError::PaymentFailed { reason, details }
            }
            BillingError::Timeout(_) => ApiError::GatewayTimeout,
            BillingError::Gateway(e) if e.is_transient() => {
                tracing::warn!(error = %e, "Payment gateway unavailable");
                ApiError::ServiceUnavailable
            }
            BillingError::Gateway(e) => ApiError::BadGateway(e.to_string()),
            BillingError::RecordNotFound(_) | BillingError::TenantNotFound(_) => ApiError::NotFound,
            BillingError::AlreadyExists(msg) => ApiError::Conflict(msg),
            BillingError::ConcurrencyConflict { .. } => ApiError::Conflict(
                "The billing record changed concurrently. Please retry.".to_string(),
            ),
            BillingError::NotConfigured(msg)
            | BillingError::InvalidTransition(msg)
            | BillingError::WebhookPayload(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg) | BillingError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal billing error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
