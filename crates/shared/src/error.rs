//! Error types shared across TenantOps crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SharedError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
