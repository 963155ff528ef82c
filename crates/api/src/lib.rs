//! TenantOps API Library
//!
//! HTTP surface for tenant billing: the overdue-payment routes, the Stripe
//! webhook, the internal cron trigger for payment retries, and the tenant
//! access gate.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
