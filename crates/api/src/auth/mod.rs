//! Authentication for TenantOps API routes

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager, TokenType};
pub use middleware::{require_active_tenant, require_auth, require_cron_secret, AuthUser};
