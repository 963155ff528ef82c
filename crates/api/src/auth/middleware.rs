//! Request authentication and the tenant access gate

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use tenantops_shared::{TenantId, TenantStatus, UserId, UserRole};

use crate::{error::ApiError, state::AppState};

/// Authenticated caller, inserted as a request extension by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub role: UserRole,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Require a valid access token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(ApiError::Unauthorized)?;

    let claims = state.jwt.validate_access_token(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected access token");
        ApiError::InvalidToken
    })?;

    request.extensions_mut().insert(AuthUser {
        user_id: UserId(claims.sub),
        tenant_id: TenantId(claims.tenant_id),
        role: UserRole::from_str_lossy(&claims.role),
    });

    Ok(next.run(request).await)
}

/// Require the cron bearer secret (constant-time comparison)
pub async fn require_cron_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = bearer_token(request.headers()).ok_or(ApiError::Unauthorized)?;
    let expected = state.config.cron_secret.as_bytes();

    let matches: bool = provided.as_bytes().ct_eq(expected).into();
    if expected.is_empty() || !matches {
        tracing::warn!("Internal billing route called with an invalid cron secret");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Access gate: a tenant that is not ACTIVE may read but not write.
///
/// Must run after [`require_auth`]. Billing recovery routes are mounted
/// outside this layer so a restricted tenant can still pay.
pub async fn require_active_tenant(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_mutating(request.method()) {
        return Ok(next.run(request).await);
    }

    let user = request
        .extensions()
        .get::<AuthUser>()
        .cloned()
        .ok_or(ApiError::Unauthorized)?;

    let tenant = state.billing.tenants.get_tenant(user.tenant_id).await?;
    if tenant.status != TenantStatus::Active {
        tracing::info!(
            tenant_id = %user.tenant_id,
            status = %tenant.status,
            method = %request.method(),
            "Write blocked by access gate"
        );
        return Err(ApiError::AccessRestricted(format!(
            "Tenant is {}. Pay the overdue balance to restore full access.",
            tenant.status
        )));
    }

    Ok(next.run(request).await)
}
