//! Current tenant routes (behind the access gate)

use axum::{
    extract::{Extension, State},
    Json,
};

use tenantops_shared::Tenant;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// GET /tenant
pub async fn get_current_tenant(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Tenant>> {
    let tenant = state.billing.tenants.get_tenant(auth_user.tenant_id).await?;
    Ok(Json(tenant))
}
