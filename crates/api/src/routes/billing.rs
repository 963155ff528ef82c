//! Tenant-facing billing routes and the Stripe webhook

use axum::{
    extract::{Extension, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use tenantops_billing::{AuditEntry, InvoiceSummary, ManualPaymentOutcome, OverdueStatus};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Optional payment method override for a manual payment
#[derive(Debug, Default, Deserialize)]
pub struct PayOverdueQuery {
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PayOverdueResponse {
    Paid {
        success: bool,
        message: String,
        invoice: InvoiceSummary,
    },
    RequiresAction {
        requires_payment_method: bool,
        action_token: String,
        amount: i64,
        currency: String,
        invoice_id: String,
    },
}

impl From<ManualPaymentOutcome> for PayOverdueResponse {
    fn from(outcome: ManualPaymentOutcome) -> Self {
        match outcome {
            ManualPaymentOutcome::Paid { message, invoice } => PayOverdueResponse::Paid {
                success: true,
                message,
                invoice,
            },
            ManualPaymentOutcome::RequiresAction {
                action_token,
                amount,
                currency,
                invoice_id,
            } => PayOverdueResponse::RequiresAction {
                requires_payment_method: true,
                action_token,
                amount,
                currency,
                invoice_id,
            },
        }
    }
}

/// GET /billing/overdue
pub async fn get_overdue(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<OverdueStatus>> {
    let status = state
        .billing
        .recovery()
        .overdue_status(auth_user.tenant_id)
        .await?;
    Ok(Json(status))
}

/// POST /billing/overdue/pay
///
/// Only owners and admins may pay.
pub async fn pay_overdue(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<PayOverdueQuery>,
) -> ApiResult<Json<PayOverdueResponse>> {
    if !auth_user.role.can_administer() {
        tracing::warn!(
            user_id = %auth_user.user_id,
            tenant_id = %auth_user.tenant_id,
            role = auth_user.role.as_str(),
            "Overdue payment attempt with insufficient role"
        );
        return Err(ApiError::Forbidden);
    }

    let outcome = state
        .billing
        .recovery()
        .pay_overdue(
            auth_user.tenant_id,
            Some(auth_user.user_id.0),
            query.payment_method_id.as_deref(),
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

/// GET /billing/audit
pub async fn get_audit_log(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let entries = state
        .billing
        .audit
        .list_for_tenant(auth_user.tenant_id, limit)
        .await?;
    Ok(Json(entries))
}

/// POST /billing/webhook
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let outcome = state
        .webhooks
        .handle(&body, signature, OffsetDateTime::now_utc())
        .await?;

    tracing::info!(outcome = ?outcome, "Stripe webhook processed");
    Ok(StatusCode::OK)
}
