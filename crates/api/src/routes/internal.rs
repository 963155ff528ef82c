//! Internal routes called by the cron trigger

use axum::{extract::State, Json};
use time::OffsetDateTime;

use tenantops_billing::{RetryDiagnostics, RetrySummary};

use crate::{error::ApiResult, state::AppState};

/// POST /internal/billing/retry-payments
pub async fn run_retry_payments(State(state): State<AppState>) -> ApiResult<Json<RetrySummary>> {
    let summary = state
        .billing
        .scheduler()
        .run(OffsetDateTime::now_utc(), &state.shutdown)
        .await?;
    Ok(Json(summary))
}

/// GET /internal/billing/retry-payments
///
/// Read-only: which tenants the next run would consider, plus invariant violations.
pub async fn retry_diagnostics(
    State(state): State<AppState>,
) -> ApiResult<Json<RetryDiagnostics>> {
    let diagnostics = state
        .billing
        .scheduler()
        .diagnostics(OffsetDateTime::now_utc())
        .await?;
    Ok(Json(diagnostics))
}
