//! API routes

pub mod billing;
pub mod health;
pub mod internal;
pub mod tenant;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    auth::{require_active_tenant, require_auth, require_cron_secret},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    // Stripe webhook (public, uses signature verification)
    let public_api_routes = Router::new().route("/billing/webhook", post(billing::webhook));

    // Cron trigger (bearer secret, not JWT)
    let internal_routes = Router::new()
        .route(
            "/internal/billing/retry-payments",
            post(internal::run_retry_payments).get(internal::retry_diagnostics),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_secret,
        ));

    // Recovery routes stay outside the access gate so a restricted tenant can pay
    let billing_routes = Router::new()
        .route("/billing/overdue", get(billing::get_overdue))
        .route("/billing/overdue/pay", post(billing::pay_overdue))
        .route("/billing/audit", get(billing::get_audit_log));

    let tenant_routes = gated(Router::new().route("/tenant", get(tenant::get_current_tenant)), &state);

    // Apply auth middleware to protected routes (runs before the gate)
    let protected_api_routes = billing_routes
        .merge(tenant_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(internal_routes)
        .merge(protected_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Put routes behind the tenant access gate. Writes from a non-ACTIVE tenant get 402.
pub fn gated(routes: Router<AppState>, state: &AppState) -> Router<AppState> {
    routes.route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_active_tenant,
    ))
}
