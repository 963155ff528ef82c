//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use tenantops_billing::{BillingServices, WebhookHandler};

use crate::{auth::JwtManager, config::Config};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub jwt: JwtManager,
    pub billing: BillingServices,
    pub webhooks: WebhookHandler,
    /// Cancelled on shutdown; in-flight retry runs stop starting new tenants
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, pool: PgPool, billing: BillingServices) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let webhooks = WebhookHandler::new(billing.clone(), config.stripe_webhook_secret.clone());
        Self {
            config: Arc::new(config),
            pool,
            jwt,
            billing,
            webhooks,
            shutdown: CancellationToken::new(),
        }
    }
}
