//! TenantOps background worker
//!
//! Runs the payment retry cycle on a cron schedule.

mod config;
mod retry_job;

use anyhow::Context;
use time::OffsetDateTime;
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tenantops_billing::{BillingServices, StripeClient, StripeConfig};
use tenantops_shared::{create_pool, run_migrations};

use crate::config::WorkerConfig;
use crate::retry_job::RetryJob;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tenantops_worker=info,tenantops_billing=info"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        retry_cron = %config.retry_cron,
        max_concurrency = config.dunning.max_concurrency,
        "Starting tenantops-worker"
    );

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let stripe = StripeClient::new(StripeConfig {
        secret_key: config.stripe_secret_key.clone(),
        webhook_secret: String::new(),
    });
    let services = BillingServices::production(pool, stripe, config.dunning.clone());

    let shutdown = CancellationToken::new();
    let job = RetryJob::new(services, shutdown.clone());

    if config.run_on_start {
        job.run_once(OffsetDateTime::now_utc()).await;
    }

    let mut scheduler = JobScheduler::new()
        .await
        .context("Failed to create job scheduler")?;

    let tick = job.clone();
    scheduler
        .add(
            Job::new_async(config.retry_cron.as_str(), move |_id, _lock| {
                let job = tick.clone();
                Box::pin(async move {
                    job.run_once(OffsetDateTime::now_utc()).await;
                })
            })
            .with_context(|| format!("Invalid BILLING_RETRY_CRON: {}", config.retry_cron))?,
        )
        .await
        .context("Failed to register retry job")?;

    scheduler
        .start()
        .await
        .context("Failed to start job scheduler")?;
    tracing::info!("Payment retry job scheduled");

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    // A running cycle finishes its in-flight tenants and starts no new ones
    shutdown.cancel();
    scheduler
        .shutdown()
        .await
        .context("Failed to stop job scheduler")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
