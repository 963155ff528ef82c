//! Scheduled payment retry cycle

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tenantops_billing::{BillingServices, RetryStatus, RetrySummary};

/// Runs retry cycles, one at a time
#[derive(Clone)]
pub struct RetryJob {
    services: BillingServices,
    shutdown: CancellationToken,
    running: Arc<Mutex<()>>,
}

impl RetryJob {
    pub fn new(services: BillingServices, shutdown: CancellationToken) -> Self {
        Self {
            services,
            shutdown,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run one cycle at `now`. Returns `None` when a cycle is already in progress.
    pub async fn run_once(&self, now: OffsetDateTime) -> Option<RetrySummary> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("Previous payment retry cycle still running, skipping this tick");
            return None;
        };

        if self.shutdown.is_cancelled() {
            info!("Shutdown in progress, skipping payment retry cycle");
            return None;
        }

        let started = std::time::Instant::now();
        match self.services.scheduler().run(now, &self.shutdown).await {
            Ok(summary) => {
                let deferred = summary
                    .results
                    .iter()
                    .filter(|r| r.status == RetryStatus::Deferred)
                    .count();
                info!(
                    checked = summary.checked,
                    retried = summary.retried,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    deferred,
                    skipped_cancelled = summary.skipped_cancelled,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Payment retry cycle complete"
                );
                Some(summary)
            }
            Err(e) => {
                error!(error = %e, "Payment retry cycle failed");
                None
            }
        }
    }
}
