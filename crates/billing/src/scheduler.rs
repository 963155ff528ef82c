//! Payment retry scheduler
//!
//! A run scans past-due tenants and retries the ones whose cadence gate has
//! elapsed, with a bounded number of tenants in flight. Each tenant ends in
//! exactly one [`RetryStatus`]; a failure on one tenant never aborts the run.
//!
//! Running the same cycle twice is safe: tenants advanced by the first run
//! are not due yet, and any write computed from a stale read is rejected by
//! the version check.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tenantops_shared::TenantId;

use crate::audit::{AuditAction, AuditEntryBuilder};
use crate::email::PaymentWarning;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ensure_charged_for_current_period, ChargeRequest, ChargeResult, DeclineReason, GatewayError,
    GatewayInvoice,
};
use crate::invariants::{check_invariants, InvariantViolation};
use crate::ledger::Applied;
use crate::record::BillingRecord;
use crate::services::BillingServices;

/// Per-tenant outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Succeeded,
    Failed,
    /// Transient gateway error; nothing changed, retried next cycle
    Deferred,
    NotDue,
    NotConfigured,
    /// Paid or re-activated by another path since the candidate list was read
    AlreadyResolved,
    Conflict,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantRetryResult {
    pub tenant_id: Uuid,
    pub status: RetryStatus,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub checked: usize,
    pub retried: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Candidates not started because the run was cancelled
    pub skipped_cancelled: usize,
    pub results: Vec<TenantRetryResult>,
}

/// Read-only view of a candidate for the diagnostic endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryEligibility {
    pub tenant_id: Uuid,
    pub retry_count: i32,
    pub warning_sent: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_failure_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_retry_at: Option<OffsetDateTime>,
    pub days_since_first_failure: Option<i64>,
    pub days_since_last_retry: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    pub due: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryDiagnostics {
    pub eligible: Vec<RetryEligibility>,
    pub violations: Vec<InvariantViolation>,
}

#[derive(Clone)]
pub struct RetryScheduler {
    services: BillingServices,
}

impl RetryScheduler {
    pub fn new(services: BillingServices) -> Self {
        Self { services }
    }

    /// Run one retry cycle as of `now`
    pub async fn run(
        &self,
        now: OffsetDateTime,
        cancel: &CancellationToken,
    ) -> BillingResult<RetrySummary> {
        let candidates = self.services.ledger.store().list_retry_candidates().await?;
        let checked = candidates.len();
        let concurrency = self.services.config().max_concurrency;

        tracing::info!(
            candidates = checked,
            concurrency = concurrency,
            now = %now,
            "Starting payment retry run"
        );

        let outcomes: Vec<Option<TenantRetryResult>> = stream::iter(candidates)
            .map(|record| async move {
                if cancel.is_cancelled() {
                    None
                } else {
                    Some(self.retry_tenant(record, now).await)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = RetrySummary {
            checked,
            ..Default::default()
        };
        for outcome in outcomes {
            let Some(result) = outcome else {
                summary.skipped_cancelled += 1;
                continue;
            };
            match result.status {
                RetryStatus::Succeeded => summary.succeeded += 1,
                RetryStatus::Failed => summary.failed += 1,
                _ => {}
            }
            if matches!(
                result.status,
                RetryStatus::Succeeded
                    | RetryStatus::Failed
                    | RetryStatus::Deferred
                    | RetryStatus::AlreadyResolved
                    | RetryStatus::Conflict
                    | RetryStatus::Error
            ) {
                summary.retried += 1;
            }
            summary.results.push(result);
        }
        summary.results.sort_by_key(|r| r.tenant_id);

        tracing::info!(
            checked = summary.checked,
            retried = summary.retried,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped_cancelled = summary.skipped_cancelled,
            "Payment retry run finished"
        );

        Ok(summary)
    }

    /// Retry a single tenant. Never fails; errors become a result status.
    async fn retry_tenant(&self, record: BillingRecord, now: OffsetDateTime) -> TenantRetryResult {
        let tenant_id = record.tenant_id();
        let interval = self.services.config().retry_interval;

        if !record.is_due_for_retry(now, interval) {
            tracing::debug!(
                tenant_id = %tenant_id,
                next_retry_at = ?record.next_retry_at(interval),
                "Tenant not due for retry"
            );
            return result(&record, RetryStatus::NotDue, None);
        }

        let payment_method = record.default_payment_method_ref.as_deref().unwrap_or("");
        if payment_method.is_empty() || record.external_subscription_ref.is_empty() {
            tracing::warn!(tenant_id = %tenant_id, "Tenant has no payment method or subscription");
            return result(
                &record,
                RetryStatus::NotConfigured,
                Some("no payment method or subscription".to_string()),
            );
        }

        let charged = ensure_charged_for_current_period(
            self.services.gateway.as_ref(),
            ChargeRequest {
                customer_ref: &record.external_customer_ref,
                subscription_ref: &record.external_subscription_ref,
                payment_method_ref: payment_method,
            },
            self.services.config().gateway_timeout,
        )
        .await;

        let outcome = match charged {
            Ok(outcome) => outcome,
            Err(GatewayError::NotConfigured(msg)) => {
                tracing::warn!(tenant_id = %tenant_id, reason = %msg, "Billing not configured");
                return result(&record, RetryStatus::NotConfigured, Some(msg));
            }
            Err(e) => {
                let status = if e.is_transient() {
                    RetryStatus::Deferred
                } else {
                    RetryStatus::Error
                };
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    transient = e.is_transient(),
                    "Payment retry deferred, no state change"
                );
                self.services
                    .audit
                    .record(
                        AuditEntryBuilder::new(tenant_id, AuditAction::RetryDeferred).data(
                            serde_json::json!({
                                "error": e.to_string(),
                                "transient": e.is_transient(),
                                "retry_count": record.retry_count,
                            }),
                        ),
                        now,
                    )
                    .await;
                return result(&record, status, Some(e.to_string()));
            }
        };

        match outcome.result {
            ChargeResult::Paid => self.apply_success(&record, &outcome.invoice, now).await,
            ChargeResult::Failed(reason) => {
                self.apply_failure(&record, &outcome.invoice, reason, now)
                    .await
            }
            // No customer is present to complete step-up
            ChargeResult::RequiresAction { .. } => {
                self.apply_failure(
                    &record,
                    &outcome.invoice,
                    DeclineReason::AuthenticationRequired,
                    now,
                )
                .await
            }
        }
    }

    async fn apply_success(
        &self,
        record: &BillingRecord,
        invoice: &GatewayInvoice,
        now: OffsetDateTime,
    ) -> TenantRetryResult {
        let tenant_id = record.tenant_id();
        let applied = self
            .services
            .ledger
            .settle_charge(tenant_id, now, &invoice.id)
            .await;

        match applied {
            Ok(Applied::Committed { record: next, .. }) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    invoice_id = %invoice.id,
                    amount_cents = invoice.amount_due_cents,
                    "Payment retry succeeded"
                );
                self.services
                    .audit
                    .record(
                        AuditEntryBuilder::new(tenant_id, AuditAction::RetrySucceeded).data(
                            serde_json::json!({
                                "invoice_id": invoice.id,
                                "amount_cents": invoice.amount_due_cents,
                                "currency": invoice.currency,
                                "previous_retry_count": record.retry_count,
                            }),
                        ),
                        now,
                    )
                    .await;
                result(&next, RetryStatus::Succeeded, None)
            }
            Ok(Applied::Unchanged {
                record: current,
                reason,
            }) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    invoice_id = %invoice.id,
                    reason = reason,
                    "Invoice already settled by another path"
                );
                self.services
                    .audit
                    .record(
                        AuditEntryBuilder::new(tenant_id, AuditAction::RetrySucceeded).data(
                            serde_json::json!({
                                "invoice_id": invoice.id,
                                "applied": false,
                                "reason": reason,
                            }),
                        ),
                        now,
                    )
                    .await;
                result(
                    &current,
                    RetryStatus::AlreadyResolved,
                    Some(reason.to_string()),
                )
            }
            Err(e) => {
                self.ledger_error(record, AuditAction::RetrySucceeded, invoice, e, now)
                    .await
            }
        }
    }

    async fn apply_failure(
        &self,
        record: &BillingRecord,
        invoice: &GatewayInvoice,
        reason: DeclineReason,
        now: OffsetDateTime,
    ) -> TenantRetryResult {
        let tenant_id = record.tenant_id();
        let applied = self
            .services
            .ledger
            .count_failed_retry(tenant_id, now)
            .await;

        match applied {
            Ok(Applied::Committed {
                record: next,
                send_warning,
            }) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    invoice_id = %invoice.id,
                    retry_count = next.retry_count,
                    decline = reason.code(),
                    "Payment retry failed"
                );
                self.services
                    .audit
                    .record(
                        AuditEntryBuilder::new(tenant_id, AuditAction::RetryFailed).data(
                            serde_json::json!({
                                "invoice_id": invoice.id,
                                "reason": reason,
                                "retry_count": next.retry_count,
                                "warning_due": send_warning,
                            }),
                        ),
                        now,
                    )
                    .await;
                if send_warning {
                    self.send_warning(&next, invoice, &reason, now).await;
                }
                result(&next, RetryStatus::Failed, Some(reason.to_string()))
            }
            Ok(Applied::Unchanged {
                record: current,
                reason: unchanged,
            }) => {
                let status = if current.subscription_status.is_active() {
                    RetryStatus::AlreadyResolved
                } else {
                    RetryStatus::NotDue
                };
                tracing::info!(
                    tenant_id = %tenant_id,
                    reason = unchanged,
                    "Failed retry not applied"
                );
                self.services
                    .audit
                    .record(
                        AuditEntryBuilder::new(tenant_id, AuditAction::RetryFailed).data(
                            serde_json::json!({
                                "invoice_id": invoice.id,
                                "reason": reason,
                                "applied": false,
                                "unchanged": unchanged,
                                "retry_count": current.retry_count,
                            }),
                        ),
                        now,
                    )
                    .await;
                result(&current, status, Some(unchanged.to_string()))
            }
            Err(e) => {
                self.ledger_error(record, AuditAction::RetryFailed, invoice, e, now)
                    .await
            }
        }
    }

    /// Delivery problems are logged and audited; the committed flag stays set
    async fn send_warning(
        &self,
        record: &BillingRecord,
        invoice: &GatewayInvoice,
        reason: &DeclineReason,
        now: OffsetDateTime,
    ) {
        let tenant_id = record.tenant_id();
        let delivery = match self.services.tenants.get_tenant(tenant_id).await {
            Ok(tenant) => match tenant.owner_email.clone() {
                Some(to) => {
                    let warning = PaymentWarning {
                        tenant_id: tenant.id,
                        tenant_name: tenant.name.clone(),
                        to,
                        amount_cents: invoice.amount_due_cents,
                        currency: invoice.currency.clone(),
                        reason: reason.to_string(),
                        retry_count: record.retry_count,
                    };
                    self.services.notifier.send_payment_warning(&warning).await
                }
                None => Err(BillingError::NotConfigured(
                    "tenant has no owner email".to_string(),
                )),
            },
            Err(e) => Err(e),
        };

        let (delivered, error) = match delivery {
            Ok(delivered) => (delivered, None),
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Failed to send payment warning - non-fatal"
                );
                (false, Some(e.to_string()))
            }
        };

        self.services
            .audit
            .record(
                AuditEntryBuilder::new(tenant_id, AuditAction::WarningSent).data(
                    serde_json::json!({
                        "delivered": delivered,
                        "error": error,
                        "amount_cents": invoice.amount_due_cents,
                        "currency": invoice.currency,
                        "retry_count": record.retry_count,
                    }),
                ),
                now,
            )
            .await;
    }

    /// The gateway answered but the outcome could not be committed
    async fn ledger_error(
        &self,
        record: &BillingRecord,
        action: AuditAction,
        invoice: &GatewayInvoice,
        error: BillingError,
        now: OffsetDateTime,
    ) -> TenantRetryResult {
        let status = if error.is_conflict() {
            RetryStatus::Conflict
        } else {
            RetryStatus::Error
        };
        tracing::error!(
            tenant_id = %record.tenant_id,
            invoice_id = %invoice.id,
            action = %action,
            error = %error,
            "Failed to record payment retry outcome"
        );
        self.services
            .audit
            .record(
                AuditEntryBuilder::new(record.tenant_id(), action).data(serde_json::json!({
                    "invoice_id": invoice.id,
                    "applied": false,
                    "error": error.to_string(),
                    "retry_count": record.retry_count,
                })),
                now,
            )
            .await;
        result(record, status, Some(error.to_string()))
    }

    /// Candidates with their cadence position, plus invariant violations
    pub async fn diagnostics(&self, now: OffsetDateTime) -> BillingResult<RetryDiagnostics> {
        let interval = self.services.config().retry_interval;
        let store = self.services.ledger.store();

        let eligible = store
            .list_retry_candidates()
            .await?
            .into_iter()
            .map(|r| RetryEligibility {
                tenant_id: r.tenant_id,
                retry_count: r.retry_count,
                warning_sent: r.warning_sent,
                first_failure_at: r.first_failure_at,
                last_retry_at: r.last_retry_at,
                days_since_first_failure: r.first_failure_at.map(|t| (now - t).whole_days()),
                days_since_last_retry: r.last_retry_at.map(|t| (now - t).whole_days()),
                next_retry_at: r.next_retry_at(interval),
                due: r.is_due_for_retry(now, interval),
            })
            .collect();

        let records = store.list_all().await?;
        let tenants = self.services.tenants.list_tenants().await?;
        let violations = check_invariants(&records, &tenants, self.services.config());

        Ok(RetryDiagnostics {
            eligible,
            violations,
        })
    }
}

fn result(record: &BillingRecord, status: RetryStatus, detail: Option<String>) -> TenantRetryResult {
    TenantRetryResult {
        tenant_id: record.tenant_id,
        status,
        retry_count: record.retry_count,
        detail,
    }
}
