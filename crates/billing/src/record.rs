//! Billing record and its state machine
//!
//! A [`BillingRecord`] mirrors one tenant's subscription at the payment gateway
//! and tracks the current failure episode. Every change to a record goes
//! through [`apply`], a pure function from `(record, event)` to the next
//! record plus the tenant-side effects. Stores persist its output with a
//! version compare-and-swap, so the scheduler, the manual recovery path and
//! webhooks all share one transition table.
//!
//! ## Failure episode
//!
//! An episode opens on the first failed charge (`first_failure_at` is set),
//! advances with every failed scheduler retry (`retry_count`, `last_retry_at`),
//! and closes on any successful charge, which clears all failure fields.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tenantops_shared::{SubscriptionStatus, Tenant, TenantId, TenantStatus};

use crate::config::DunningConfig;

/// Per-tenant billing state (1:1 with tenant, never deleted)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingRecord {
    pub tenant_id: Uuid,
    pub external_customer_ref: String,
    pub external_subscription_ref: String,
    pub subscription_status: SubscriptionStatus,
    pub default_payment_method_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_failure_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_retry_at: Option<OffsetDateTime>,
    pub retry_count: i32,
    pub warning_sent: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_billed_at: Option<OffsetDateTime>,
    /// Invoice whose payment last closed a billing period
    pub last_paid_invoice_ref: Option<String>,
    /// Monotonic counter for optimistic concurrency
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl BillingRecord {
    /// Create the record for a tenant's first payment-method attachment
    pub fn new(
        tenant_id: TenantId,
        external_customer_ref: impl Into<String>,
        external_subscription_ref: impl Into<String>,
        default_payment_method_ref: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            tenant_id: tenant_id.0,
            external_customer_ref: external_customer_ref.into(),
            external_subscription_ref: external_subscription_ref.into(),
            subscription_status: SubscriptionStatus::Active,
            default_payment_method_ref,
            first_failure_at: None,
            last_retry_at: None,
            retry_count: 0,
            warning_sent: false,
            last_billed_at: None,
            last_paid_invoice_ref: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        TenantId(self.tenant_id)
    }

    pub fn in_failure_episode(&self) -> bool {
        self.first_failure_at.is_some()
    }

    /// The timestamp the retry cadence is measured from
    pub fn retry_anchor(&self) -> Option<OffsetDateTime> {
        self.last_retry_at.or(self.first_failure_at)
    }

    /// When the scheduler may next attempt this tenant
    pub fn next_retry_at(&self, interval: Duration) -> Option<OffsetDateTime> {
        self.retry_anchor().map(|anchor| anchor + interval)
    }

    /// `now - (last_retry_at ?? first_failure_at) >= interval`
    pub fn is_due_for_retry(&self, now: OffsetDateTime, interval: Duration) -> bool {
        self.retry_anchor()
            .map(|anchor| now - anchor >= interval)
            .unwrap_or(false)
    }

    /// Matches the scheduler's candidate query
    /// Anything other than an active subscription has a balance to settle
    pub fn is_overdue(&self) -> bool {
        self.subscription_status != SubscriptionStatus::Active
    }

    pub fn is_retry_candidate(&self) -> bool {
        self.subscription_status == SubscriptionStatus::PastDue
            && self.first_failure_at.is_some()
            && self.default_payment_method_ref.is_some()
    }

    fn cleared(&self) -> Self {
        Self {
            subscription_status: SubscriptionStatus::Active,
            first_failure_at: None,
            last_retry_at: None,
            retry_count: 0,
            warning_sent: false,
            ..self.clone()
        }
    }
}

/// Something that happened to a tenant's subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    /// The gateway reported a failed renewal charge; opens an episode
    PaymentFailed { at: OffsetDateTime },
    /// A scheduler retry completed with a definitive failure
    RetryFailed { at: OffsetDateTime },
    /// A charge for the current period went through (any path)
    ChargeSucceeded {
        billed_at: OffsetDateTime,
        invoice_ref: String,
    },
    /// The gateway changed the subscription status
    SubscriptionSynced {
        status: SubscriptionStatus,
        at: OffsetDateTime,
    },
    /// The tenant picked a new default payment method
    PaymentMethodAttached {
        payment_method_ref: String,
        at: OffsetDateTime,
    },
}

impl BillingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BillingEvent::PaymentFailed { .. } => "payment_failed",
            BillingEvent::RetryFailed { .. } => "retry_failed",
            BillingEvent::ChargeSucceeded { .. } => "charge_succeeded",
            BillingEvent::SubscriptionSynced { .. } => "subscription_synced",
            BillingEvent::PaymentMethodAttached { .. } => "payment_method_attached",
        }
    }

    pub fn occurred_at(&self) -> OffsetDateTime {
        match self {
            BillingEvent::PaymentFailed { at }
            | BillingEvent::RetryFailed { at }
            | BillingEvent::SubscriptionSynced { at, .. }
            | BillingEvent::PaymentMethodAttached { at, .. } => *at,
            BillingEvent::ChargeSucceeded { billed_at, .. } => *billed_at,
        }
    }
}

/// Tenant row change committed together with the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantUpdate {
    /// No tenant-side change
    Keep,
    /// ACTIVE becomes PAST_DUE; policy restrictions are left alone
    MarkPastDue { count_failure: bool },
    /// Back to ACTIVE, restriction reason and failure count cleared
    Restore {
        last_payment_date: Option<OffsetDateTime>,
    },
}

impl TenantUpdate {
    /// Apply to an in-memory tenant row
    pub fn apply_to(&self, tenant: &mut Tenant, at: OffsetDateTime) {
        match *self {
            TenantUpdate::Keep => return,
            TenantUpdate::MarkPastDue { count_failure } => {
                if tenant.status == TenantStatus::Active {
                    tenant.status = TenantStatus::PastDue;
                }
                if count_failure {
                    tenant.payment_failure_count += 1;
                }
            }
            TenantUpdate::Restore { last_payment_date } => {
                tenant.status = TenantStatus::Active;
                tenant.status_reason = None;
                tenant.payment_failure_count = 0;
                if last_payment_date.is_some() {
                    tenant.last_payment_date = last_payment_date;
                }
            }
        }
        tenant.updated_at = at;
    }
}

/// A computed state change, ready for a version-checked commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub previous_version: i64,
    pub next: BillingRecord,
    pub tenant: TenantUpdate,
    /// The commit flips `warning_sent`; the caller owes the owner one email
    pub send_warning: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Changed(Transition),
    Unchanged { reason: &'static str },
}

/// Compute the next state of `current` after `event`
pub fn apply(current: &BillingRecord, event: &BillingEvent, config: &DunningConfig) -> TransitionOutcome {
    let at = event.occurred_at();

    let (mut next, tenant, send_warning) = match event {
        BillingEvent::PaymentFailed { at } => {
            match current.subscription_status {
                SubscriptionStatus::Canceled => {
                    return TransitionOutcome::Unchanged {
                        reason: "subscription canceled",
                    }
                }
                SubscriptionStatus::PastDue if current.in_failure_episode() => {
                    return TransitionOutcome::Unchanged {
                        reason: "failure episode already open",
                    }
                }
                _ => {}
            }
            let next = BillingRecord {
                subscription_status: SubscriptionStatus::PastDue,
                first_failure_at: current.first_failure_at.or(Some(*at)),
                ..current.clone()
            };
            (next, TenantUpdate::MarkPastDue { count_failure: true }, false)
        }

        BillingEvent::RetryFailed { at } => {
            if current.subscription_status != SubscriptionStatus::PastDue {
                return TransitionOutcome::Unchanged {
                    reason: "subscription not past due",
                };
            }
            if !current.is_due_for_retry(*at, config.retry_interval) {
                return TransitionOutcome::Unchanged {
                    reason: "retry not due",
                };
            }
            let retry_count = current.retry_count + 1;
            let send_warning = retry_count >= config.warning_threshold && !current.warning_sent;
            let next = BillingRecord {
                first_failure_at: current.first_failure_at.or(Some(*at)),
                last_retry_at: Some(*at),
                retry_count,
                warning_sent: current.warning_sent || send_warning,
                ..current.clone()
            };
            (next, TenantUpdate::MarkPastDue { count_failure: true }, send_warning)
        }

        BillingEvent::ChargeSucceeded {
            billed_at,
            invoice_ref,
        } => {
            let in_good_standing = current.subscription_status == SubscriptionStatus::Active
                && !current.in_failure_episode();
            if in_good_standing
                && current.last_paid_invoice_ref.as_deref() == Some(invoice_ref.as_str())
            {
                return TransitionOutcome::Unchanged {
                    reason: "invoice already applied",
                };
            }
            // An older period's payment replayed after a newer one settled
            if in_good_standing && current.last_billed_at.is_some_and(|last| last > *billed_at) {
                return TransitionOutcome::Unchanged {
                    reason: "superseded by a later payment",
                };
            }
            let mut next = current.cleared();
            next.last_billed_at = match current.last_billed_at {
                Some(previous) if previous > *billed_at => Some(previous),
                _ => Some(*billed_at),
            };
            next.last_paid_invoice_ref = Some(invoice_ref.clone());
            (
                next,
                TenantUpdate::Restore {
                    last_payment_date: Some(*billed_at),
                },
                false,
            )
        }

        BillingEvent::SubscriptionSynced { status, at } => {
            if *status == current.subscription_status {
                return TransitionOutcome::Unchanged {
                    reason: "subscription status unchanged",
                };
            }
            match status {
                SubscriptionStatus::Active => (
                    current.cleared(),
                    TenantUpdate::Restore {
                        last_payment_date: None,
                    },
                    false,
                ),
                SubscriptionStatus::PastDue => (
                    BillingRecord {
                        subscription_status: SubscriptionStatus::PastDue,
                        first_failure_at: current.first_failure_at.or(Some(*at)),
                        ..current.clone()
                    },
                    TenantUpdate::MarkPastDue {
                        count_failure: false,
                    },
                    false,
                ),
                SubscriptionStatus::Canceled => (
                    BillingRecord {
                        subscription_status: SubscriptionStatus::Canceled,
                        ..current.clone()
                    },
                    TenantUpdate::MarkPastDue {
                        count_failure: false,
                    },
                    false,
                ),
            }
        }

        BillingEvent::PaymentMethodAttached {
            payment_method_ref, ..
        } => {
            if current.default_payment_method_ref.as_deref() == Some(payment_method_ref.as_str()) {
                return TransitionOutcome::Unchanged {
                    reason: "payment method unchanged",
                };
            }
            let next = BillingRecord {
                default_payment_method_ref: Some(payment_method_ref.clone()),
                ..current.clone()
            };
            (next, TenantUpdate::Keep, false)
        }
    };

    next.version = current.version + 1;
    next.updated_at = at;

    TransitionOutcome::Changed(Transition {
        previous_version: current.version,
        next,
        tenant,
        send_warning,
    })
}
