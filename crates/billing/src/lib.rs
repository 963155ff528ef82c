//! TenantOps Billing
//!
//! Tenant billing lifecycle and payment-retry reconciliation:
//!
//! - [`record`]: per-tenant billing record and its transition table
//! - [`ledger`]: version-checked commits of transitions, with audit entries
//! - [`scheduler`]: daily retry pass over past-due tenants
//! - [`recovery`]: tenant-initiated "pay now" and the overdue banner
//! - [`webhooks`]: Stripe notifications applied through the same ledger
//! - [`invariants`]: tenant/record consistency checks
//!
//! The payment processor, stores, notifier and audit sink are injected
//! through traits; [`testing`] and [`memory_store`] provide in-memory versions.

pub mod audit;
pub mod client;
pub mod config;
pub mod email;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod memory_store;
pub mod pg_store;
pub mod record;
pub mod recovery;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod stripe_gateway;
pub mod testing;
pub mod webhooks;

pub use audit::{ActorType, AuditAction, AuditEntry, AuditEntryBuilder, AuditLog, PgAuditLog};
pub use client::{StripeClient, StripeConfig};
pub use config::DunningConfig;
pub use email::{BillingEmailService, EmailConfig, Notifier, PaymentWarning};
pub use error::{BillingError, BillingResult};
pub use gateway::{
    ChargeOutcome, ChargeResult, DeclineReason, GatewayError, GatewayInvoice, InvoiceStatus,
    PaymentGateway,
};
pub use invariants::{check_invariants, InvariantViolation, Violation};
pub use ledger::{Applied, BillingLedger};
pub use memory_store::MemoryStore;
pub use pg_store::PgStore;
pub use record::{apply, BillingEvent, BillingRecord, TenantUpdate, Transition, TransitionOutcome};
pub use recovery::{InvoiceSummary, ManualPaymentOutcome, ManualRecoveryService, OverdueStatus};
pub use scheduler::{
    RetryDiagnostics, RetryEligibility, RetryScheduler, RetryStatus, RetrySummary,
    TenantRetryResult,
};
pub use services::BillingServices;
pub use store::{BillingStore, TenantStore};
pub use stripe_gateway::StripeGateway;
pub use webhooks::{GatewayNotification, WebhookHandler, WebhookOutcome};
