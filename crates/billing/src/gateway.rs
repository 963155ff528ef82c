//! Payment gateway abstraction
//!
//! The engine only talks to the payment processor through [`PaymentGateway`].
//! [`crate::stripe_gateway::StripeGateway`] is the production implementation;
//! [`crate::testing::FakeGateway`] is a scripted in-memory one for tests.
//!
//! Both reconciliation paths charge through [`ensure_charged_for_current_period`],
//! which finds or creates the invoice for the current period and then pays it.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invoice status at the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Void => "void",
            InvoiceStatus::Uncollectible => "uncollectible",
        }
    }
}

/// Invoice as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInvoice {
    pub id: String,
    pub amount_due_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub hosted_invoice_url: Option<String>,
}

/// Why a charge was definitively refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum DeclineReason {
    CardDeclined(String),
    InsufficientFunds,
    /// Step-up needed but the gateway offered no action token
    AuthenticationRequired,
    NoPaymentMethod,
}

impl DeclineReason {
    pub fn code(&self) -> &'static str {
        match self {
            DeclineReason::CardDeclined(_) => "card_declined",
            DeclineReason::InsufficientFunds => "insufficient_funds",
            DeclineReason::AuthenticationRequired => "authentication_required",
            DeclineReason::NoPaymentMethod => "no_payment_method",
        }
    }
}

impl std::fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeclineReason::CardDeclined(msg) => write!(f, "Card declined: {}", msg),
            DeclineReason::InsufficientFunds => write!(f, "Insufficient funds"),
            DeclineReason::AuthenticationRequired => {
                write!(f, "Payment requires customer authentication")
            }
            DeclineReason::NoPaymentMethod => write!(f, "No payment method on file"),
        }
    }
}

/// Result of a single charge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeResult {
    Paid,
    /// Customer must complete step-up authentication client-side
    RequiresAction { action_token: String },
    Failed(DeclineReason),
}

/// Invoice plus the charge result for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub invoice: GatewayInvoice,
    pub result: ChargeResult,
}

/// Errors that prevented a charge attempt from completing
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),

    #[error("Payment gateway call timed out: {0}")]
    Timeout(&'static str),

    #[error("Billing not configured: {0}")]
    NotConfigured(String),

    #[error("Payment gateway rejected request: {0}")]
    Api(String),
}

impl GatewayError {
    /// Transient errors are retried next cycle without consuming a retry
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Timeout(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Contract with the external payment processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// The open (unpaid, finalized) invoice for the subscription, if any
    async fn find_open_invoice(
        &self,
        customer_ref: &str,
        subscription_ref: &str,
    ) -> GatewayResult<Option<GatewayInvoice>>;

    /// Create the invoice for the subscription's current period.
    ///
    /// Idempotent per subscription and period: a repeated call returns the
    /// invoice created the first time, whatever its status.
    async fn create_invoice_for_current_period(
        &self,
        customer_ref: &str,
        subscription_ref: &str,
    ) -> GatewayResult<GatewayInvoice>;

    /// Charge an invoice. Paying an already paid invoice is a no-op returning `Paid`.
    async fn attempt_charge(
        &self,
        invoice_ref: &str,
        payment_method_ref: &str,
    ) -> GatewayResult<ChargeResult>;

    /// The customer's default payment method at the gateway
    async fn default_payment_method(&self, customer_ref: &str) -> GatewayResult<Option<String>>;
}

/// What to charge
#[derive(Debug, Clone, Copy)]
pub struct ChargeRequest<'a> {
    pub customer_ref: &'a str,
    pub subscription_ref: &'a str,
    pub payment_method_ref: &'a str,
}

/// Run a gateway call with a deadline
pub async fn with_timeout<T, F>(
    limit: Duration,
    operation: &'static str,
    call: F,
) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation = operation,
                timeout_ms = limit.as_millis() as u64,
                "Payment gateway call timed out"
            );
            Err(GatewayError::Timeout(operation))
        }
    }
}

/// Make sure the current period is charged: find or create the invoice, then pay it.
///
/// An invoice that is already paid short-circuits to `Paid` without a charge,
/// so two callers racing on the same tenant produce at most one capture.
pub async fn ensure_charged_for_current_period(
    gateway: &dyn PaymentGateway,
    request: ChargeRequest<'_>,
    call_timeout: Duration,
) -> GatewayResult<ChargeOutcome> {
    if request.payment_method_ref.is_empty() {
        return Err(GatewayError::NotConfigured(
            "no payment method to charge".to_string(),
        ));
    }

    let open = with_timeout(
        call_timeout,
        "find_open_invoice",
        gateway.find_open_invoice(request.customer_ref, request.subscription_ref),
    )
    .await?;

    let mut invoice = match open {
        Some(invoice) => invoice,
        None => {
            with_timeout(
                call_timeout,
                "create_invoice_for_current_period",
                gateway.create_invoice_for_current_period(
                    request.customer_ref,
                    request.subscription_ref,
                ),
            )
            .await?
        }
    };

    if invoice.status == InvoiceStatus::Paid {
        tracing::debug!(
            invoice_id = %invoice.id,
            subscription_ref = %request.subscription_ref,
            "Current period already paid"
        );
        return Ok(ChargeOutcome {
            invoice,
            result: ChargeResult::Paid,
        });
    }

    let result = with_timeout(
        call_timeout,
        "attempt_charge",
        gateway.attempt_charge(&invoice.id, request.payment_method_ref),
    )
    .await?;

    if result == ChargeResult::Paid {
        invoice.status = InvoiceStatus::Paid;
    }

    Ok(ChargeOutcome { invoice, result })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGateway, ScriptedCharge};

    fn request<'a>() -> ChargeRequest<'a> {
        ChargeRequest {
            customer_ref: "cus_1",
            subscription_ref: "sub_1",
            payment_method_ref: "pm_1",
        }
    }

    #[tokio::test]
    async fn test_creates_invoice_when_none_open() {
        let gateway = FakeGateway::new(4_900);
        let outcome = ensure_charged_for_current_period(&gateway, request(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(outcome.result, ChargeResult::Paid);
        assert_eq!(outcome.invoice.status, InvoiceStatus::Paid);
        assert_eq!(outcome.invoice.amount_due_cents, 4_900);
        assert_eq!(gateway.invoices_created(), 1);
        assert_eq!(gateway.captures(), 1);
    }

    #[tokio::test]
    async fn test_paid_invoice_is_not_charged_twice() {
        let gateway = FakeGateway::new(4_900);
        ensure_charged_for_current_period(&gateway, request(), Duration::from_secs(1))
            .await
            .unwrap();
        let second = ensure_charged_for_current_period(&gateway, request(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(second.result, ChargeResult::Paid);
        assert_eq!(gateway.invoices_created(), 1);
        assert_eq!(gateway.captures(), 1);
    }

    #[tokio::test]
    async fn test_declined_charge_keeps_invoice_open() {
        let gateway = FakeGateway::new(4_900);
        gateway.script(ScriptedCharge::Decline("do_not_honor".to_string()));

        let outcome = ensure_charged_for_current_period(&gateway, request(), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(matches!(
            outcome.result,
            ChargeResult::Failed(DeclineReason::CardDeclined(_))
        ));
        assert_eq!(outcome.invoice.status, InvoiceStatus::Open);
        assert_eq!(gateway.captures(), 0);
    }

    #[tokio::test]
    async fn test_hung_gateway_times_out_as_transient() {
        let gateway = FakeGateway::new(4_900);
        gateway.script(ScriptedCharge::Hang);

        let err = ensure_charged_for_current_period(&gateway, request(), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Timeout("attempt_charge")));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_payment_method_is_not_configured() {
        let gateway = FakeGateway::new(4_900);
        let err = ensure_charged_for_current_period(
            &gateway,
            ChargeRequest {
                payment_method_ref: "",
                ..request()
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GatewayError::NotConfigured(_)));
        assert_eq!(gateway.calls(), 0);
    }
}
