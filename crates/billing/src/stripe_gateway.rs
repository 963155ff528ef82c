//! Stripe implementation of [`PaymentGateway`]
//!
//! - Invoice creation carries the idempotency key
//!   `{subscription_ref}:{current_period_start}`, so two callers creating the
//!   invoice for the same period get the same invoice back.
//! - Charges go through `POST /v1/invoices/{id}/pay` off-session. Stripe
//!   answers 402 for declines; the decline code and the invoice's payment
//!   intent decide between `Failed` and `RequiresAction`.
//! - 429, 5xx and network errors are transient.

use async_trait::async_trait;
use serde::Serialize;
use stripe::{
    CreateInvoice, CustomerId, Expandable, Invoice, InvoiceId, ListInvoices, PaymentIntentStatus,
    RequestStrategy, StripeError, Subscription, SubscriptionId,
};

use crate::client::StripeClient;
use crate::gateway::{
    ChargeResult, DeclineReason, GatewayError, GatewayInvoice, GatewayResult, InvoiceStatus,
    PaymentGateway,
};

#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

#[derive(Serialize)]
struct PayInvoiceForm<'a> {
    payment_method: &'a str,
    off_session: bool,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    async fn retrieve_invoice(&self, invoice_id: &InvoiceId) -> GatewayResult<Invoice> {
        Invoice::retrieve(self.stripe.inner(), invoice_id, &["payment_intent"])
            .await
            .map_err(|e| classify_error(e, "retrieve_invoice"))
    }

    /// Step-up token if the invoice's payment intent is waiting on the customer
    fn action_token(invoice: &Invoice) -> Option<String> {
        match invoice.payment_intent.as_ref()? {
            Expandable::Object(intent) if intent.status == PaymentIntentStatus::RequiresAction => {
                intent.client_secret.clone()
            }
            _ => None,
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn find_open_invoice(
        &self,
        customer_ref: &str,
        subscription_ref: &str,
    ) -> GatewayResult<Option<GatewayInvoice>> {
        let mut params = ListInvoices::new();
        params.customer = Some(parse_customer_id(customer_ref)?);
        params.subscription = Some(parse_subscription_id(subscription_ref)?);
        params.status = Some(stripe::InvoiceStatus::Open);
        params.limit = Some(1);

        let invoices = Invoice::list(self.stripe.inner(), &params)
            .await
            .map_err(|e| classify_error(e, "list_invoices"))?;

        Ok(invoices.data.first().map(to_gateway_invoice))
    }

    async fn create_invoice_for_current_period(
        &self,
        customer_ref: &str,
        subscription_ref: &str,
    ) -> GatewayResult<GatewayInvoice> {
        let subscription_id = parse_subscription_id(subscription_ref)?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &subscription_id, &[])
            .await
            .map_err(|e| classify_error(e, "retrieve_subscription"))?;

        let idempotency_key = format!("{}:{}", subscription_ref, subscription.current_period_start);
        let idempotent = self
            .stripe
            .inner()
            .clone()
            .with_strategy(RequestStrategy::Idempotent(idempotency_key.clone()));

        let mut params = CreateInvoice::new();
        params.customer = Some(parse_customer_id(customer_ref)?);
        params.subscription = Some(subscription_id);
        params.auto_advance = Some(false);
        params.collection_method = Some(stripe::CollectionMethod::ChargeAutomatically);

        let created = Invoice::create(&idempotent, params)
            .await
            .map_err(|e| classify_error(e, "create_invoice"))?;

        // A replayed key returns the original response; read the current state
        let mut invoice = self.retrieve_invoice(&created.id).await?;
        if invoice.status == Some(stripe::InvoiceStatus::Draft) {
            invoice = Invoice::finalize(self.stripe.inner(), &invoice.id, Default::default())
                .await
                .map_err(|e| classify_error(e, "finalize_invoice"))?;
        }

        tracing::info!(
            invoice_id = %invoice.id,
            subscription_ref = %subscription_ref,
            idempotency_key = %idempotency_key,
            "Invoice ready for current period"
        );

        Ok(to_gateway_invoice(&invoice))
    }

    async fn attempt_charge(
        &self,
        invoice_ref: &str,
        payment_method_ref: &str,
    ) -> GatewayResult<ChargeResult> {
        let invoice_id = invoice_ref
            .parse::<InvoiceId>()
            .map_err(|e| GatewayError::Api(format!("Invalid invoice ID: {}", e)))?;

        let current = self.retrieve_invoice(&invoice_id).await?;
        if current.status == Some(stripe::InvoiceStatus::Paid) {
            return Ok(ChargeResult::Paid);
        }

        let paid: Result<Invoice, StripeError> = self
            .stripe
            .inner()
            .post_form(
                &format!("/invoices/{}/pay", invoice_id),
                PayInvoiceForm {
                    payment_method: payment_method_ref,
                    off_session: true,
                },
            )
            .await;

        match paid {
            Ok(invoice) if invoice.status == Some(stripe::InvoiceStatus::Paid) => {
                Ok(ChargeResult::Paid)
            }
            Ok(_) => {
                let invoice = self.retrieve_invoice(&invoice_id).await?;
                Ok(match Self::action_token(&invoice) {
                    Some(action_token) => ChargeResult::RequiresAction { action_token },
                    None => ChargeResult::Failed(DeclineReason::CardDeclined(
                        "invoice not paid".to_string(),
                    )),
                })
            }
            Err(StripeError::Stripe(request_error)) if request_error.http_status == 402 => {
                let decline_code = request_error.decline_code.clone().unwrap_or_default();
                let invoice = self.retrieve_invoice(&invoice_id).await?;
                if let Some(action_token) = Self::action_token(&invoice) {
                    return Ok(ChargeResult::RequiresAction { action_token });
                }

                tracing::info!(
                    invoice_id = %invoice_id,
                    decline_code = %decline_code,
                    "Stripe declined invoice payment"
                );

                Ok(ChargeResult::Failed(match decline_code.as_str() {
                    "insufficient_funds" => DeclineReason::InsufficientFunds,
                    "authentication_required" => DeclineReason::AuthenticationRequired,
                    "" => DeclineReason::CardDeclined(
                        request_error
                            .message
                            .clone()
                            .unwrap_or_else(|| "card_declined".to_string()),
                    ),
                    other => DeclineReason::CardDeclined(other.to_string()),
                }))
            }
            Err(e) => Err(classify_error(e, "pay_invoice")),
        }
    }

    async fn default_payment_method(&self, customer_ref: &str) -> GatewayResult<Option<String>> {
        let customer_id = parse_customer_id(customer_ref)?;
        let customer = stripe::Customer::retrieve(self.stripe.inner(), &customer_id, &[])
            .await
            .map_err(|e| classify_error(e, "retrieve_customer"))?;

        Ok(customer
            .invoice_settings
            .and_then(|settings| settings.default_payment_method)
            .map(|pm| match pm {
                Expandable::Id(id) => id.to_string(),
                Expandable::Object(obj) => obj.id.to_string(),
            }))
    }
}

fn parse_customer_id(customer_ref: &str) -> GatewayResult<CustomerId> {
    customer_ref
        .parse::<CustomerId>()
        .map_err(|e| GatewayError::NotConfigured(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(subscription_ref: &str) -> GatewayResult<SubscriptionId> {
    subscription_ref
        .parse::<SubscriptionId>()
        .map_err(|e| GatewayError::NotConfigured(format!("Invalid subscription ID: {}", e)))
}

fn to_gateway_invoice(invoice: &Invoice) -> GatewayInvoice {
    GatewayInvoice {
        id: invoice.id.to_string(),
        amount_due_cents: invoice.amount_due.unwrap_or(0),
        currency: invoice
            .currency
            .map(|c| c.to_string())
            .unwrap_or_else(|| "usd".to_string()),
        status: match invoice.status {
            Some(stripe::InvoiceStatus::Draft) => InvoiceStatus::Draft,
            Some(stripe::InvoiceStatus::Paid) => InvoiceStatus::Paid,
            Some(stripe::InvoiceStatus::Void) => InvoiceStatus::Void,
            Some(stripe::InvoiceStatus::Uncollectible) => InvoiceStatus::Uncollectible,
            _ => InvoiceStatus::Open,
        },
        hosted_invoice_url: invoice.hosted_invoice_url.clone(),
    }
}

/// Rate limits, 5xx and network failures are transient
fn classify_error(error: StripeError, operation: &'static str) -> GatewayError {
    match error {
        StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            let message = request_error
                .message
                .unwrap_or_else(|| "Unknown error".to_string());
            if status == 429 || (500..600).contains(&status) {
                tracing::warn!(
                    operation = operation,
                    http_status = status,
                    error = %message,
                    "Transient Stripe error"
                );
                GatewayError::Unavailable(format!("{} ({}): {}", operation, status, message))
            } else {
                GatewayError::Api(format!("{} ({}): {}", operation, status, message))
            }
        }
        StripeError::Timeout => GatewayError::Timeout(operation),
        StripeError::ClientError(msg) => {
            GatewayError::Unavailable(format!("{}: {}", operation, msg))
        }
        other => GatewayError::Api(format!("{}: {}", operation, other)),
    }
}
