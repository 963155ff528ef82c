//! Email notifications for dunning escalation
//!
//! Sends the payment warning email via the Resend API. Delivery problems are
//! logged and reported as `Ok(false)`; they never undo the billing change
//! that triggered the email.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingResult;

/// Warning sent to the tenant owner when dunning reaches the threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentWarning {
    pub tenant_id: Uuid,
    pub tenant_name: String,
    pub to: String,
    pub amount_cents: i64,
    pub currency: String,
    pub reason: String,
    pub retry_count: i32,
}

/// Outbound notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns `Ok(true)` if delivered, `Ok(false)` if skipped or rejected
    async fn send_payment_warning(&self, warning: &PaymentWarning) -> BillingResult<bool>;
}

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "TenantOps <billing@tenantops.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "TenantOps".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@tenantops.app".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://tenantops.app".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl BillingEmailService {
    /// Create a new email service
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via Resend API
    ///
    /// Returns `Ok(true)` if the email was sent, `Ok(false)` if sending failed.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false)
            }
        }
    }

    fn render_payment_warning(&self, warning: &PaymentWarning) -> String {
        let amount = format_amount(warning.amount_cents, &warning.currency);
        let pay_link = format!("{}/billing/overdue", self.config.dashboard_url);

        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #dc2626;">Action needed: payment overdue</h2>
    <p>Hi there,</p>
    <p>We tried {attempts} times to collect <strong>{amount}</strong> for <strong>{tenant_name}</strong> and the payment did not go through.</p>
    <p>Last error: {reason}</p>
    <p>Please pay the outstanding balance or update your payment method to avoid any interruption to your service.</p>
    <p>
        <a href="{pay_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Pay now
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        If you have any questions, please contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            attempts = warning.retry_count,
            amount = amount,
            tenant_name = warning.tenant_name,
            reason = warning.reason,
            pay_link = pay_link,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        )
    }
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn send_payment_warning(&self, warning: &PaymentWarning) -> BillingResult<bool> {
        let html = self.render_payment_warning(warning);
        self.send_email(
            &warning.to,
            &format!("Payment overdue - {}", self.config.app_name),
            &html,
        )
        .await
    }
}

/// Format an amount in minor units, e.g. `4900, "usd"` -> `$49.00`
pub fn format_amount(amount_cents: i64, currency: &str) -> String {
    let major = amount_cents as f64 / 100.0;
    match currency.to_lowercase().as_str() {
        "usd" => format!("${:.2}", major),
        "eur" => format!("€{:.2}", major),
        "gbp" => format!("£{:.2}", major),
        other => format!("{:.2} {}", major, other.to_uppercase()),
    }
}
