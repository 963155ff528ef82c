//! In-memory collaborators for tests and local runs
//!
//! - [`FakeGateway`]: scripted payment gateway that keeps invoices per
//!   subscription and period, and counts captures
//! - [`RecordingNotifier`]: keeps every warning it was asked to send

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::email::{Notifier, PaymentWarning};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeResult, DeclineReason, GatewayError, GatewayInvoice, GatewayResult, InvoiceStatus,
    PaymentGateway,
};

/// Outcome of the next `attempt_charge` call
#[derive(Debug, Clone)]
pub enum ScriptedCharge {
    Succeed,
    Decline(String),
    InsufficientFunds,
    RequireAction(String),
    Unavailable,
    /// Never answers; exercises caller timeouts
    Hang,
}

#[derive(Default)]
struct FakeState {
    /// (subscription_ref, period) -> invoice
    invoices: HashMap<(String, u32), GatewayInvoice>,
    script: VecDeque<ScriptedCharge>,
    default_payment_methods: HashMap<String, String>,
    period: u32,
    next_invoice: u32,
}

/// Scripted payment gateway
pub struct FakeGateway {
    amount_due_cents: i64,
    state: Mutex<FakeState>,
    lookups_unavailable: AtomicBool,
    calls: AtomicUsize,
    charge_attempts: AtomicUsize,
    captures: AtomicUsize,
    invoices_created: AtomicUsize,
}

impl FakeGateway {
    /// A gateway whose invoices are all for `amount_due_cents`; charges succeed unless scripted
    pub fn new(amount_due_cents: i64) -> Self {
        Self {
            amount_due_cents,
            state: Mutex::new(FakeState::default()),
            lookups_unavailable: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            charge_attempts: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
            invoices_created: AtomicUsize::new(0),
        }
    }

    /// Queue the outcome of the next charge attempt
    pub fn script(&self, charge: ScriptedCharge) {
        self.lock().script.push_back(charge);
    }

    /// Make invoice lookups fail as if the gateway were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lookups_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Start a new billing period; the next invoice is a fresh one
    pub fn advance_period(&self) {
        self.lock().period += 1;
    }

    pub fn set_default_payment_method(&self, customer_ref: &str, payment_method_ref: &str) {
        self.lock()
            .default_payment_methods
            .insert(customer_ref.to_string(), payment_method_ref.to_string());
    }

    /// Every trait method call
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn charge_attempts(&self) -> usize {
        self.charge_attempts.load(Ordering::SeqCst)
    }

    /// Charges that actually moved money
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn invoices_created(&self) -> usize {
        self.invoices_created.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        // A poisoned lock only means another test thread panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> GatewayResult<()> {
        if self.lookups_unavailable.load(Ordering::SeqCst) {
            Err(GatewayError::Unavailable("503 from fake gateway".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn find_open_invoice(
        &self,
        _customer_ref: &str,
        subscription_ref: &str,
    ) -> GatewayResult<Option<GatewayInvoice>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let state = self.lock();
        Ok(state
            .invoices
            .get(&(subscription_ref.to_string(), state.period))
            .filter(|invoice| invoice.status == InvoiceStatus::Open)
            .cloned())
    }

    async fn create_invoice_for_current_period(
        &self,
        _customer_ref: &str,
        subscription_ref: &str,
    ) -> GatewayResult<GatewayInvoice> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut state = self.lock();
        let key = (subscription_ref.to_string(), state.period);
        if let Some(existing) = state.invoices.get(&key) {
            return Ok(existing.clone());
        }
        state.next_invoice += 1;
        let invoice = GatewayInvoice {
            id: format!("in_fake_{}", state.next_invoice),
            amount_due_cents: self.amount_due_cents,
            currency: "usd".to_string(),
            status: InvoiceStatus::Open,
            hosted_invoice_url: None,
        };
        state.invoices.insert(key, invoice.clone());
        self.invoices_created.fetch_add(1, Ordering::SeqCst);
        Ok(invoice)
    }

    async fn attempt_charge(
        &self,
        invoice_ref: &str,
        payment_method_ref: &str,
    ) -> GatewayResult<ChargeResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.charge_attempts.fetch_add(1, Ordering::SeqCst);

        let scripted = {
            let mut state = self.lock();
            let already_paid = state
                .invoices
                .values()
                .any(|i| i.id == invoice_ref && i.status == InvoiceStatus::Paid);
            if already_paid {
                return Ok(ChargeResult::Paid);
            }
            if payment_method_ref.is_empty() {
                return Ok(ChargeResult::Failed(DeclineReason::NoPaymentMethod));
            }
            let scripted = state.script.pop_front().unwrap_or(ScriptedCharge::Succeed);
            if matches!(scripted, ScriptedCharge::Succeed) {
                match state.invoices.values_mut().find(|i| i.id == invoice_ref) {
                    Some(invoice) => invoice.status = InvoiceStatus::Paid,
                    None => {
                        return Err(GatewayError::Api(format!(
                            "No such invoice: {}",
                            invoice_ref
                        )))
                    }
                }
                self.captures.fetch_add(1, Ordering::SeqCst);
            }
            scripted
        };

        match scripted {
            ScriptedCharge::Succeed => Ok(ChargeResult::Paid),
            ScriptedCharge::Decline(code) => {
                Ok(ChargeResult::Failed(DeclineReason::CardDeclined(code)))
            }
            ScriptedCharge::InsufficientFunds => {
                Ok(ChargeResult::Failed(DeclineReason::InsufficientFunds))
            }
            ScriptedCharge::RequireAction(token) => Ok(ChargeResult::RequiresAction {
                action_token: token,
            }),
            ScriptedCharge::Unavailable => Err(GatewayError::Unavailable(
                "connection reset by fake gateway".to_string(),
            )),
            ScriptedCharge::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(GatewayError::Unavailable("hung call resumed".to_string()))
            }
        }
    }

    async fn default_payment_method(&self, customer_ref: &str) -> GatewayResult<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.lock().default_payment_methods.get(customer_ref).cloned())
    }
}

/// Notifier that records warnings instead of sending them
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<PaymentWarning>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<PaymentWarning> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_payment_warning(&self, warning: &PaymentWarning) -> BillingResult<bool> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError::Internal("mail relay rejected message".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(warning.clone());
        Ok(true)
    }
}
