//! Mock Payment Gateway
//!
//! For testing and demo purposes. Keeps payments in memory, lets tests script
//! the status sequence each intent reports, inject outages, and count calls.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use super::PaymentGateway;
use crate::error::{PaymentError, Result};
use crate::model::{
    CancelAck, CreatePaymentRequest, HistoryFilter, IntentId, PaymentIntent, PaymentReference,
    PaymentStatus, RemainingBalance, StatusReport,
};

/// Number of calls made per endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub status: usize,
    pub cancel: usize,
    pub history: usize,
    pub balance: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.create + self.status + self.cancel + self.history + self.balance
    }
}

struct MockPayment {
    intent: PaymentIntent,
    /// Statuses to report on upcoming status checks, front first
    script: VecDeque<PaymentStatus>,
    status_checks: usize,
}

#[derive(Default)]
struct MockState {
    balance: Decimal,
    payments: HashMap<IntentId, MockPayment>,
    /// Insertion order, for history listings
    order: Vec<IntentId>,
    calls: CallCounts,
    failing_status_checks: usize,
    reject_create: Option<String>,
    reject_cancel: Option<String>,
}

/// In-memory gateway with scriptable behaviour
pub struct MockGateway {
    state: Mutex<MockState>,
    status_delay: Duration,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(dec!(7_000_000))
    }
}

impl MockGateway {
    /// Create with a remaining tuition balance
    pub fn new(balance: Decimal) -> Self {
        Self {
            state: Mutex::new(MockState {
                balance,
                ..MockState::default()
            }),
            status_delay: Duration::ZERO,
        }
    }

    /// Delay every status response (simulates round-trip latency)
    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an existing payment (e.g. one created before a reload)
    pub fn insert_payment(&self, intent: PaymentIntent) {
        let mut state = self.state();
        let uuid = intent.uuid.clone();
        if !state.payments.contains_key(&uuid) {
            state.order.push(uuid.clone());
        }
        state.payments.insert(
            uuid,
            MockPayment {
                intent,
                script: VecDeque::new(),
                status_checks: 0,
            },
        );
    }

    /// Queue the statuses the next status checks for `uuid` will report.
    ///
    /// Once the script runs out the last reported status repeats.
    pub fn script_statuses(
        &self,
        uuid: &IntentId,
        statuses: impl IntoIterator<Item = PaymentStatus>,
    ) {
        if let Some(payment) = self.state().payments.get_mut(uuid) {
            payment.script.extend(statuses);
        }
    }

    /// Settle a payment immediately, as the webhook would
    pub fn set_status(&self, uuid: &IntentId, status: PaymentStatus) {
        let mut state = self.state();
        Self::settle(&mut state, uuid, status);
    }

    /// Fail the next `count` status checks with a transport error
    pub fn fail_status_checks(&self, count: usize) {
        self.state().failing_status_checks = count;
    }

    /// Reject create requests with the given message (None to accept again)
    pub fn reject_create(&self, message: Option<&str>) {
        self.state().reject_create = message.map(str::to_string);
    }

    /// Reject cancel requests with the given message (None to accept again)
    pub fn reject_cancel(&self, message: Option<&str>) {
        self.state().reject_cancel = message.map(str::to_string);
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state().balance = balance;
    }

    pub fn balance(&self) -> Decimal {
        self.state().balance
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls.clone()
    }

    /// Status checks issued for one intent
    pub fn status_checks_for(&self, uuid: &IntentId) -> usize {
        self.state()
            .payments
            .get(uuid)
            .map_or(0, |p| p.status_checks)
    }

    pub fn payment(&self, uuid: &IntentId) -> Option<PaymentIntent> {
        self.state().payments.get(uuid).map(|p| p.intent.clone())
    }

    fn settle(state: &mut MockState, uuid: &IntentId, status: PaymentStatus) {
        let Some(payment) = state.payments.get_mut(uuid) else {
            return;
        };

        if payment.intent.transition(status).unwrap_or(false) && status == PaymentStatus::Success {
            let nominal = payment.intent.nominal;
            state.balance = (state.balance - nominal).max(Decimal::ZERO);
        }
    }

    /// Fee schedule loosely modelled on common Indonesian gateways
    fn admin_fee(request: &CreatePaymentRequest) -> Decimal {
        if request.method.is_qris() {
            (request.nominal * dec!(0.007)).round_dp_with_strategy(0, RoundingStrategy::AwayFromZero)
        } else {
            dec!(4000)
        }
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<PaymentIntent> {
        let mut state = self.state();
        state.calls.create += 1;

        if let Some(message) = state.reject_create.clone() {
            return Err(PaymentError::Gateway { status: 400, message });
        }

        let uuid = IntentId::new(uuid::Uuid::new_v4().to_string());
        let admin_fee = Self::admin_fee(request);
        let reference = if request.method.is_qris() {
            PaymentReference::QrCode {
                payload: format!("00020101021226610016ID.CO.QRIS.WWW{}", uuid.as_str().replace('-', "")),
            }
        } else {
            PaymentReference::VirtualAccount {
                number: format!("8808{:012}", state.order.len() + 1),
            }
        };

        let mut intent = PaymentIntent::pending(uuid.clone(), request.nominal, request.method.clone());
        intent.admin_fee = admin_fee;
        intent.total_amount = request.nominal + admin_fee;
        intent.expires_at = Some(Utc::now() + chrono::Duration::hours(24));
        intent.payment_reference = Some(reference);
        intent.payment_url = Some(format!("https://pay.example.test/invoice/{uuid}"));

        state.order.push(uuid.clone());
        state.payments.insert(
            uuid,
            MockPayment {
                intent: intent.clone(),
                script: VecDeque::new(),
                status_checks: 0,
            },
        );

        tracing::debug!(uuid = %intent.uuid, nominal = %intent.nominal, "Mock payment created");
        Ok(intent)
    }

    async fn get_payment_status(&self, uuid: &IntentId) -> Result<StatusReport> {
        {
            let mut state = self.state();
            state.calls.status += 1;
            if let Some(payment) = state.payments.get_mut(uuid) {
                payment.status_checks += 1;
            }
        }

        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }

        let mut state = self.state();
        if state.failing_status_checks > 0 {
            state.failing_status_checks -= 1;
            return Err(PaymentError::Transport("simulated gateway outage".into()));
        }

        let next = state
            .payments
            .get_mut(uuid)
            .ok_or_else(|| PaymentError::Gateway {
                status: 404,
                message: "Invoice not found".into(),
            })?
            .script
            .pop_front();

        if let Some(status) = next {
            Self::settle(&mut state, uuid, status);
        }

        let payment = state
            .payments
            .get(uuid)
            .ok_or_else(|| PaymentError::NotFound(uuid.to_string()))?;

        // A scripted status wins even when it would not be a legal transition,
        // so tests can model a backend that reports inconsistently.
        let status = next.unwrap_or(payment.intent.status);
        let intent = &payment.intent;

        Ok(StatusReport {
            uuid: uuid.clone(),
            status,
            nominal: intent.nominal,
            total_amount: intent.total_amount,
            method: Some(intent.method.clone()),
            expires_at: intent.expires_at,
            payment_url: intent.payment_url.clone(),
        })
    }

    async fn cancel_payment(&self, uuid: &IntentId) -> Result<CancelAck> {
        let mut state = self.state();
        state.calls.cancel += 1;

        if let Some(message) = state.reject_cancel.clone() {
            return Err(PaymentError::Gateway { status: 500, message });
        }

        let payment = state.payments.get_mut(uuid).ok_or_else(|| PaymentError::Gateway {
            status: 404,
            message: "Invoice not found".into(),
        })?;

        if payment.intent.status != PaymentStatus::Pending {
            return Err(PaymentError::Gateway {
                status: 400,
                message: "Only pending payments can be cancelled".into(),
            });
        }

        payment.intent.status = PaymentStatus::Failed;
        payment.script.clear();

        Ok(CancelAck {
            uuid: uuid.clone(),
            status: PaymentStatus::Failed,
            message: "Payment cancelled".into(),
        })
    }

    async fn get_payment_history(&self, filter: HistoryFilter) -> Result<Vec<PaymentIntent>> {
        let mut state = self.state();
        state.calls.history += 1;

        // Newest first, like the backend
        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|uuid| state.payments.get(uuid))
            .map(|p| p.intent.clone())
            .filter(|intent| filter.matches(intent.status))
            .collect())
    }

    async fn get_remaining_balance(&self) -> Result<RemainingBalance> {
        let mut state = self.state();
        state.calls.balance += 1;
        Ok(RemainingBalance {
            remaining: state.balance,
        })
    }

    fn name(&self) -> &str {
        "MockGateway"
    }
}
