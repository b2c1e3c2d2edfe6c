//! Reconciliation Notifier
//!
//! Turns success signals from any detection path into exactly one user
//! notification per intent. The ledger's atomic check-then-add decides who
//! announces; everyone else is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::task::AbortHandle;

use tuition_core::{IntentId, PaymentIntent, PaymentMethod, StatusReport};

use crate::creator::BalanceCache;
use crate::events::{DetectionPath, DismissReason, EventBus, PortalEvent, ReconciliationEvent};
use crate::ledger::ProcessedLedger;

/// A detection path saw an intent succeed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuccessSignal {
    pub uuid: IntentId,
    pub amount: Decimal,
    pub method: Option<PaymentMethod>,
    pub source: DetectionPath,
}

impl SuccessSignal {
    pub fn from_report(report: &StatusReport, source: DetectionPath) -> Self {
        Self {
            uuid: report.uuid.clone(),
            amount: report.nominal,
            method: report.method.clone(),
            source,
        }
    }

    pub fn from_intent(intent: &PaymentIntent, source: DetectionPath) -> Self {
        Self {
            uuid: intent.uuid.clone(),
            amount: intent.nominal,
            method: Some(intent.method.clone()),
            source,
        }
    }
}

type Timers = Arc<Mutex<HashMap<IntentId, AbortHandle>>>;

fn lock(timers: &Timers) -> MutexGuard<'_, HashMap<IntentId, AbortHandle>> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-time success notifications
pub struct ReconciliationNotifier {
    ledger: Arc<ProcessedLedger>,
    events: EventBus,
    balance: Arc<BalanceCache>,
    dismiss_after: Duration,
    timers: Timers,
}

impl ReconciliationNotifier {
    pub fn new(
        ledger: Arc<ProcessedLedger>,
        events: EventBus,
        balance: Arc<BalanceCache>,
        dismiss_after: Duration,
    ) -> Self {
        Self {
            ledger,
            events,
            balance,
            dismiss_after,
            timers: Arc::default(),
        }
    }

    pub fn ledger(&self) -> &Arc<ProcessedLedger> {
        &self.ledger
    }

    /// Announce a success unless it was already announced.
    ///
    /// Returns `true` if this call produced the notification. Must be called
    /// from within a tokio runtime.
    pub fn notify(&self, signal: SuccessSignal) -> bool {
        if !self.ledger.try_mark(&signal.uuid) {
            tracing::debug!(uuid = %signal.uuid, source = ?signal.source, "Success already announced");
            return false;
        }

        tracing::info!(
            uuid = %signal.uuid,
            amount = %signal.amount,
            source = ?signal.source,
            "Payment reconciled"
        );

        let uuid = signal.uuid.clone();
        self.events.publish(PortalEvent::Notification(ReconciliationEvent {
            uuid: signal.uuid,
            amount: signal.amount,
            method: signal.method,
            timestamp: Utc::now(),
            source: signal.source,
        }));

        self.balance.invalidate();
        self.events.publish(PortalEvent::RefreshRequested { uuid: uuid.clone() });

        self.schedule_dismiss(uuid);
        true
    }

    fn schedule_dismiss(&self, uuid: IntentId) {
        let timers = self.timers.clone();
        let events = self.events.clone();
        let after = self.dismiss_after;
        let key = uuid.clone();

        let mut pending = lock(&self.timers);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if lock(&timers).remove(&uuid).is_some() {
                tracing::debug!(uuid = %uuid, "Notification auto-dismissed");
                events.publish(PortalEvent::Dismissed {
                    uuid,
                    reason: DismissReason::Timeout,
                });
            }
        });
        pending.insert(key, task.abort_handle());
    }

    /// Dismiss a notification before its timer fires.
    ///
    /// Returns `false` if nothing was showing for `uuid`.
    pub fn dismiss(&self, uuid: &IntentId) -> bool {
        let Some(timer) = lock(&self.timers).remove(uuid) else {
            return false;
        };
        timer.abort();

        tracing::debug!(uuid = %uuid, "Notification dismissed");
        self.events.publish(PortalEvent::Dismissed {
            uuid: uuid.clone(),
            reason: DismissReason::User,
        });
        true
    }

    /// Notifications currently showing
    pub fn showing(&self) -> Vec<IntentId> {
        lock(&self.timers).keys().cloned().collect()
    }

    /// Abort every dismissal timer without publishing
    pub fn cancel_timers(&self) {
        for (_, timer) in lock(&self.timers).drain() {
            timer.abort();
        }
    }
}

impl Drop for ReconciliationNotifier {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}
