//! Reconciliation Engine
//!
//! One engine per user session. It owns the poller, notifier, ledger handle
//! and gateway handle, and exposes the call set the hosting page uses.
//! Dropping the engine stops any polling and pending dismissal timers.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::broadcast;

use tuition_core::{
    CancelAck, HistoryFilter, IntentId, KeyValueStore, PaymentError, PaymentGateway,
    PaymentIntent, PaymentMethod, PaymentStatus, RemainingBalance, Result, StatusReport,
};

use crate::cancel::CancellationController;
use crate::config::ReconcilerConfig;
use crate::creator::{BalanceCache, PaymentCreator};
use crate::events::{DetectionPath, EventBus, PortalEvent};
use crate::history::{HistoryReconciler, HistoryReport};
use crate::intents::IntentBook;
use crate::ledger::ProcessedLedger;
use crate::notifier::{ReconciliationNotifier, SuccessSignal};
use crate::poller::{PollHandle, PollListener, PollState, StatusPoller};

/// Routes poller outcomes into intents, notifications and events
struct EngineListener {
    intents: Arc<IntentBook>,
    notifier: Arc<ReconciliationNotifier>,
    events: EventBus,
}

impl PollListener for EngineListener {
    fn on_terminal(&self, uuid: &IntentId, report: &StatusReport) {
        let open = self.intents.get(uuid);
        if let Err(e) = self.intents.advance(uuid, report.status) {
            tracing::warn!(uuid = %uuid, error = %e, "Ignoring backwards status report");
        }

        if report.status == PaymentStatus::Success {
            let mut signal = SuccessSignal::from_report(report, DetectionPath::Poller);
            if let Some(intent) = open {
                if signal.amount.is_zero() {
                    signal.amount = intent.nominal;
                }
                signal.method.get_or_insert(intent.method);
            }
            self.notifier.notify(signal);
        }

        self.events.publish(PortalEvent::PollingStopped {
            uuid: uuid.clone(),
            status: Some(report.status),
        });
    }

    fn on_stopped(&self, uuid: &IntentId, state: PollState) {
        let status = match state {
            PollState::Success => Some(PaymentStatus::Success),
            PollState::Failed => Some(PaymentStatus::Failed),
            PollState::Expired => Some(PaymentStatus::Expired),
            _ => None,
        };
        self.events.publish(PortalEvent::PollingStopped {
            uuid: uuid.clone(),
            status,
        });
    }
}

/// Payment status reconciliation for one session
pub struct ReconciliationEngine {
    config: ReconcilerConfig,
    gateway: Arc<dyn PaymentGateway>,
    events: EventBus,
    ledger: Arc<ProcessedLedger>,
    intents: Arc<IntentBook>,
    notifier: Arc<ReconciliationNotifier>,
    poller: Arc<StatusPoller>,
    creator: PaymentCreator,
    history: HistoryReconciler,
    cancellation: CancellationController,
}

impl ReconciliationEngine {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn KeyValueStore>,
        config: ReconcilerConfig,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let ledger = Arc::new(ProcessedLedger::load(store));
        let balance = Arc::new(BalanceCache::new(config.balance_ttl));
        let intents = Arc::new(IntentBook::new());

        let notifier = Arc::new(ReconciliationNotifier::new(
            ledger.clone(),
            events.clone(),
            balance.clone(),
            config.dismiss_after,
        ));

        let listener = Arc::new(EngineListener {
            intents: intents.clone(),
            notifier: notifier.clone(),
            events: events.clone(),
        });
        let poller = Arc::new(StatusPoller::new(gateway.clone(), listener, config.poll_interval));

        let creator = PaymentCreator::new(gateway.clone(), config.rules.clone(), balance);
        let history = HistoryReconciler::new(gateway.clone(), notifier.clone());
        let cancellation =
            CancellationController::new(gateway.clone(), poller.clone(), intents.clone(), events.clone());

        tracing::debug!(gateway = gateway.name(), processed = ledger.len(), "Reconciliation engine ready");

        Self {
            config,
            gateway,
            events,
            ledger,
            intents,
            notifier,
            poller,
            creator,
            history,
            cancellation,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    /// Observe engine events
    pub fn subscribe(&self) -> broadcast::Receiver<PortalEvent> {
        self.events.subscribe()
    }

    /// Validate and create a payment, then poll it after the grace delay
    pub async fn create_payment(&self, nominal: Decimal, method: PaymentMethod) -> Result<PaymentIntent> {
        let intent = self.creator.create(nominal, method).await?;
        self.intents.open(intent.clone());
        self.start_session(intent.uuid.clone(), self.config.grace_delay);
        Ok(intent)
    }

    /// Poll `uuid` immediately, replacing any active session.
    ///
    /// Refused with `InvalidState` once the uuid is settled or announced.
    pub fn start_polling(&self, uuid: IntentId) -> Result<PollHandle> {
        if let Some(status) = self.intents.terminal_status(&uuid) {
            return Err(PaymentError::InvalidState(format!(
                "payment {uuid} is already {status}"
            )));
        }
        if self.ledger.is_processed(&uuid) {
            return Err(PaymentError::InvalidState(format!(
                "payment {uuid} is already reconciled"
            )));
        }
        Ok(self.start_session(uuid, Duration::ZERO))
    }

    fn start_session(&self, uuid: IntentId, delay: Duration) -> PollHandle {
        let handle = self.poller.start(uuid.clone(), delay);
        self.events.publish(PortalEvent::PollingStarted { uuid });
        handle
    }

    pub async fn cancel_payment(&self, uuid: &IntentId) -> Result<CancelAck> {
        self.cancellation.cancel(uuid).await
    }

    pub fn is_processed(&self, uuid: &IntentId) -> bool {
        self.ledger.is_processed(uuid)
    }

    /// Record `uuid` as announced without notifying
    pub fn mark_processed(&self, uuid: &IntentId) {
        self.ledger.mark_processed(uuid);
    }

    pub fn processed(&self) -> Vec<IntentId> {
        self.ledger.snapshot()
    }

    /// Fetch history and announce any success the poller missed.
    ///
    /// Terminal statuses also end the matching polling session and advance
    /// open intents.
    pub async fn reconcile_history(&self, filter: HistoryFilter) -> Result<HistoryReport> {
        let report = self.history.reconcile(filter).await?;

        for tx in report.transactions.iter().filter(|tx| tx.status.is_terminal()) {
            if let Some(state) = PollState::from_status(tx.status) {
                self.poller.conclude(&tx.uuid, state);
            }
            if let Err(e) = self.intents.advance(&tx.uuid, tx.status) {
                tracing::warn!(uuid = %tx.uuid, error = %e, "History disagrees with open intent");
            }
        }

        Ok(report)
    }

    /// Dismiss a success notification early
    pub fn dismiss(&self, uuid: &IntentId) -> bool {
        self.notifier.dismiss(uuid)
    }

    /// Close the detail view for `uuid`, stopping its polling
    pub fn close_intent(&self, uuid: &IntentId) -> Option<PaymentIntent> {
        self.poller.stop_uuid(uuid);
        self.intents.close(uuid)
    }

    /// Open intent snapshot
    pub fn intent(&self, uuid: &IntentId) -> Option<PaymentIntent> {
        self.intents.get(uuid)
    }

    /// Handle to the most recent polling session
    pub fn polling(&self) -> Option<PollHandle> {
        self.poller.handle()
    }

    pub async fn remaining_balance(&self) -> Result<RemainingBalance> {
        self.creator.remaining_balance().await
    }

    /// Stop polling and drop pending dismissal timers
    pub fn shutdown(&self) {
        if let Some(uuid) = self.poller.stop() {
            tracing::info!(uuid = %uuid, "Polling stopped on shutdown");
        }
        self.notifier.cancel_timers();
    }
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tuition_core::{MemoryStore, MockGateway, ValidationError};

    use crate::events::ReconciliationEvent;

    fn engine(gateway: &Arc<MockGateway>, store: &Arc<MemoryStore>) -> ReconciliationEngine {
        ReconciliationEngine::new(gateway.clone(), store.clone(), ReconcilerConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<PortalEvent>) -> Vec<PortalEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn notifications(events: &[PortalEvent]) -> Vec<&ReconciliationEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                PortalEvent::Notification(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_success_then_history_is_quiet() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(MemoryStore::new());
        let engine = engine(&gateway, &store);
        let mut rx = engine.subscribe();

        let method: PaymentMethod = "bank_va".parse().unwrap();
        let intent = engine.create_payment(dec!(100_000), method).await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Pending);
        gateway.script_statuses(
            &intent.uuid,
            [PaymentStatus::Pending, PaymentStatus::Pending, PaymentStatus::Success],
        );

        // grace 1s, then ticks at 1.8s, 2.6s, 3.4s
        advance(4_000).await;
        let events = drain(&mut rx);
        let shown = notifications(&events);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].uuid, intent.uuid);
        assert_eq!(shown[0].amount, dec!(100_000));
        assert_eq!(shown[0].source, DetectionPath::Poller);
        assert!(events.contains(&PortalEvent::PollingStopped {
            uuid: intent.uuid.clone(),
            status: Some(PaymentStatus::Success),
        }));
        assert_eq!(gateway.status_checks_for(&intent.uuid), 3);
        assert_eq!(engine.intent(&intent.uuid).unwrap().status, PaymentStatus::Success);
        assert!(engine.is_processed(&intent.uuid));

        let report = engine.reconcile_history(HistoryFilter::All).await.unwrap();
        assert_eq!(report.transactions.len(), 1);
        assert!(report.notified.is_empty());
        assert!(notifications(&drain(&mut rx)).is_empty());

        advance(5_000).await;
        assert_eq!(gateway.status_checks_for(&intent.uuid), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_makes_no_network_call() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine(&gateway, &Arc::new(MemoryStore::new()));

        let err = engine
            .create_payment(dec!(300_000), PaymentMethod::Qris)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PaymentError::Validation(ValidationError::AboveMethodMaximum { .. })
        ));
        assert_eq!(err.user_message(), "Maximum for qris is Rp 250.000.");
        assert_eq!(gateway.calls().total(), 0);
        assert!(engine.polling().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_straggling_success() {
        let gateway = Arc::new(MockGateway::default().with_status_delay(Duration::from_millis(300)));
        let engine = engine(&gateway, &Arc::new(MemoryStore::new()));
        let mut rx = engine.subscribe();

        let intent = engine.create_payment(dec!(100_000), PaymentMethod::Qris).await.unwrap();
        gateway.script_statuses(&intent.uuid, [PaymentStatus::Pending, PaymentStatus::Success]);

        // second check leaves at 2.6s and would answer success at 2.9s
        advance(2_700).await;
        let handle = engine.polling().unwrap();
        assert!(handle.is_active());

        let ack = engine.cancel_payment(&intent.uuid).await.unwrap();
        assert_eq!(ack.status, PaymentStatus::Failed);
        assert_eq!(handle.state(), PollState::Cancelled);

        advance(1_000).await;
        assert!(!engine.is_processed(&intent.uuid));
        assert_eq!(gateway.status_checks_for(&intent.uuid), 2);
        assert!(engine.intent(&intent.uuid).is_none());

        let events = drain(&mut rx);
        assert!(notifications(&events).is_empty());
        assert!(events.iter().any(|e| matches!(e, PortalEvent::PaymentCancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_backstop_after_reload() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(MemoryStore::new());

        let before = engine(&gateway, &store);
        let intent = before
            .create_payment(dec!(100_000), "bank_va".parse().unwrap())
            .await
            .unwrap();
        advance(1_900).await;
        assert_eq!(gateway.status_checks_for(&intent.uuid), 1);

        // Reload: poller gone, session store kept
        drop(before);
        gateway.set_status(&intent.uuid, PaymentStatus::Success);
        advance(3_000).await;
        assert_eq!(gateway.status_checks_for(&intent.uuid), 1);

        let after = engine(&gateway, &store);
        let mut rx = after.subscribe();

        let report = after.reconcile_history(HistoryFilter::All).await.unwrap();
        assert_eq!(report.notified, vec![intent.uuid.clone()]);

        let again = after.reconcile_history(HistoryFilter::Success).await.unwrap();
        assert!(again.notified.is_empty());

        let events = drain(&mut rx);
        let shown = notifications(&events);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].source, DetectionPath::History);
        assert_eq!(gateway.balance(), dec!(6_900_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ledger_survives_reload() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(MemoryStore::new());

        let before = engine(&gateway, &store);
        let intent = before.create_payment(dec!(500_000), "bca_va".parse().unwrap()).await.unwrap();
        gateway.script_statuses(&intent.uuid, [PaymentStatus::Success]);
        advance(2_000).await;
        assert!(before.is_processed(&intent.uuid));
        drop(before);

        let after = engine(&gateway, &store);
        let report = after.reconcile_history(HistoryFilter::All).await.unwrap();
        assert!(report.notified.is_empty());
        assert!(after.is_processed(&intent.uuid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_success_ends_active_session() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine(&gateway, &Arc::new(MemoryStore::new()));
        let mut rx = engine.subscribe();

        let intent = engine.create_payment(dec!(100_000), PaymentMethod::Qris).await.unwrap();
        advance(1_900).await;
        gateway.set_status(&intent.uuid, PaymentStatus::Success);

        let report = engine.reconcile_history(HistoryFilter::All).await.unwrap();
        assert_eq!(report.notified, vec![intent.uuid.clone()]);
        assert_eq!(engine.polling().unwrap().state(), PollState::Success);

        advance(3_000).await;
        assert_eq!(gateway.status_checks_for(&intent.uuid), 1);
        assert_eq!(notifications(&drain(&mut rx)).len(), 1);
        assert_eq!(engine.intent(&intent.uuid).unwrap().status, PaymentStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_processed_suppresses_notification() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine(&gateway, &Arc::new(MemoryStore::new()));
        let mut rx = engine.subscribe();

        let intent = engine.create_payment(dec!(100_000), PaymentMethod::Qris).await.unwrap();
        engine.mark_processed(&intent.uuid);
        gateway.script_statuses(&intent.uuid, [PaymentStatus::Success]);
        advance(2_000).await;

        let events = drain(&mut rx);
        assert!(notifications(&events).is_empty());
        assert!(events.contains(&PortalEvent::PollingStopped {
            uuid: intent.uuid.clone(),
            status: Some(PaymentStatus::Success),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_intent_stops_polling() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine(&gateway, &Arc::new(MemoryStore::new()));

        let intent = engine.create_payment(dec!(100_000), PaymentMethod::Qris).await.unwrap();
        advance(2_000).await;
        assert!(engine.close_intent(&intent.uuid).is_some());
        assert!(!engine.polling().unwrap().is_active());

        advance(5_000).await;
        assert_eq!(gateway.status_checks_for(&intent.uuid), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_polling_switches_intent() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine(&gateway, &Arc::new(MemoryStore::new()));

        let first = engine.create_payment(dec!(100_000), PaymentMethod::Qris).await.unwrap();
        let second = engine.create_payment(dec!(60_000), "bni_va".parse().unwrap()).await.unwrap();
        advance(1_900).await;
        assert_eq!(gateway.status_checks_for(&first.uuid), 0);
        assert_eq!(gateway.status_checks_for(&second.uuid), 1);

        let handle = engine.start_polling(first.uuid.clone()).unwrap();
        advance(900).await;
        assert_eq!(handle.ticks(), 1);
        assert_eq!(gateway.status_checks_for(&second.uuid), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_payment_is_not_polled_again() {
        let gateway = Arc::new(MockGateway::default());
        let engine = engine(&gateway, &Arc::new(MemoryStore::new()));

        let paid = engine.create_payment(dec!(100_000), PaymentMethod::Qris).await.unwrap();
        gateway.script_statuses(&paid.uuid, [PaymentStatus::Success]);
        advance(2_000).await;
        assert_eq!(gateway.status_checks_for(&paid.uuid), 1);
        assert!(engine.is_processed(&paid.uuid));

        let err = engine.start_polling(paid.uuid.clone()).unwrap_err();
        assert!(matches!(err, PaymentError::InvalidState(_)));

        // closed views keep their terminal status
        engine.close_intent(&paid.uuid);
        assert!(engine.start_polling(paid.uuid.clone()).is_err());

        let cancelled = engine.create_payment(dec!(60_000), "bri_va".parse().unwrap()).await.unwrap();
        engine.cancel_payment(&cancelled.uuid).await.unwrap();
        assert!(engine.intent(&cancelled.uuid).is_none());
        assert!(engine.start_polling(cancelled.uuid.clone()).is_err());

        // announced through another path without an open intent
        let foreign = IntentId::from("inv-foreign");
        engine.mark_processed(&foreign);
        assert!(engine.start_polling(foreign.clone()).is_err());

        advance(5_000).await;
        assert_eq!(gateway.status_checks_for(&paid.uuid), 1);
        assert_eq!(gateway.status_checks_for(&cancelled.uuid), 0);
        assert_eq!(gateway.status_checks_for(&foreign), 0);
    }
}
