//! History Reconciler
//!
//! Backstop for successes the poller never saw, e.g. after a reload lost the
//! polling session. Every successful transaction is routed through the
//! notifier's guard, so already-announced intents stay quiet.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tuition_core::{HistoryFilter, IntentId, PaymentGateway, PaymentIntent, PaymentStatus, Result};

use crate::events::DetectionPath;
use crate::notifier::{ReconciliationNotifier, SuccessSignal};

/// Outcome of one history reconciliation
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryReport {
    /// Transactions as fetched, newest first
    pub transactions: Vec<PaymentIntent>,

    /// Intents this run announced
    pub notified: Vec<IntentId>,
}

pub struct HistoryReconciler {
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<ReconciliationNotifier>,
}

impl HistoryReconciler {
    pub fn new(gateway: Arc<dyn PaymentGateway>, notifier: Arc<ReconciliationNotifier>) -> Self {
        Self { gateway, notifier }
    }

    pub async fn reconcile(&self, filter: HistoryFilter) -> Result<HistoryReport> {
        let transactions = self.gateway.get_payment_history(filter).await?;

        let notified: Vec<IntentId> = transactions
            .iter()
            .filter(|tx| tx.status == PaymentStatus::Success)
            .filter(|tx| !self.notifier.ledger().is_processed(&tx.uuid))
            .filter(|tx| {
                self.notifier
                    .notify(SuccessSignal::from_intent(tx, DetectionPath::History))
            })
            .map(|tx| tx.uuid.clone())
            .collect();

        tracing::info!(
            filter = filter.as_query(),
            transactions = transactions.len(),
            notified = notified.len(),
            "History reconciled"
        );

        Ok(HistoryReport {
            transactions,
            notified,
        })
    }
}
