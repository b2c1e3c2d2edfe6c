//! Cancellation Controller
//!
//! Cancels a pending intent at the gateway and, once acknowledged, halts its
//! polling session. A failed cancel changes nothing locally.

use std::sync::Arc;

use chrono::Utc;

use tuition_core::{CancelAck, IntentId, PaymentError, PaymentGateway, PaymentStatus, Result};

use crate::events::{EventBus, PortalEvent};
use crate::intents::IntentBook;
use crate::poller::StatusPoller;

pub struct CancellationController {
    gateway: Arc<dyn PaymentGateway>,
    poller: Arc<StatusPoller>,
    intents: Arc<IntentBook>,
    events: EventBus,
}

impl CancellationController {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        poller: Arc<StatusPoller>,
        intents: Arc<IntentBook>,
        events: EventBus,
    ) -> Self {
        Self {
            gateway,
            poller,
            intents,
            events,
        }
    }

    /// Cancel `uuid`.
    ///
    /// Open intents are checked locally first; anything else is left to the
    /// backend to refuse.
    pub async fn cancel(&self, uuid: &IntentId) -> Result<CancelAck> {
        if let Some(intent) = self.intents.get(uuid) {
            let now = Utc::now();
            if !intent.can_cancel_at(now) {
                return Err(PaymentError::InvalidState(format!(
                    "payment {uuid} is {} and can no longer be cancelled",
                    intent.effective_status_at(now)
                )));
            }
        }

        let ack = self.gateway.cancel_payment(uuid).await.map_err(|e| {
            tracing::warn!(uuid = %uuid, error = %e, "Cancel rejected, payment left as is");
            e
        })?;

        self.poller.cancel(uuid);

        if let Err(e) = self.intents.advance(uuid, PaymentStatus::Failed) {
            tracing::debug!(uuid = %uuid, error = %e, "Cancelled intent already settled locally");
        }
        self.intents.close(uuid);

        tracing::info!(uuid = %uuid, message = %ack.message, "Payment cancelled");
        self.events.publish(PortalEvent::PaymentCancelled {
            uuid: uuid.clone(),
            message: ack.message.clone(),
        });

        Ok(ack)
    }
}
