//! Engine Events
//!
//! Everything the hosting page observes goes through one broadcast stream.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tuition_core::{IntentId, PaymentMethod, PaymentStatus};

/// Which detection path saw the success first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionPath {
    Poller,
    History,
}

/// One-time success notification payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationEvent {
    pub uuid: IntentId,
    pub amount: Decimal,
    pub method: Option<PaymentMethod>,
    pub timestamp: DateTime<Utc>,
    pub source: DetectionPath,
}

/// Why a notification went away
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissReason {
    User,
    Timeout,
}

/// Events published to the hosting page
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortalEvent {
    /// Show the success notification
    Notification(ReconciliationEvent),

    /// Balance and history are stale and should be refetched
    RefreshRequested { uuid: IntentId },

    /// Hide the success notification
    Dismissed { uuid: IntentId, reason: DismissReason },

    PollingStarted { uuid: IntentId },

    /// Polling ended; `status` is set when it ended on a terminal status
    PollingStopped {
        uuid: IntentId,
        status: Option<PaymentStatus>,
    },

    PaymentCancelled { uuid: IntentId, message: String },
}

impl PortalEvent {
    pub fn uuid(&self) -> &IntentId {
        match self {
            Self::Notification(event) => &event.uuid,
            Self::RefreshRequested { uuid }
            | Self::Dismissed { uuid, .. }
            | Self::PollingStarted { uuid }
            | Self::PollingStopped { uuid, .. }
            | Self::PaymentCancelled { uuid, .. } => uuid,
        }
    }
}

/// Broadcast channel for [`PortalEvent`]s
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<PortalEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortalEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; events with no listener are dropped
    pub fn publish(&self, event: PortalEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::debug!(uuid = %event.uuid(), "No subscribers for event");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
