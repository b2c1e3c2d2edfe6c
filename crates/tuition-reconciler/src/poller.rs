//! Status Poller
//!
//! Owns at most one recurring status check. Each session runs as its own
//! tokio task: an optional grace delay, then a fixed-interval loop that
//! awaits every response before the next tick is due, so checks never
//! overlap and missed ticks are delayed rather than bursted.
//!
//! ```text
//! Idle ──start──▶ Active ──success──▶ Success
//!                   │ ├────expired──▶ Expired
//!                   │ ├────failed───▶ Failed
//!                   │ ├────cancel───▶ Cancelled
//!                   │ └────stop─────▶ Stopped
//!                   └─ pending / request error: stay Active
//! ```
//!
//! Every response is applied under the session lock after checking the
//! session is still active; anything arriving later is a stale response and
//! is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tuition_core::{IntentId, PaymentError, PaymentGateway, PaymentStatus, Result, StatusReport};

/// Lifecycle of a polling session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Active,
    Success,
    Expired,
    Failed,
    Cancelled,
    Stopped,
}

impl PollState {
    /// State a session ends in when the gateway reports `status`
    pub fn from_status(status: PaymentStatus) -> Option<Self> {
        match status {
            PaymentStatus::Pending => None,
            PaymentStatus::Success => Some(Self::Success),
            PaymentStatus::Failed => Some(Self::Failed),
            PaymentStatus::Expired => Some(Self::Expired),
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Receives session outcomes.
///
/// Called from the polling task or the stopping caller, never while the
/// poller holds a lock.
pub trait PollListener: Send + Sync {
    /// The gateway reported a terminal status; called once per session
    fn on_terminal(&self, uuid: &IntentId, report: &StatusReport);

    /// The session was stopped or cancelled before reaching a terminal status
    fn on_stopped(&self, _uuid: &IntentId, _state: PollState) {}
}

struct Session {
    uuid: IntentId,
    started_at: DateTime<Utc>,
    ticks: AtomicUsize,
    state: Mutex<PollState>,
    task: Mutex<Option<AbortHandle>>,
}

impl Session {
    fn new(uuid: IntentId) -> Self {
        Self {
            uuid,
            started_at: Utc::now(),
            ticks: AtomicUsize::new(0),
            state: Mutex::new(PollState::Active),
            task: Mutex::new(None),
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> PollState {
        *self.state_guard()
    }

    fn is_active(&self) -> bool {
        self.state().is_active()
    }

    fn attach(&self, handle: AbortHandle) {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// End an active session from outside its task.
    ///
    /// The state flips before the task is aborted, so a response already
    /// in flight finds the session inactive. Returns `false` if it had
    /// already ended.
    fn finish(&self, next: PollState) -> bool {
        {
            let mut state = self.state_guard();
            if !state.is_active() {
                return false;
            }
            *state = next;
        }

        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        true
    }

    /// Apply a status report.
    ///
    /// `Ok(Some(state))` when it ended the session, `Ok(None)` while still
    /// pending, `Err(StaleResponse)` when the session is no longer active.
    fn apply(&self, report: &StatusReport) -> Result<Option<PollState>> {
        let mut state = self.state_guard();
        if !state.is_active() {
            return Err(PaymentError::StaleResponse(self.uuid.to_string()));
        }

        let next = PollState::from_status(report.status);
        if let Some(next) = next {
            *state = next;
        }
        Ok(next)
    }
}

/// Handle to one polling session
#[derive(Clone)]
pub struct PollHandle {
    session: Arc<Session>,
    listener: Arc<dyn PollListener>,
}

impl PollHandle {
    /// Stop ticking (view teardown)
    pub fn stop(&self) {
        if self.session.finish(PollState::Stopped) {
            tracing::info!(uuid = %self.session.uuid, "Polling stopped");
            self.listener.on_stopped(&self.session.uuid, PollState::Stopped);
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    pub fn state(&self) -> PollState {
        self.session.state()
    }

    pub fn uuid(&self) -> &IntentId {
        &self.session.uuid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.session.started_at
    }

    /// Status checks issued so far
    pub fn ticks(&self) -> usize {
        self.session.ticks.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollHandle")
            .field("uuid", &self.session.uuid)
            .field("state", &self.state())
            .field("ticks", &self.ticks())
            .finish()
    }
}

/// Single-flight status poller
pub struct StatusPoller {
    gateway: Arc<dyn PaymentGateway>,
    listener: Arc<dyn PollListener>,
    interval: Duration,
    current: Mutex<Option<Arc<Session>>>,
}

impl StatusPoller {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        listener: Arc<dyn PollListener>,
        interval: Duration,
    ) -> Self {
        Self {
            gateway,
            listener,
            interval,
            current: Mutex::new(None),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start polling `uuid`, first waiting `delay`.
    ///
    /// Any active session is stopped before the new one is spawned. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, uuid: IntentId, delay: Duration) -> PollHandle {
        let session = Arc::new(Session::new(uuid.clone()));

        let superseded = {
            let mut current = self.current();
            let previous = current
                .replace(session.clone())
                .filter(|previous| previous.finish(PollState::Stopped));

            let task = tokio::spawn(run_session(
                session.clone(),
                self.gateway.clone(),
                self.listener.clone(),
                self.interval,
                delay,
            ));
            session.attach(task.abort_handle());

            previous
        };

        if let Some(previous) = superseded {
            tracing::info!(uuid = %previous.uuid, next = %uuid, "Polling superseded");
            self.listener.on_stopped(&previous.uuid, PollState::Stopped);
        }

        tracing::info!(
            uuid = %uuid,
            delay = ?delay,
            interval = ?self.interval,
            "Polling started"
        );

        PollHandle {
            session,
            listener: self.listener.clone(),
        }
    }

    /// Force the session for `uuid` into `Cancelled`; ticking has halted
    /// when this returns.
    pub fn cancel(&self, uuid: &IntentId) -> bool {
        self.conclude(uuid, PollState::Cancelled)
    }

    /// Stop the session for `uuid`, if it is the active one
    pub fn stop_uuid(&self, uuid: &IntentId) -> bool {
        self.conclude(uuid, PollState::Stopped)
    }

    /// Stop whatever session is active
    pub fn stop(&self) -> Option<IntentId> {
        let session = self.current().take()?;
        if session.finish(PollState::Stopped) {
            tracing::info!(uuid = %session.uuid, "Polling stopped");
            self.listener.on_stopped(&session.uuid, PollState::Stopped);
            Some(session.uuid.clone())
        } else {
            None
        }
    }

    /// End the active session for `uuid` in `state`
    pub fn conclude(&self, uuid: &IntentId, state: PollState) -> bool {
        let ended = {
            let current = self.current();
            current
                .as_ref()
                .is_some_and(|session| &session.uuid == uuid && session.finish(state))
        };

        if ended {
            tracing::info!(uuid = %uuid, state = ?state, "Polling ended");
            self.listener.on_stopped(uuid, state);
        }
        ended
    }

    /// Uuid of the active session, if any
    pub fn active_uuid(&self) -> Option<IntentId> {
        self.current()
            .as_ref()
            .filter(|session| session.is_active())
            .map(|session| session.uuid.clone())
    }

    pub fn is_polling(&self, uuid: &IntentId) -> bool {
        self.active_uuid().as_ref() == Some(uuid)
    }

    /// Handle to the most recent session, active or not
    pub fn handle(&self) -> Option<PollHandle> {
        self.current().as_ref().map(|session| PollHandle {
            session: session.clone(),
            listener: self.listener.clone(),
        })
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        if let Some(session) = self.current().take() {
            if session.finish(PollState::Stopped) {
                tracing::debug!(uuid = %session.uuid, "Polling torn down");
            }
        }
    }
}

async fn run_session(
    session: Arc<Session>,
    gateway: Arc<dyn PaymentGateway>,
    listener: Arc<dyn PollListener>,
    interval: Duration,
    delay: Duration,
) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !session.is_active() {
            break;
        }

        let tick = session.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let report = match gateway.get_payment_status(&session.uuid).await {
            Ok(report) => report,
            Err(e) => {
                let err = PaymentError::TransientPoll {
                    uuid: session.uuid.to_string(),
                    reason: e.to_string(),
                };
                tracing::warn!(tick, error = %err, "Status check failed, will retry");
                continue;
            }
        };

        match session.apply(&report) {
            Ok(None) => {
                tracing::debug!(uuid = %session.uuid, tick, "Payment still pending");
            }
            Ok(Some(state)) => {
                tracing::info!(uuid = %session.uuid, tick, state = ?state, "Polling reached terminal status");
                listener.on_terminal(&session.uuid, &report);
                break;
            }
            Err(stale) => {
                tracing::debug!(tick, error = %stale, "Discarding status response");
                break;
            }
        }
    }
}
