//! Application State

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use tuition_core::{KeyValueStore, MemoryStore, MockGateway, PaymentGateway, Result};
use tuition_gateway::{GatewayConfig, HttpGateway};
use tuition_reconciler::{ReconcilerConfig, ReconciliationEngine};

/// Which backend new sessions talk to
#[derive(Clone, Debug)]
pub enum GatewayMode {
    /// The portal backend, authenticated with each session's bearer token
    Portal(GatewayConfig),

    /// In-memory mock (local demos)
    Mock,
}

impl GatewayMode {
    /// `PORTAL_GATEWAY=mock` selects the mock; anything else the portal
    pub fn from_env() -> Self {
        match std::env::var("PORTAL_GATEWAY").as_deref() {
            Ok("mock") => Self::Mock,
            _ => Self::Portal(GatewayConfig::from_env()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Portal(_) => "portal",
            Self::Mock => "mock",
        }
    }

    pub fn requires_token(&self) -> bool {
        matches!(self, Self::Portal(_))
    }

    fn gateway(&self, token: Option<&str>) -> Result<Arc<dyn PaymentGateway>> {
        let gateway: Arc<dyn PaymentGateway> = match self {
            Self::Portal(config) => {
                let gateway = HttpGateway::new(config)?;
                Arc::new(match token {
                    Some(token) => gateway.with_token(token),
                    None => gateway,
                })
            }
            Self::Mock => Arc::new(MockGateway::default()),
        };
        Ok(gateway)
    }
}

/// Sessions untouched for this long are evicted
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// One browser session: an engine and the session-scoped ledger store
pub struct Session {
    pub engine: ReconciliationEngine,
    pub created_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
}

impl Session {
    fn new(engine: ReconciliationEngine) -> Self {
        Self {
            engine,
            created_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Backend selection for new sessions
    pub mode: GatewayMode,

    /// Engine configuration applied to every session
    pub config: ReconcilerConfig,

    /// Idle time after which a session is evicted
    pub idle_ttl: Duration,

    /// Live sessions by id
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl AppState {
    pub fn new(mode: GatewayMode, config: ReconcilerConfig) -> Self {
        Self {
            mode,
            config,
            idle_ttl: DEFAULT_IDLE_TTL,
            sessions: Arc::default(),
        }
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    /// Start a session with a fresh store and engine
    pub fn open_session(&self, token: Option<&str>) -> Result<String> {
        let gateway = self.mode.gateway(token)?;
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let engine = ReconciliationEngine::new(gateway, store, self.config.clone());

        let id = uuid::Uuid::new_v4().to_string();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::new(Session::new(engine)));

        tracing::info!(session = %id, gateway = self.mode.name(), "Session opened");
        Ok(id)
    }

    /// Look up a session and mark it used
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        let session = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()?;
        session.touch();
        Some(session)
    }

    /// End a session: polling and timers stop now, the store goes with it
    pub fn close_session(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        match removed {
            Some(session) => {
                session.engine.shutdown();
                tracing::info!(
                    session = %id,
                    age_secs = (Utc::now() - session.created_at).num_seconds(),
                    "Session closed"
                );
                true
            }
            None => false,
        }
    }

    /// Drop every session idle for at least `idle_ttl`, stopping its engine
    pub fn evict_idle(&self) -> Vec<String> {
        let now = Instant::now();
        let evicted: Vec<(String, Arc<Session>)> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let idle: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.idle_for(now) >= self.idle_ttl)
                .map(|(id, _)| id.clone())
                .collect();
            idle.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|session| (id, session)))
                .collect()
        };

        for (id, session) in &evicted {
            session.engine.shutdown();
            tracing::info!(
                session = %id,
                idle_secs = session.idle_for(now).as_secs(),
                "Idle session evicted"
            );
        }

        evicted.into_iter().map(|(id, _)| id).collect()
    }

    /// Run `evict_idle` every `every` until the runtime shuts down
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = state.evict_idle();
                if !evicted.is_empty() {
                    tracing::debug!(evicted = evicted.len(), live = state.session_count(), "Session sweep");
                }
            }
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
