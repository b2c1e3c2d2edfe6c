//! # tuition-reconciler
//!
//! Client-side payment status reconciliation for tuition payments: detect
//! that a payment succeeded, tell the user exactly once, and recover when
//! the fast path was not running.
//!
//! ## Flow
//!
//! ```text
//!  PaymentCreator ──▶ StatusPoller ──▶ ReconciliationNotifier ──▶ EventBus
//!                          ▲                  │      ▲
//!  CancellationController ─┘                  ▼      │
//!                                    ProcessedLedger  │
//!                                                     │
//!  HistoryReconciler (backstop) ──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tuition_reconciler::{ReconciliationEngine, ReconcilerConfig};
//!
//! let engine = ReconciliationEngine::new(gateway, store, ReconcilerConfig::from_env());
//! let mut events = engine.subscribe();
//!
//! let intent = engine.create_payment(dec!(100_000), "bri_va".parse()?).await?;
//! while let Ok(event) = events.recv().await {
//!     // render notification / refresh balance
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod creator;
pub mod engine;
pub mod events;
pub mod history;
pub mod intents;
pub mod ledger;
pub mod notifier;
pub mod poller;

pub use cancel::CancellationController;
pub use config::{MethodRules, ReconcilerConfig};
pub use creator::{BalanceCache, PaymentCreator};
pub use engine::ReconciliationEngine;
pub use events::{DetectionPath, DismissReason, EventBus, PortalEvent, ReconciliationEvent};
pub use history::{HistoryReconciler, HistoryReport};
pub use intents::IntentBook;
pub use ledger::{LEDGER_KEY, ProcessedLedger};
pub use notifier::{ReconciliationNotifier, SuccessSignal};
pub use poller::{PollHandle, PollListener, PollState, StatusPoller};

// Re-export core types for convenience
pub use tuition_core::{
    HistoryFilter, IntentId, PaymentError, PaymentIntent, PaymentMethod, PaymentStatus, Result,
};
