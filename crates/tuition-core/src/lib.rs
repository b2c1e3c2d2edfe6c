//! # tuition-core
//!
//! Shared domain model for tuition (UKT) payments and the collaborator
//! interfaces the reconciliation engine is written against.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    tuition-reconciler                         │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Engine    │──│ KeyValueStore│  │   PaymentGateway     │  │
//! │  │  (poller,   │  │  (ledger     │  │   (Strategy)         │  │
//! │  │  notifier)  │  │   backing)   │  │                      │  │
//! │  └─────────────┘  └──────────────┘  └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!                                          │            │
//!                                   HttpGateway    MockGateway
//! ```
//!
//! The `PaymentGateway` trait lets the engine run against the real portal
//! backend or a scripted mock without changing reconciliation logic.

pub mod error;
pub mod gateway;
pub mod model;
pub mod store;

pub use error::{PaymentError, Result, ValidationError};
pub use gateway::{CallCounts, MockGateway, PaymentGateway};
pub use model::{
    CancelAck, CreatePaymentRequest, HistoryFilter, IntentId, PaymentIntent, PaymentMethod,
    PaymentReference, PaymentStatus, RemainingBalance, StatusReport, format_rupiah,
};
pub use store::{KeyValueStore, MemoryStore};
