//! Payment Gateway Strategy
//!
//! Defines the interface to the portal backend that fronts the third-party
//! payment gateway. The reconciliation engine works exclusively through this
//! trait.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tuition_core::{PaymentGateway, MockGateway};
//!
//! let gateway: Arc<dyn PaymentGateway> = Arc::new(MockGateway::new(dec!(7_000_000)));
//! let report = gateway.get_payment_status(&uuid).await?;
//! ```

mod mock;

pub use mock::{CallCounts, MockGateway};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    CancelAck, CreatePaymentRequest, HistoryFilter, IntentId, PaymentIntent, RemainingBalance,
    StatusReport,
};

/// Gateway client trait (Strategy pattern)
///
/// Implement this for each backend: the HTTP portal API, a mock, etc.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Submit a new payment; returns the pending intent with reference data
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<PaymentIntent>;

    /// Current status of one intent
    async fn get_payment_status(&self, uuid: &IntentId) -> Result<StatusReport>;

    /// Cancel a pending intent
    async fn cancel_payment(&self, uuid: &IntentId) -> Result<CancelAck>;

    /// Transaction history with current statuses
    async fn get_payment_history(&self, filter: HistoryFilter) -> Result<Vec<PaymentIntent>>;

    /// Remaining payable tuition
    async fn get_remaining_balance(&self) -> Result<RemainingBalance>;

    /// Gateway name
    fn name(&self) -> &str;
}
