//! # tuition-gateway
//!
//! HTTP implementation of [`tuition_core::PaymentGateway`] against the
//! portal backend's `/api/ukt` endpoints.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tuition_gateway::HttpGateway;
//!
//! let gateway = HttpGateway::from_env()?.with_token(bearer);
//! let balance = gateway.get_remaining_balance().await?;
//! ```

pub mod http;
mod wire;

pub use http::{GatewayConfig, HttpGateway};

// Re-export core types for convenience
pub use tuition_core::{PaymentError, PaymentGateway, Result};
