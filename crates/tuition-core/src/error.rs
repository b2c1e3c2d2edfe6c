//! Error Types

use rust_decimal::Decimal;
use thiserror::Error;

use crate::model::format_rupiah;

/// Result type alias for payment operations
pub type Result<T> = std::result::Result<T, PaymentError>;

/// Local input validation failures.
///
/// Always raised before any create request leaves the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("nominal must be a positive whole amount, got {0}")]
    NotWholeAmount(Decimal),

    #[error("nominal {nominal} is below the minimum of {min}")]
    BelowMinimum { nominal: Decimal, min: Decimal },

    #[error("nominal {nominal} exceeds the maximum of {max}")]
    AboveMaximum { nominal: Decimal, max: Decimal },

    #[error("nominal {nominal} is below the {method} minimum of {min}")]
    BelowMethodMinimum {
        method: String,
        nominal: Decimal,
        min: Decimal,
    },

    #[error("nominal {nominal} exceeds the {method} maximum of {max}")]
    AboveMethodMaximum {
        method: String,
        nominal: Decimal,
        max: Decimal,
    },

    #[error("nominal {nominal} exceeds the remaining balance of {remaining}")]
    ExceedsRemaining { nominal: Decimal, remaining: Decimal },

    #[error("unsupported payment method: {0}")]
    UnsupportedMethod(String),
}

impl ValidationError {
    /// Message suitable for showing next to the payment form
    pub fn user_message(&self) -> String {
        match self {
            Self::NotWholeAmount(_) => "Please enter a whole rupiah amount.".into(),
            Self::BelowMinimum { min, .. } => format!("Minimum payment is {}.", format_rupiah(*min)),
            Self::AboveMaximum { max, .. } => format!("Maximum payment is {}.", format_rupiah(*max)),
            Self::BelowMethodMinimum { method, min, .. } => {
                format!("Minimum for {method} is {}.", format_rupiah(*min))
            }
            Self::AboveMethodMaximum { method, max, .. } => {
                format!("Maximum for {method} is {}.", format_rupiah(*max))
            }
            Self::ExceedsRemaining { remaining, .. } => format!(
                "Amount exceeds your remaining tuition. Remaining: {}.",
                format_rupiah(*remaining)
            ),
            Self::UnsupportedMethod(method) => format!("Payment method '{method}' is not supported."),
        }
    }
}

/// Payment reconciliation errors
#[derive(Error, Debug)]
pub enum PaymentError {
    /// Input rejected locally, nothing was sent
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Backend answered with a rejection
    #[error("Gateway rejected request ({status}): {message}")]
    Gateway { status: u16, message: String },

    /// Backend unreachable, timed out or failed with a 5xx
    #[error("Gateway unavailable: {0}")]
    Transport(String),

    /// Backend answered with a body we could not understand
    #[error("Unexpected gateway response: {0}")]
    Decode(String),

    /// A status check failed; swallowed by the poller
    #[error("Transient poll error for {uuid}: {reason}")]
    TransientPoll { uuid: String, reason: String },

    /// Response for a session that is no longer the active one
    #[error("Stale response for {0} discarded")]
    StaleResponse(String),

    /// Operation not allowed in the current payment state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown intent
    #[error("Payment not found: {0}")]
    NotFound(String),

    /// Ledger persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PaymentError {
    /// Whether this is a create/cancel/fetch failure attributable to the gateway
    pub fn is_gateway_error(&self) -> bool {
        matches!(
            self,
            Self::Gateway { .. } | Self::Transport(_) | Self::Decode(_)
        )
    }

    /// Check if retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::TransientPoll { .. } | Self::Storage(_) => true,
            Self::Gateway { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(e) => e.user_message(),
            Self::Gateway { message, .. } => message.clone(),
            Self::Transport(_) | Self::Decode(_) => {
                "The payment service is currently unavailable. Please try again.".into()
            }
            Self::InvalidState(msg) => msg.clone(),
            Self::NotFound(_) => "Payment not found.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}
