//! Engine Configuration
//!
//! Timings and validation bounds. Everything has a default matching the
//! portal's production behaviour and can be overridden from the environment.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use tuition_core::{PaymentMethod, ValidationError};

/// Reconciliation engine configuration
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Fixed interval between status checks
    pub poll_interval: Duration,

    /// Wait after creation before the first status check
    pub grace_delay: Duration,

    /// How long a success notification stays up
    pub dismiss_after: Duration,

    /// How long a fetched remaining balance is trusted
    pub balance_ttl: Duration,

    /// Event bus buffer per subscriber
    pub event_capacity: usize,

    /// Amount bounds enforced before any create request
    pub rules: MethodRules,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(800),
            grace_delay: Duration::from_secs(1),
            dismiss_after: Duration::from_secs(8),
            balance_ttl: Duration::from_secs(5),
            event_capacity: 64,
            rules: MethodRules::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Create from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            // A zero interval would spin
            poll_interval: env_millis("RECONCILER_POLL_INTERVAL_MS")
                .filter(|interval| !interval.is_zero())
                .unwrap_or(defaults.poll_interval),
            grace_delay: env_millis("RECONCILER_GRACE_DELAY_MS").unwrap_or(defaults.grace_delay),
            dismiss_after: env_millis("RECONCILER_DISMISS_AFTER_MS").unwrap_or(defaults.dismiss_after),
            balance_ttl: env_millis("RECONCILER_BALANCE_TTL_MS").unwrap_or(defaults.balance_ttl),
            ..defaults
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grace_delay(mut self, delay: Duration) -> Self {
        self.grace_delay = delay;
        self
    }

    pub fn with_dismiss_after(mut self, after: Duration) -> Self {
        self.dismiss_after = after;
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid duration, using default");
            None
        }
    }
}

/// Amount bounds for payment creation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRules {
    pub min_nominal: Decimal,
    pub max_nominal: Decimal,
    pub qris_min: Decimal,
    pub qris_max: Decimal,
    pub transfer_min: Decimal,
}

impl Default for MethodRules {
    fn default() -> Self {
        Self {
            min_nominal: dec!(100),
            max_nominal: dec!(10_000_000),
            qris_min: dec!(500),
            qris_max: dec!(250_000),
            transfer_min: dec!(50_000),
        }
    }
}

impl MethodRules {
    /// Checks that need no network call, in the order the form reports them
    pub fn check(&self, nominal: Decimal, method: &PaymentMethod) -> Result<(), ValidationError> {
        if nominal <= Decimal::ZERO || !nominal.fract().is_zero() {
            return Err(ValidationError::NotWholeAmount(nominal));
        }

        if nominal < self.min_nominal {
            return Err(ValidationError::BelowMinimum {
                nominal,
                min: self.min_nominal,
            });
        }

        if nominal > self.max_nominal {
            return Err(ValidationError::AboveMaximum {
                nominal,
                max: self.max_nominal,
            });
        }

        match method {
            PaymentMethod::Qris if nominal < self.qris_min => Err(ValidationError::BelowMethodMinimum {
                method: method.code(),
                nominal,
                min: self.qris_min,
            }),
            PaymentMethod::Qris if nominal > self.qris_max => Err(ValidationError::AboveMethodMaximum {
                method: method.code(),
                nominal,
                max: self.qris_max,
            }),
            PaymentMethod::VirtualAccount(_) if nominal < self.transfer_min => {
                Err(ValidationError::BelowMethodMinimum {
                    method: method.code(),
                    nominal,
                    min: self.transfer_min,
                })
            }
            _ => Ok(()),
        }
    }

    /// Remaining-balance check, run once the balance is known
    pub fn check_remaining(&self, nominal: Decimal, remaining: Decimal) -> Result<(), ValidationError> {
        if nominal > remaining {
            return Err(ValidationError::ExceedsRemaining { nominal, remaining });
        }
        Ok(())
    }
}
