//! Domain Models
//!
//! Core data types for tuition payments. Uses `rust_decimal` for all
//! monetary values - never use f64 for money!

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, Result, ValidationError};

/// Gateway-issued payment intent identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(String);

impl IntentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IntentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for IntentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Payment lifecycle status.
///
/// Transitions are monotonic: `Pending` may move to any terminal status,
/// terminal statuses never move again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    #[serde(alias = "cancelled")]
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether `next` is a legal forward move from this status
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(self, Self::Pending) && next.is_terminal()
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" | "cancelled" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(PaymentError::Decode(format!("unknown payment status '{other}'"))),
        }
    }
}

/// How the student pays.
///
/// Virtual-account methods are encoded as `<bank>_va` (e.g. `bri_va`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PaymentMethod {
    Qris,
    VirtualAccount(String),
}

impl PaymentMethod {
    /// Banks the portal backend currently issues virtual accounts for
    pub const KNOWN_BANKS: &'static [&'static str] = &[
        "bri",
        "bni",
        "mandiri",
        "bca",
        "cimb_niaga",
        "sampoerna",
        "bnc",
        "maybank",
        "permata",
        "atm_bersama",
        "artha_graha",
    ];

    pub fn virtual_account(bank: impl Into<String>) -> Self {
        Self::VirtualAccount(bank.into())
    }

    /// Wire code (`qris`, `bca_va`, ...)
    pub fn code(&self) -> String {
        match self {
            Self::Qris => "qris".into(),
            Self::VirtualAccount(bank) => format!("{bank}_va"),
        }
    }

    /// Coarse category the backend stores alongside the code
    pub fn category(&self) -> &'static str {
        match self {
            Self::Qris => "qris",
            Self::VirtualAccount(_) => "transfer",
        }
    }

    pub fn is_qris(&self) -> bool {
        matches!(self, Self::Qris)
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

impl FromStr for PaymentMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let code = s.trim().to_lowercase();
        if code == "qris" {
            return Ok(Self::Qris);
        }

        match code.strip_suffix("_va") {
            Some(bank)
                if !bank.is_empty()
                    && bank.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                Ok(Self::VirtualAccount(bank.to_string()))
            }
            _ => Err(ValidationError::UnsupportedMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for PaymentMethod {
    type Error = ValidationError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PaymentMethod> for String {
    fn from(method: PaymentMethod) -> Self {
        method.code()
    }
}

/// Gateway-issued instructions for completing the payment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentReference {
    VirtualAccount { number: String },
    QrCode { payload: String },
}

impl PaymentReference {
    pub fn value(&self) -> &str {
        match self {
            Self::VirtualAccount { number } => number,
            Self::QrCode { payload } => payload,
        }
    }
}

/// A single attempt to pay a given amount
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Gateway-issued identifier
    pub uuid: IntentId,

    /// Amount credited against the tuition balance
    pub nominal: Decimal,

    /// Gateway fee on top of the nominal
    pub admin_fee: Decimal,

    /// What the payer actually transfers
    pub total_amount: Decimal,

    pub method: PaymentMethod,

    pub status: PaymentStatus,

    pub created_at: DateTime<Utc>,

    /// None when the backend did not report an expiry
    pub expires_at: Option<DateTime<Utc>>,

    pub payment_reference: Option<PaymentReference>,

    pub payment_url: Option<String>,
}

impl PaymentIntent {
    /// Create a fresh pending intent with no fee or reference data
    pub fn pending(uuid: impl Into<IntentId>, nominal: Decimal, method: PaymentMethod) -> Self {
        Self {
            uuid: uuid.into(),
            nominal,
            admin_fee: Decimal::ZERO,
            total_amount: nominal,
            method,
            status: PaymentStatus::Pending,
            created_at: Utc::now(),
            expires_at: None,
            payment_reference: None,
            payment_url: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Status as the user should see it: a pending intent past its expiry
    /// is shown as expired even before the backend flips it.
    pub fn effective_status_at(&self, now: DateTime<Utc>) -> PaymentStatus {
        if self.status == PaymentStatus::Pending && self.is_expired_at(now) {
            PaymentStatus::Expired
        } else {
            self.status
        }
    }

    pub fn can_cancel_at(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && !self.is_expired_at(now)
    }

    /// Move to `next`, enforcing monotonicity.
    ///
    /// Returns `Ok(false)` when already in `next`.
    pub fn transition(&mut self, next: PaymentStatus) -> Result<bool> {
        if self.status == next {
            return Ok(false);
        }

        if !self.status.can_transition_to(next) {
            return Err(PaymentError::InvalidState(format!(
                "payment {} cannot move from {} to {}",
                self.uuid, self.status, next
            )));
        }

        self.status = next;
        Ok(true)
    }
}

/// Result of a status check for one intent
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub uuid: IntentId,
    pub status: PaymentStatus,
    pub nominal: Decimal,
    pub total_amount: Decimal,
    pub method: Option<PaymentMethod>,
    pub expires_at: Option<DateTime<Utc>>,
    pub payment_url: Option<String>,
}

/// Backend acknowledgement of a cancellation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelAck {
    pub uuid: IntentId,
    pub status: PaymentStatus,
    pub message: String,
}

/// Remaining payable tuition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingBalance {
    pub remaining: Decimal,
}

/// Input to `createPayment`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreatePaymentRequest {
    pub nominal: Decimal,
    pub method: PaymentMethod,
}

impl CreatePaymentRequest {
    pub fn new(nominal: Decimal, method: PaymentMethod) -> Self {
        Self { nominal, method }
    }
}

/// Status filter for the transaction history
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryFilter {
    #[default]
    All,
    Pending,
    Success,
    Failed,
    Expired,
}

impl HistoryFilter {
    pub fn as_query(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn matches(&self, status: PaymentStatus) -> bool {
        match self {
            Self::All => true,
            Self::Pending => status == PaymentStatus::Pending,
            Self::Success => status == PaymentStatus::Success,
            Self::Failed => status == PaymentStatus::Failed,
            Self::Expired => status == PaymentStatus::Expired,
        }
    }
}

impl FromStr for HistoryFilter {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" | "cancelled" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(PaymentError::InvalidState(format!("unknown history filter '{other}'"))),
        }
    }
}

/// Format an amount the way the portal displays it: `Rp 1.250.000`
pub fn format_rupiah(amount: Decimal) -> String {
    let rounded = amount.round();
    let digits = rounded.abs().trunc().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{sign}Rp {grouped}")
}
