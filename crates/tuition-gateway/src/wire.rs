//! Backend wire formats
//!
//! The portal backend wraps every response in `{success, data, message}` and
//! uses its own field names; this module maps them onto domain types.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use tuition_core::{
    CancelAck, IntentId, PaymentError, PaymentIntent, PaymentMethod, PaymentReference,
    PaymentStatus, RemainingBalance, Result, StatusReport,
};

/// Response envelope shared by every endpoint
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Envelope {
    /// Best human-readable explanation the backend offered
    pub fn reason(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateBody {
    pub nominal: Decimal,
    pub metode: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreatedPayment {
    pub uuid: String,
    #[serde(default)]
    pub metode: String,
    pub nominal: Decimal,
    #[serde(default)]
    pub biaya_admin: Decimal,
    #[serde(default)]
    pub total_dibayar: Decimal,
    #[serde(default)]
    pub qrcode: Option<String>,
    #[serde(default)]
    pub payment_number: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub payment_url: Option<String>,
    #[serde(default)]
    pub expired_time: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl CreatedPayment {
    pub fn into_intent(self) -> Result<PaymentIntent> {
        let method = resolve_method(self.payment_method.as_deref(), &self.metode)?;
        let status = match self.status.as_deref() {
            Some(s) if !s.is_empty() => s.parse()?,
            _ => PaymentStatus::Pending,
        };

        let payment_reference = match (&method, self.qrcode, self.payment_number) {
            (PaymentMethod::Qris, Some(payload), _) if !payload.is_empty() => {
                Some(PaymentReference::QrCode { payload })
            }
            (PaymentMethod::VirtualAccount(_), _, Some(number)) if !number.is_empty() => {
                Some(PaymentReference::VirtualAccount { number })
            }
            _ => None,
        };

        let total_amount = if self.total_dibayar.is_zero() {
            self.nominal + self.biaya_admin
        } else {
            self.total_dibayar
        };

        Ok(PaymentIntent {
            uuid: IntentId::new(self.uuid),
            nominal: self.nominal,
            admin_fee: self.biaya_admin,
            total_amount,
            method,
            status,
            created_at: Utc::now(),
            expires_at: self.expired_time.as_deref().and_then(parse_timestamp),
            payment_reference,
            payment_url: non_empty(self.payment_url),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusData {
    pub status: String,
    #[serde(default)]
    pub nominal: Decimal,
    #[serde(default)]
    pub metode: String,
    #[serde(default)]
    pub total_dibayar: Decimal,
    #[serde(default)]
    pub invoice_url: Option<String>,
    #[serde(default)]
    pub expired_at: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
}

impl StatusData {
    pub fn into_report(self, uuid: &IntentId) -> Result<StatusReport> {
        Ok(StatusReport {
            uuid: uuid.clone(),
            status: self.status.parse()?,
            nominal: self.nominal,
            total_amount: self.total_dibayar,
            method: resolve_method(self.payment_method.as_deref(), &self.metode).ok(),
            expires_at: self.expired_at.as_deref().and_then(parse_timestamp),
            payment_url: non_empty(self.invoice_url),
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryRow {
    pub invoice_uuid: String,
    #[serde(default)]
    pub metode: String,
    pub nominal: Decimal,
    #[serde(default)]
    pub biaya_admin: Decimal,
    #[serde(default)]
    pub total_dibayar: Decimal,
    pub status: String,
    #[serde(default)]
    pub tanggal: Option<String>,
    #[serde(default)]
    pub invoice_url: Option<String>,
    #[serde(default)]
    pub expired_at: Option<String>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub payment_number: Option<String>,
}

impl HistoryRow {
    pub fn into_intent(self) -> Result<PaymentIntent> {
        let method = resolve_method(self.payment_method.as_deref(), &self.metode)?;
        let payment_reference = non_empty(self.payment_number).map(|value| {
            if method.is_qris() {
                PaymentReference::QrCode { payload: value }
            } else {
                PaymentReference::VirtualAccount { number: value }
            }
        });

        Ok(PaymentIntent {
            uuid: IntentId::new(self.invoice_uuid),
            nominal: self.nominal,
            admin_fee: self.biaya_admin,
            total_amount: self.total_dibayar,
            method,
            status: self.status.parse()?,
            created_at: self
                .tanggal
                .as_deref()
                .and_then(parse_timestamp)
                .unwrap_or_else(Utc::now),
            expires_at: self.expired_at.as_deref().and_then(parse_timestamp),
            payment_reference,
            payment_url: non_empty(self.invoice_url),
        })
    }
}

/// Decode history rows one at a time.
///
/// Rows the backend stored with a status or method we do not know are
/// logged and skipped; the rest of the list is kept.
pub(crate) fn decode_history(rows: Vec<serde_json::Value>) -> Vec<PaymentIntent> {
    rows.into_iter()
        .filter_map(|row| {
            let decoded = serde_json::from_value::<HistoryRow>(row)
                .map_err(|e| PaymentError::Decode(e.to_string()))
                .and_then(HistoryRow::into_intent);
            match decoded {
                Ok(intent) => Some(intent),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable history row");
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub(crate) struct CancelData {
    pub invoice_uuid: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl CancelData {
    pub fn into_ack(self) -> Result<CancelAck> {
        Ok(CancelAck {
            uuid: IntentId::new(self.invoice_uuid),
            status: self.status.parse()?,
            message: self.message,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct BalanceData {
    pub sisa_ukt: Decimal,
}

impl From<BalanceData> for RemainingBalance {
    fn from(data: BalanceData) -> Self {
        Self {
            remaining: data.sisa_ukt,
        }
    }
}

/// Prefer the precise method code; fall back to the coarse category.
///
/// Rows that only say `transfer` map to the generic `bank_va`.
fn resolve_method(code: Option<&str>, category: &str) -> Result<PaymentMethod> {
    if let Some(code) = code.filter(|c| !c.trim().is_empty()) {
        return Ok(code.parse()?);
    }

    match category.trim().to_lowercase().as_str() {
        "transfer" => Ok(PaymentMethod::virtual_account("bank")),
        other => other
            .parse()
            .map_err(|_| PaymentError::Decode(format!("unrecognised payment method '{category}'"))),
    }
}

/// Accepts RFC 3339 and the plain `YYYY-MM-DD HH:MM:SS` the database returns
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_created_qris_payment() {
        let json = r#"{
            "uuid": "a1b2",
            "metode": "qris",
            "nominal": 100000,
            "biaya_admin": 710.0,
            "total_dibayar": 100710.0,
            "qrcode": "000201010212",
            "payment_method": "qris",
            "payment_url": "https://app.pakasir.com/pay/ukt/100710?order_id=a1b2&qris_only=1",
            "expired_time": "2026-10-17T10:00:00+07:00",
            "message": "Silakan selesaikan pembayaran",
            "status": "pending"
        }"#;

        let created: CreatedPayment = serde_json::from_str(json).unwrap();
        let intent = created.into_intent().unwrap();

        assert_eq!(intent.uuid.as_str(), "a1b2");
        assert_eq!(intent.admin_fee, dec!(710));
        assert_eq!(intent.total_amount, dec!(100710));
        assert_eq!(intent.status, PaymentStatus::Pending);
        assert_eq!(
            intent.payment_reference,
            Some(PaymentReference::QrCode { payload: "000201010212".into() })
        );
        assert!(intent.expires_at.is_some());
    }

    #[test]
    fn test_created_va_payment_without_totals() {
        let json = r#"{
            "uuid": "c3d4",
            "metode": "transfer",
            "nominal": 100000,
            "payment_number": "8808123456789012",
            "payment_method": "bni_va",
            "expired_time": ""
        }"#;

        let intent = serde_json::from_str::<CreatedPayment>(json)
            .unwrap()
            .into_intent()
            .unwrap();

        assert_eq!(intent.method, PaymentMethod::virtual_account("bni"));
        assert_eq!(intent.total_amount, dec!(100000));
        assert_eq!(intent.expires_at, None);
        assert_eq!(intent.payment_reference.unwrap().value(), "8808123456789012");
    }

    #[test]
    fn test_status_report() {
        let json = r#"{
            "status": "success",
            "nominal": 50000,
            "metode": "transfer",
            "total_dibayar": 54000,
            "tanggal": "2026-10-16 09:00:00",
            "invoice_url": "",
            "expired_at": null,
            "payment_method": "bri_va"
        }"#;

        let report = serde_json::from_str::<StatusData>(json)
            .unwrap()
            .into_report(&IntentId::from("e5f6"))
            .unwrap();

        assert_eq!(report.status, PaymentStatus::Success);
        assert_eq!(report.total_amount, dec!(54000));
        assert_eq!(report.method, Some(PaymentMethod::virtual_account("bri")));
        assert_eq!(report.payment_url, None);
    }

    #[test]
    fn test_history_row_falls_back_to_category() {
        let json = r#"{
            "id": 7,
            "invoice_uuid": "g7h8",
            "metode": "transfer",
            "nominal": 75000,
            "biaya_admin": 4000,
            "total_dibayar": 79000,
            "status": "failed",
            "tanggal": "2026-10-15T08:30:00Z",
            "expired_at": ""
        }"#;

        let intent = serde_json::from_str::<HistoryRow>(json)
            .unwrap()
            .into_intent()
            .unwrap();

        assert_eq!(intent.method.code(), "bank_va");
        assert_eq!(intent.status, PaymentStatus::Failed);
        assert_eq!(intent.created_at.to_rfc3339(), "2026-10-15T08:30:00+00:00");
    }

    #[test]
    fn test_history_keeps_rows_around_unreadable_ones() {
        let rows: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {
                    "invoice_uuid": "paid-1",
                    "metode": "qris",
                    "nominal": 100000,
                    "total_dibayar": 100700,
                    "status": "success",
                    "payment_method": "qris"
                },
                {
                    "invoice_uuid": "odd-2",
                    "metode": "qris",
                    "nominal": 20000,
                    "status": "canceled"
                },
                {
                    "invoice_uuid": "broken-3",
                    "status": "success"
                },
                {
                    "invoice_uuid": "open-4",
                    "metode": "transfer",
                    "nominal": 60000,
                    "status": "pending"
                }
            ]"#,
        )
        .unwrap();

        let intents = decode_history(rows);

        let ids: Vec<&str> = intents.iter().map(|i| i.uuid.as_str()).collect();
        assert_eq!(ids, ["paid-1", "open-4"]);
        assert_eq!(intents[0].status, PaymentStatus::Success);
        assert_eq!(intents[0].nominal, dec!(100000));
    }

    #[test]
    fn test_unknown_status_is_decode_error() {
        let data = StatusData {
            status: "settling".into(),
            nominal: Decimal::ZERO,
            metode: String::new(),
            total_dibayar: Decimal::ZERO,
            invoice_url: None,
            expired_at: None,
            payment_method: None,
        };
        assert!(matches!(
            data.into_report(&IntentId::from("x")),
            Err(PaymentError::Decode(_))
        ));
    }

    #[test]
    fn test_envelope_reason() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"success": false, "message": "untuk QRIS maksimal Rp 250.000"}"#)
                .unwrap();
        assert_eq!(envelope.reason(), Some("untuk QRIS maksimal Rp 250.000"));
    }
}
