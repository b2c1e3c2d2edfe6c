//! Portal HTTP Gateway
//!
//! Implementation of `PaymentGateway` over the portal backend's REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;

use tuition_core::{
    CancelAck, CreatePaymentRequest, HistoryFilter, IntentId, PaymentError, PaymentGateway,
    PaymentIntent, RemainingBalance, Result, StatusReport,
};

use crate::wire::{
    BalanceData, CancelData, CreateBody, CreatedPayment, Envelope, StatusData, decode_history,
};

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Portal backend base URL
    pub base_url: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            timeout_secs: 15,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url = std::env::var("PORTAL_API_URL").unwrap_or(defaults.base_url);
        let timeout_secs = std::env::var("PORTAL_API_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        Self {
            base_url,
            timeout_secs,
        }
    }
}

/// Portal backend client
#[derive(Clone, Debug)]
pub struct HttpGateway {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpGateway {
    /// Create from configuration
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| PaymentError::Config(format!("invalid PORTAL_API_URL '{}': {e}", config.base_url)))?;

        if base_url.cannot_be_a_base() {
            return Err(PaymentError::Config(format!(
                "PORTAL_API_URL '{}' cannot be used as a base URL",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PaymentError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(&GatewayConfig::from_env())
    }

    /// Attach the user's bearer token to every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Build `<base>/<segments...>`, percent-encoding each segment
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| PaymentError::Config("base URL cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send and unwrap the `{success, data, message}` envelope
    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder
            .send()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::Transport(e.to_string()))?;

        let envelope: Option<Envelope> = serde_json::from_str(&body).ok();
        let reason = envelope
            .as_ref()
            .and_then(Envelope::reason)
            .map_or_else(|| status.to_string(), str::to_string);

        if status.is_server_error() {
            return Err(PaymentError::Transport(format!("{status}: {reason}")));
        }

        let envelope = match envelope {
            Some(envelope) if status.is_success() && envelope.success => envelope,
            _ if status.is_success() => {
                return Err(PaymentError::Gateway {
                    status: status.as_u16(),
                    message: reason,
                });
            }
            _ => {
                tracing::debug!(status = %status, reason = %reason, "Portal rejected request");
                return Err(PaymentError::Gateway {
                    status: status.as_u16(),
                    message: reason,
                });
            }
        };

        let data = envelope.data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(|e| PaymentError::Decode(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<PaymentIntent> {
        let url = self.endpoint(&["api", "ukt", "bayar"])?;
        let body = CreateBody {
            nominal: request.nominal,
            metode: request.method.code(),
        };

        let created: CreatedPayment = self.send(self.request(Method::POST, url).json(&body)).await?;
        created.into_intent()
    }

    async fn get_payment_status(&self, uuid: &IntentId) -> Result<StatusReport> {
        let url = self.endpoint(&["api", "ukt", "status", uuid.as_str()])?;
        let data: StatusData = self.send(self.request(Method::GET, url)).await?;
        data.into_report(uuid)
    }

    async fn cancel_payment(&self, uuid: &IntentId) -> Result<CancelAck> {
        let url = self.endpoint(&["api", "ukt", "cancel", uuid.as_str()])?;
        let data: CancelData = self.send(self.request(Method::POST, url)).await?;
        data.into_ack()
    }

    async fn get_payment_history(&self, filter: HistoryFilter) -> Result<Vec<PaymentIntent>> {
        let mut url = self.endpoint(&["api", "ukt", "riwayat"])?;
        url.query_pairs_mut().append_pair("status", filter.as_query());

        // The backend sends `null` rather than `[]` when there is no history
        let rows: Option<Vec<serde_json::Value>> = self.send(self.request(Method::GET, url)).await?;
        let rows = rows.unwrap_or_default();
        let fetched = rows.len();

        let intents = decode_history(rows);
        tracing::debug!(filter = filter.as_query(), rows = fetched, kept = intents.len(), "Fetched history");

        Ok(intents)
    }

    async fn get_remaining_balance(&self) -> Result<RemainingBalance> {
        let url = self.endpoint(&["api", "ukt", "sisa"])?;
        let data: BalanceData = self.send(self.request(Method::GET, url)).await?;
        Ok(data.into())
    }

    fn name(&self) -> &str {
        "PortalHttp"
    }
}
