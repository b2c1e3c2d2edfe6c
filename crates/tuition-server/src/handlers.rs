//! HTTP/WebSocket Handlers

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use tuition_core::{
    CancelAck, HistoryFilter, IntentId, PaymentError, PaymentIntent, PaymentMethod,
    RemainingBalance, ValidationError,
};
use tuition_reconciler::{HistoryReport, PollHandle, PollState, PortalEvent};

use crate::state::{AppState, Session};

/// Header carrying the browser session id
pub const SESSION_HEADER: &str = "x-session-id";

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub gateway: &'static str,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePaymentBody {
    pub nominal: Decimal,
    pub method: String,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub uuid: IntentId,
    pub state: PollState,
    pub started_at: DateTime<Utc>,
    pub ticks: usize,
}

impl From<PollHandle> for PollResponse {
    fn from(handle: PollHandle) -> Self {
        Self {
            uuid: handle.uuid().clone(),
            state: handle.state(),
            started_at: handle.started_at(),
            ticks: handle.ticks(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProcessedResponse {
    pub uuid: IntentId,
    pub processed: bool,
}

#[derive(Debug, Serialize)]
pub struct DismissResponse {
    pub uuid: IntentId,
    pub dismissed: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.into(),
        }),
    )
}

/// Map engine errors onto HTTP statuses
fn payment_error(e: &PaymentError) -> ApiError {
    let (status, code) = match e {
        PaymentError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        PaymentError::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE"),
        PaymentError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        PaymentError::Gateway { .. } | PaymentError::Transport(_) | PaymentError::Decode(_) => {
            (StatusCode::BAD_GATEWAY, "GATEWAY_ERROR")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };

    if status.is_server_error() {
        tracing::error!(error = %e, "Request failed");
    } else {
        tracing::debug!(error = %e, "Request rejected");
    }

    error(status, code, e.user_message())
}

fn session_from(state: &AppState, id: Option<&str>) -> Result<Arc<Session>, ApiError> {
    let id = id.ok_or_else(|| {
        error(
            StatusCode::BAD_REQUEST,
            "MISSING_SESSION",
            format!("Missing {SESSION_HEADER} header"),
        )
    })?;

    state
        .session(id)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "UNKNOWN_SESSION", "Session not found or expired"))
}

fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok())
}

fn session(state: &AppState, headers: &HeaderMap) -> Result<Arc<Session>, ApiError> {
    session_from(state, session_id(headers))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        gateway: state.mode.name(),
        sessions: state.session_count(),
    })
}

/// Open a session for the bearer of the token
pub async fn open_session(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<SessionResponse> {
    let token = bearer_token(&headers);
    if token.is_none() && state.mode.requires_token() {
        return Err(error(
            StatusCode::UNAUTHORIZED,
            "MISSING_TOKEN",
            "A bearer token is required",
        ));
    }

    let session_id = state.open_session(token).map_err(|e| payment_error(&e))?;
    Ok(Json(SessionResponse { session_id }))
}

/// End the session; its polling and ledger go with it
pub async fn close_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let id = session_id(&headers)
        .ok_or_else(|| error(StatusCode::BAD_REQUEST, "MISSING_SESSION", "Missing session id"))?;

    if state.close_session(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error(StatusCode::NOT_FOUND, "UNKNOWN_SESSION", "Session not found or expired"))
    }
}

pub async fn create_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePaymentBody>,
) -> ApiResult<PaymentIntent> {
    let session = session(&state, &headers)?;
    let method: PaymentMethod = body
        .method
        .parse()
        .map_err(|e: ValidationError| payment_error(&PaymentError::from(e)))?;

    let intent = session
        .engine
        .create_payment(body.nominal, method)
        .await
        .map_err(|e| payment_error(&e))?;

    Ok(Json(intent))
}

pub async fn get_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<PaymentIntent> {
    let session = session(&state, &headers)?;
    let uuid = IntentId::from(uuid);

    session
        .engine
        .intent(&uuid)
        .map(Json)
        .ok_or_else(|| payment_error(&PaymentError::NotFound(uuid.to_string())))
}

/// Close the payment detail view
pub async fn close_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<PaymentIntent> {
    let session = session(&state, &headers)?;
    let uuid = IntentId::from(uuid);

    session
        .engine
        .close_intent(&uuid)
        .map(Json)
        .ok_or_else(|| payment_error(&PaymentError::NotFound(uuid.to_string())))
}

pub async fn start_polling(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<PollResponse> {
    let session = session(&state, &headers)?;
    let handle = session
        .engine
        .start_polling(IntentId::from(uuid))
        .map_err(|e| payment_error(&e))?;
    Ok(Json(handle.into()))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<CancelAck> {
    let session = session(&state, &headers)?;
    let ack = session
        .engine
        .cancel_payment(&IntentId::from(uuid))
        .await
        .map_err(|e| payment_error(&e))?;
    Ok(Json(ack))
}

pub async fn is_processed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<ProcessedResponse> {
    let session = session(&state, &headers)?;
    let uuid = IntentId::from(uuid);
    let processed = session.engine.is_processed(&uuid);
    Ok(Json(ProcessedResponse { uuid, processed }))
}

pub async fn mark_processed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<ProcessedResponse> {
    let session = session(&state, &headers)?;
    let uuid = IntentId::from(uuid);
    session.engine.mark_processed(&uuid);
    Ok(Json(ProcessedResponse {
        uuid,
        processed: true,
    }))
}

pub async fn dismiss_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<DismissResponse> {
    let session = session(&state, &headers)?;
    let uuid = IntentId::from(uuid);
    let dismissed = session.engine.dismiss(&uuid);
    Ok(Json(DismissResponse { uuid, dismissed }))
}

/// Transaction history, reconciled against the ledger on the way out
pub async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<HistoryReport> {
    let session = session(&state, &headers)?;
    let filter: HistoryFilter = query
        .status
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| error(StatusCode::BAD_REQUEST, "INVALID_FILTER", "Unknown status filter"))?;

    let report = session
        .engine
        .reconcile_history(filter)
        .await
        .map_err(|e| payment_error(&e))?;
    Ok(Json(report))
}

pub async fn remaining_balance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<RemainingBalance> {
    let session = session(&state, &headers)?;
    let balance = session
        .engine
        .remaining_balance()
        .await
        .map_err(|e| payment_error(&e))?;
    Ok(Json(balance))
}

/// WebSocket stream of engine events.
///
/// Browsers cannot set headers on a WebSocket handshake, so the session id
/// may also come as `?session_id=`.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let id = session_id(&headers).or(query.session_id.as_deref());
    let session = session_from(&state, id)?;
    let events = session.engine.subscribe();

    Ok(ws.on_upgrade(move |socket| stream_events(socket, events)))
}

async fn stream_events(socket: WebSocket, events: broadcast::Receiver<PortalEvent>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(events);

    loop {
        tokio::select! {
            event = events.next() => {
                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        tracing::warn!(missed, "Event subscriber lagged");
                        continue;
                    }
                    // Session closed
                    None => break,
                };

                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(error = %e, "Event serialization failed");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket receive failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.close().await;
}
