//! tuition-server
//!
//! Axum host for the payment reconciliation engine. Each browser session
//! gets its own engine and session-scoped ledger; the page drives it over
//! REST and listens on a WebSocket for notifications.

mod handlers;
mod state;

use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tuition_reconciler::ReconcilerConfig;

use crate::handlers::{
    cancel_payment, close_payment, close_session, create_payment, dismiss_notification,
    events_handler, get_payment, health_check, history, is_processed, mark_processed,
    open_session, remaining_balance, start_polling,
};
use crate::state::{AppState, DEFAULT_IDLE_TTL, GatewayMode};

const SWEEP_EVERY: Duration = Duration::from_secs(60);

fn build_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health_check))
        // Sessions
        .route("/api/session", post(open_session).delete(close_session))
        // Payments
        .route("/api/payments", post(create_payment))
        .route("/api/payments/{uuid}", get(get_payment).delete(close_payment))
        .route("/api/payments/{uuid}/poll", post(start_polling))
        .route("/api/payments/{uuid}/cancel", post(cancel_payment))
        .route(
            "/api/payments/{uuid}/processed",
            get(is_processed).post(mark_processed),
        )
        .route("/api/notifications/{uuid}/dismiss", post(dismiss_notification))
        .route("/api/balance", get(remaining_balance))
        .route("/api/history", get(history))
        // Event stream
        .route("/api/events", get(events_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let mode = GatewayMode::from_env();
    match &mode {
        GatewayMode::Portal(config) => {
            tracing::info!(base_url = %config.base_url, timeout_secs = config.timeout_secs, "Using portal backend");
        }
        GatewayMode::Mock => {
            tracing::warn!("Using in-memory mock gateway - no real payments");
        }
    }

    let config = ReconcilerConfig::from_env();
    tracing::info!(
        poll_interval = ?config.poll_interval,
        grace_delay = ?config.grace_delay,
        dismiss_after = ?config.dismiss_after,
        "Reconciler configured"
    );

    let idle_ttl = std::env::var("SESSION_IDLE_TTL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|secs| *secs > 0)
        .map_or(DEFAULT_IDLE_TTL, Duration::from_secs);

    let state = AppState::new(mode, config).with_idle_ttl(idle_ttl);
    state.spawn_sweeper(SWEEP_EVERY);
    tracing::info!(idle_ttl_secs = idle_ttl.as_secs(), "Idle session eviction enabled");

    let app = build_router(state);

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("tuition-server running on http://{}", addr);
    tracing::info!("  POST /api/session              - Open session (Bearer token)");
    tracing::info!("  POST /api/payments             - Create payment");
    tracing::info!("  POST /api/payments/{{uuid}}/poll - Start status polling");
    tracing::info!("  GET  /api/history              - History + reconciliation");
    tracing::info!("  GET  /api/events               - WebSocket event stream");

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app() -> Router {
        build_router(AppState::new(GatewayMode::Mock, ReconcilerConfig::default()))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn request(method: &str, uri: &str, session: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(session) = session {
            builder = builder.header(handlers::SESSION_HEADER, session);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn open(app: &Router) -> String {
        let (status, body) = send(app, request("POST", "/api/session", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        body["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_payment_lifecycle() {
        let app = app();
        let session = open(&app).await;

        let (status, body) = send(
            &app,
            request(
                "POST",
                "/api/payments",
                Some(&session),
                Some(json!({"nominal": 300_000, "method": "qris"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");

        let (status, intent) = send(
            &app,
            request(
                "POST",
                "/api/payments",
                Some(&session),
                Some(json!({"nominal": 100_000, "method": "bank_va"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(intent["status"], "pending");
        let uuid = intent["uuid"].as_str().unwrap().to_string();

        let (status, _) = send(&app, request("GET", &format!("/api/payments/{uuid}"), Some(&session), None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, ack) = send(
            &app,
            request("POST", &format!("/api/payments/{uuid}/cancel"), Some(&session), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["status"], "failed");

        let (_, processed) = send(
            &app,
            request("GET", &format!("/api/payments/{uuid}/processed"), Some(&session), None),
        )
        .await;
        assert_eq!(processed["processed"], false);

        let (status, _) = send(&app, request("DELETE", "/api/session", Some(&session), None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let app = app();

        let (status, body) = send(&app, request("GET", "/api/history", Some("nope"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_SESSION");

        let (status, _) = send(&app, request("GET", "/api/history", None, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_and_processed() {
        let app = app();
        let session = open(&app).await;

        let (status, body) = send(&app, request("GET", "/api/history?status=success", Some(&session), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transactions"], json!([]));

        let (status, _) = send(&app, request("GET", "/api/history?status=bogus", Some(&session), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, marked) = send(
            &app,
            request("POST", "/api/payments/inv-1/processed", Some(&session), None),
        )
        .await;
        assert_eq!(marked["processed"], true);

        let (status, body) = send(
            &app,
            request("POST", "/api/payments/inv-1/poll", Some(&session), None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_STATE");

        let (_, dismissed) = send(
            &app,
            request("POST", "/api/notifications/inv-1/dismiss", Some(&session), None),
        )
        .await;
        assert_eq!(dismissed["dismissed"], false);
    }
}
