//! Axum-based HTTP server for call-control webhooks.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::events::{
    CloudEvent, EventGridEvent, WebhookEvent, parse_call_event, parse_webhook_event,
};
use crate::state::GatewayState;

/// Build the router without binding a socket.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/webhook", post(webhook_handler))
        .route("/callbacks/{session_id}", post(callback_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Start the gateway HTTP server and run until Ctrl+C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr();
    let app = build_router(state);

    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn root_handler() -> &'static str {
    "Hello ACS CallAutomation!"
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": state.sessions.len(),
    }))
}

/// Event Grid delivery: subscription validation and incoming calls.
async fn webhook_handler(State(state): State<Arc<GatewayState>>, body: Bytes) -> impl IntoResponse {
    let events: Vec<EventGridEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(e) => {
            warn!(%e, "Malformed webhook payload");
            return (StatusCode::BAD_REQUEST, axum::Json(json!({ "error": e.to_string() })));
        }
    };

    let mut validation = None;
    for event in &events {
        match parse_webhook_event(event) {
            WebhookEvent::Validation { code } => {
                info!("Event Grid subscription validation");
                validation = Some(code);
            }
            WebhookEvent::IncomingCall {
                incoming_call_context,
                caller_id,
            } => {
                if let Err(e) = state
                    .machine
                    .handle_incoming_call(&incoming_call_context, &caller_id)
                    .await
                {
                    warn!(%caller_id, kind = e.kind(), %e, "Failed to answer incoming call");
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_error(e.kind());
                }
            }
            WebhookEvent::Ignored(event_type) => {
                debug!(%event_type, "Ignoring webhook event");
            }
        }
    }

    match validation {
        Some(code) => (
            StatusCode::OK,
            axum::Json(json!({ "validationResponse": code })),
        ),
        None => (StatusCode::OK, axum::Json(json!({}))),
    }
}

/// Call Automation callbacks for one session. Always acknowledged; events
/// for ended calls are dropped by the machine.
async fn callback_handler(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    let events: Vec<CloudEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(e) => {
            warn!(%session_id, %e, "Malformed callback payload");
            return StatusCode::BAD_REQUEST;
        }
    };

    for event in &events {
        let event = parse_call_event(event);
        #[cfg(feature = "metrics")]
        crate::metrics::record_call_event(event.name());
        state.machine.handle_call_event(&session_id, event).await;
    }

    StatusCode::OK
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(%e, "Failed to listen for CTRL+C, shutting down");
    }
    info!("Shutdown signal received");
}
