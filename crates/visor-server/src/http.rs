//! Outward-facing control plane: push text/bitmaps onto every active
//! display, toggle per-session modes, and report bridge health.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use visor_gateway::GatewayClient;

use crate::sessions::SessionRegistry;

/// Control plane configuration.
pub struct ControlPlaneConfig {
    /// Bound on loopback only: this surface has no auth.
    pub port: u16,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self { port: 3001 }
    }
}

/// Shared state for the control-plane handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub gateway: GatewayClient,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Build the control-plane router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/push", post(push_text))
        .route("/push-bitmap", post(push_bitmap))
        .route("/mic", get(mic_report).post(mic_toggle))
        .route("/copilot", get(copilot_report).post(copilot_toggle))
        .route("/status", get(status_report))
        .route("/debug", get(debug_report))
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Keeps the server task alive.
pub struct ControlPlaneHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// Bind and serve the control plane. Port 0 picks a free port.
pub async fn start_control_plane(
    config: ControlPlaneConfig,
    registry: Arc<SessionRegistry>,
    gateway: GatewayClient,
) -> Result<ControlPlaneHandle, std::io::Error> {
    let state = AppState {
        registry,
        gateway,
        started_at: chrono::Utc::now(),
    };
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    let port = listener.local_addr()?.port();

    tracing::info!(port, "control plane listening");
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ControlPlaneHandle {
        port,
        _server: server,
    })
}

#[derive(Deserialize)]
struct PushTextBody {
    text: Option<String>,
    /// Milliseconds.
    duration: Option<u64>,
}

async fn push_text(State(state): State<AppState>, Json(body): Json<PushTextBody>) -> impl IntoResponse {
    let Some(text) = body.text.filter(|t| !t.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "text required"})),
        );
    };
    let dwell = body.duration.map(Duration::from_millis);

    let sessions = state.registry.all();
    for session in &sessions {
        session.display.show_notification("Visor", text.clone(), dwell);
    }
    tracing::info!(sessions = sessions.len(), chars = text.len(), "pushed text");
    (
        StatusCode::OK,
        Json(json!({"ok": true, "sessions": sessions.len()})),
    )
}

#[derive(Deserialize)]
struct PushBitmapBody {
    bitmap: Option<String>,
    duration: Option<u64>,
}

async fn push_bitmap(
    State(state): State<AppState>,
    Json(body): Json<PushBitmapBody>,
) -> impl IntoResponse {
    let Some(bitmap) = body.bitmap.filter(|b| !b.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "bitmap required"})),
        );
    };
    let dwell = body.duration.map(Duration::from_millis);

    let sessions = state.registry.all();
    for session in &sessions {
        session.display.push_bitmap(bitmap.clone(), dwell);
    }
    tracing::info!(sessions = sessions.len(), bytes = bitmap.len(), "pushed bitmap");
    (
        StatusCode::OK,
        Json(json!({"ok": true, "sessions": sessions.len()})),
    )
}

async fn mic_toggle(State(state): State<AppState>) -> impl IntoResponse {
    let mut modes = serde_json::Map::new();
    for session in state.registry.all() {
        let on = session.toggle_listening();
        session.display.set_dashboard(session.dashboard_line());
        modes.insert(session.id.to_string(), json!(on));
    }
    Json(json!({"ok": true, "listening": modes}))
}

async fn mic_report(State(state): State<AppState>) -> impl IntoResponse {
    let mut modes = serde_json::Map::new();
    for session in state.registry.all() {
        modes.insert(session.id.to_string(), json!(session.listening()));
    }
    Json(json!({"ok": true, "listening": modes}))
}

async fn copilot_toggle(State(state): State<AppState>) -> impl IntoResponse {
    let mut modes = serde_json::Map::new();
    for session in state.registry.all() {
        let on = session.toggle_copilot();
        session.display.set_dashboard(session.dashboard_line());
        modes.insert(session.id.to_string(), json!(on));
    }
    Json(json!({"ok": true, "copilot": modes}))
}

async fn copilot_report(State(state): State<AppState>) -> impl IntoResponse {
    let mut modes = serde_json::Map::new();
    for session in state.registry.all() {
        modes.insert(session.id.to_string(), json!(session.copilot()));
    }
    Json(json!({"ok": true, "copilot": modes}))
}

async fn status_report(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "gateway": state.gateway.is_connected(),
        "sessions": state.registry.count(),
        "sessionIds": state.registry.ids(),
    }))
}

async fn debug_report(State(state): State<AppState>) -> impl IntoResponse {
    let sessions: Vec<serde_json::Value> = state
        .registry
        .all()
        .into_iter()
        .map(|session| {
            json!({
                "id": session.id.to_string(),
                "listening": session.listening(),
                "copilot": session.copilot(),
                "display": session.display.status(),
            })
        })
        .collect();

    Json(json!({
        "ok": true,
        "uptimeSecs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "transport": state.gateway.status(),
        "sessions": sessions,
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}
