use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, warn};

use tailgate_core::{metrics, Hub, SourceLayout};

use crate::ws;

/// Sources offered by the synthetic backend.
pub const SYNTHETIC_SOURCES: [&str; 3] = ["dev1", "dev2", "dev3"];

/// Shared state for HTTP and WebSocket handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub layout: Option<SourceLayout>,
    pub refresh_interval: Duration,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, layout: Option<SourceLayout>, refresh_interval: Duration) -> Self {
        Self {
            hub,
            layout,
            refresh_interval,
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub sources: usize,
    pub connections: usize,
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ws::serve_socket(socket, state.hub, state.refresh_interval))
}

/// Health endpoint - always returns 200 if server is running
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ready",
        backend: state.hub.registry().backend_kind().as_str(),
        sources: state.hub.registry().len(),
        connections: state.hub.connection_count(),
    })
}

/// Source ids a viewer may subscribe to.
async fn sources(State(state): State<AppState>) -> Response {
    if !state.hub.registry().backend_kind().reads_files() {
        return Json(SYNTHETIC_SOURCES.to_vec()).into_response();
    }
    let Some(layout) = &state.layout else {
        return Json(Vec::<String>::new()).into_response();
    };
    match layout.list_sources().await {
        Ok(names) => Json(names).into_response(),
        Err(e) => {
            warn!(root = %layout.root().display(), error = %e, "failed to list sources");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to list sources").into_response()
        }
    }
}

async fn prom_metrics() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/sources", get(sources))
        .route("/metrics", get(prom_metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop every backend whether or not
/// the server exited cleanly.
pub async fn run_server(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let hub = Arc::clone(&state.hub);
    let served = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    if let Err(e) = &served {
        error!(error = %e, "server exited with error");
    }
    hub.shutdown().await;
    served
}
