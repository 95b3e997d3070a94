//! HTTP surface: the signaling WebSocket upgrade and a small health
//! endpoint.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::hub::{self, AppState};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(viewer_ws_upgrade))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn viewer_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub::handle_viewer_ws(socket, state))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rooms = state
        .rooms_repo
        .list()
        .await
        .map(|r| r.len())
        .unwrap_or(0);
    Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "rooms": rooms,
        "audio_readers": state.audio_streaming.active_reader_count().await,
        "video_readers": state.video_streaming.active_reader_count().await,
        "audio_connections": state.audio_rtc.connection_count().await,
        "video_connections": state.video_rtc.connection_count().await,
        "viewers": state.connections.lock().await.len(),
    }))
}
