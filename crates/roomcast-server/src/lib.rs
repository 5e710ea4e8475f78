//! Roomcast signaling server.
//!
//! Rooms, rosters, and chat live in an in-memory [`registry::RoomRegistry`];
//! the [`signal`] module owns the per-connection WebSocket handling and
//! relays WebRTC envelopes between participants. Media never transits this
//! process.

pub mod registry;
pub mod signal;

use std::sync::Arc;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use registry::RoomRegistry;
use signal::ConnectionMap;

/// Shared state for the axum router.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub connections: ConnectionMap,
    pub outbox_capacity: usize,
}

impl AppState {
    pub fn new(message_cap: usize) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(message_cap)),
            connections: ConnectionMap::default(),
            outbox_capacity: signal::DEFAULT_OUTBOX_CAPACITY,
        }
    }

    /// Override the per-connection outbox depth.
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity.max(1);
        self
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeMetrics {
    status: &'static str,
    active_connections: usize,
    active_rooms: usize,
    timestamp: i64,
}

/// Liveness probe with a couple of runtime gauges.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let active_connections = state.connections.read().await.len();
    let active_rooms = state.registry.room_count().await;
    Json(RuntimeMetrics {
        status: "ok",
        active_connections,
        active_rooms,
        timestamp: roomcast_common::now_millis(),
    })
}

/// Build the signaling router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Roomcast Signaling Online" }))
        .route("/health", get(health))
        .route("/ws", get(signal::ws_handler))
        .with_state(state)
}
