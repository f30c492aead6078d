//! Admin HTTP interface.
//!
//! Two endpoints: pre-seeding a device's client variables before (or after)
//! it joins, and a counter snapshot. Pre-seeded writes carry the reserved
//! server writer and flow through the same LWW path as client writes.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use roomcast_core::{CounterSnapshot, RelayCounters, RelayError};
use roomcast_proto::message::{MAX_DEVICE_ID_LEN, MAX_ROOM_ID_LEN};
use tokio::sync::watch;

use crate::{error::ServerError, state::RoomDirectory, unix_now};

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    /// Room directory the pre-seed endpoint writes into.
    pub rooms: Arc<RoomDirectory>,
    /// Counters behind the stats endpoint.
    pub counters: Arc<RelayCounters>,
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/v1/rooms/{room_id}/devices/{device_id}/client-variables",
            post(preseed_client_variables),
        )
        .route("/v1/stats", get(stats))
        .with_state(state)
}

/// Serve the admin interface until shutdown.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| ServerError::Transport(format!("admin interface: {e}")))
}

async fn preseed_client_variables(
    State(state): State<AdminState>,
    Path((room_id, device_id)): Path<(String, String)>,
    Json(vars): Json<BTreeMap<String, String>>,
) -> StatusCode {
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
        return StatusCode::BAD_REQUEST;
    }
    if device_id.is_empty() || device_id.len() > MAX_DEVICE_ID_LEN {
        return StatusCode::BAD_REQUEST;
    }

    let entries: Vec<(String, String)> = vars.into_iter().collect();
    let slot = state.rooms.get_or_create(&room_id).await;
    let mut room = slot.write().await;
    match room.preseed(&device_id, &entries, unix_now()) {
        Ok(()) => StatusCode::OK,
        Err(RelayError::NameLength(_) | RelayError::ValueLength(_)) => StatusCode::BAD_REQUEST,
        Err(RelayError::AdminCapacity | RelayError::ScopeCapacity) => {
            StatusCode::PAYLOAD_TOO_LARGE
        },
        Err(e) => {
            tracing::warn!(room = %room_id, device = %device_id, "pre-seed failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        },
    }
}

async fn stats(State(state): State<AdminState>) -> Json<CounterSnapshot> {
    Json(state.counters.snapshot())
}
