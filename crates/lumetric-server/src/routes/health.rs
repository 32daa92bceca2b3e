use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// GET /api/health — liveness plus a couple of cheap queue gauges.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending = state.buffer.pending().await;
    Json(json!({
        "status": "ok",
        "buffered_events": pending,
    }))
}
