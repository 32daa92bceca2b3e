use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExpireRequest {
    /// Monthly partitions whose range ends at or before this instant are
    /// dropped whole.
    pub before: DateTime<Utc>,
}

/// POST /api/retention/expire — manual retention run.
///
/// Retention is partition-granular: a whole month is dropped in O(1) instead
/// of row-by-row deletes. The scheduled daily run uses the same path with
/// `before` derived from the configured retention window.
pub async fn expire(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExpireRequest>,
) -> Result<impl IntoResponse, AppError> {
    let dropped = state.db.expire_partitions(request.before).await?;
    info!(count = dropped.len(), before = %request.before, "retention expire requested");
    Ok(Json(json!({ "dropped_partitions": dropped })))
}

/// POST /api/sites/{site_id}/visitors/{visitor_id}/erase — right to erasure.
///
/// Synchronous cascade over the visitor's events, sessions, and matched
/// attribution records; the response reports exactly what was deleted and is
/// returned only after every delete has executed.
pub async fn erase_visitor(
    State(state): State<Arc<AppState>>,
    Path((site_id, visitor_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    if !state.is_valid_site(&site_id).await {
        return Err(AppError::NotFound(format!("unknown site: {site_id}")));
    }
    if visitor_id.trim().is_empty() {
        return Err(AppError::BadRequest("visitor_id is required".to_string()));
    }

    // Flush first so buffered events for this visitor cannot outlive the
    // erasure acknowledgement.
    state.buffer.flush().await;

    let report = state.db.erase_visitor(&site_id, &visitor_id).await?;
    Ok(Json(report))
}
