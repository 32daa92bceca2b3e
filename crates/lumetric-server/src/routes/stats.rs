use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

use lumetric_duckdb::events::{ScanCursor, ScanFilter};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    /// Inclusive, YYYY-MM-DD.
    pub start_date: String,
    /// Inclusive, YYYY-MM-DD.
    pub end_date: String,
    pub source: Option<String>,
    pub device_class: Option<String>,
}

/// GET /api/sites/{site_id}/stats — per-day rollup summary.
///
/// Served from materialized buckets up to the site's rollup high-water mark;
/// later days fall back to a raw scan so fresh events are never invisible.
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    Query(params): Query<StatsParams>,
) -> Result<impl IntoResponse, AppError> {
    if !state.is_valid_site(&site_id).await {
        return Err(AppError::NotFound(format!("unknown site: {site_id}")));
    }

    let start_day = parse_day(&params.start_date, "start_date")?;
    let end_day = parse_day(&params.end_date, "end_date")?;
    if end_day < start_day {
        return Err(AppError::BadRequest(
            "end_date must not precede start_date".to_string(),
        ));
    }

    let filter = ScanFilter {
        kind: None,
        source: params.source,
        device_class: params.device_class,
    };
    let summary = state.db.read_stats(&site_id, start_day, end_day, &filter).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    /// Inclusive, RFC 3339.
    pub start: DateTime<Utc>,
    /// Exclusive, RFC 3339.
    pub end: DateTime<Utc>,
    pub kind: Option<String>,
    pub source: Option<String>,
    pub device_class: Option<String>,
    /// Resume position from a previous page's `next_cursor`.
    pub cursor_occurred_at: Option<DateTime<Utc>>,
    pub cursor_event_id: Option<String>,
    pub limit: Option<usize>,
}

const EVENTS_PAGE_MAX: usize = 1000;

/// GET /api/sites/{site_id}/events — raw event drill-down.
///
/// Keyset-paginated time-range scan; pass the returned `next_cursor` fields
/// back as `cursor_occurred_at` / `cursor_event_id` to resume.
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
    Query(params): Query<EventsParams>,
) -> Result<impl IntoResponse, AppError> {
    if !state.is_valid_site(&site_id).await {
        return Err(AppError::NotFound(format!("unknown site: {site_id}")));
    }
    if params.end <= params.start {
        return Err(AppError::BadRequest("end must be after start".to_string()));
    }

    let cursor = match (params.cursor_occurred_at, &params.cursor_event_id) {
        (Some(occurred_at), Some(event_id)) => Some(ScanCursor {
            occurred_at,
            event_id: event_id.clone(),
        }),
        (None, None) => None,
        _ => {
            return Err(AppError::BadRequest(
                "cursor_occurred_at and cursor_event_id must be passed together".to_string(),
            ))
        }
    };

    let filter = ScanFilter {
        kind: params.kind,
        source: params.source,
        device_class: params.device_class,
    };
    let limit = params.limit.unwrap_or(100).clamp(1, EVENTS_PAGE_MAX);

    let page = state
        .db
        .scan_events(
            &site_id,
            params.start,
            params.end,
            &filter,
            cursor.as_ref(),
            limit,
        )
        .await?;

    Ok(Json(json!({
        "events": page.events,
        "next_cursor": page.next_cursor,
    })))
}

fn parse_day(value: &str, field: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("{field} must be YYYY-MM-DD")))
}
