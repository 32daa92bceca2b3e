use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use lumetric_core::event::{CollectOrBatch, Event};
use lumetric_core::validate::{validate, ValidEvent};
use lumetric_core::visitor::{compute_fingerprint, extract_referrer_domain};

use crate::enrich::{device_class, extract_client_ip, extract_user_agent, lookup_country};
use crate::error::{AppError, ItemError};
use crate::state::AppState;

/// POST /api/collect — single event or batch.
///
/// The whole batch is validated first; any bad item rejects the request with
/// a per-item error list and nothing is buffered. A valid batch is handed to
/// the ingestion buffer, which answers 202 (queued, durability pending) or,
/// when the site's shard is full, 429 with a Retry-After hint.
pub async fn collect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CollectOrBatch>,
) -> Result<impl IntoResponse, AppError> {
    let payloads = match body {
        CollectOrBatch::Single(payload) => vec![*payload],
        CollectOrBatch::Batch(payloads) => payloads,
    };
    if payloads.is_empty() {
        return Err(AppError::BadRequest("empty batch".to_string()));
    }
    if payloads.len() > state.config.collect_batch_max {
        return Err(AppError::BadRequest(format!(
            "batch exceeds {} events",
            state.config.collect_batch_max
        )));
    }

    let received_at = Utc::now();
    let mut valid: Vec<(usize, ValidEvent)> = Vec::with_capacity(payloads.len());
    let mut errors: Vec<ItemError> = Vec::new();

    for (index, payload) in payloads.iter().enumerate() {
        match validate(payload, received_at) {
            Ok(event) => valid.push((index, event)),
            Err(e) => errors.push(ItemError {
                index,
                field: e.field(),
                code: e.code(),
                message: e.to_string(),
            }),
        }
    }

    // Site existence is checked after shape validation so the error list
    // reports the most specific problem per item.
    for (index, event) in &valid {
        if !state.is_valid_site(&event.site_id).await {
            errors.push(ItemError {
                index: *index,
                field: "site_id",
                code: "unknown_site",
                message: format!("unknown site: {}", event.site_id),
            });
        }
    }

    if !errors.is_empty() {
        errors.sort_by_key(|e| e.index);
        return Err(AppError::ValidationFailed(errors));
    }

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    let country = lookup_country(state.geoip.as_ref(), &client_ip);
    let device = device_class(&user_agent);
    let fingerprint = if user_agent.is_empty() {
        None
    } else {
        Some(compute_fingerprint(&client_ip, &user_agent))
    };

    let events: Vec<Event> = valid
        .into_iter()
        .map(|(_, v)| Event {
            event_id: Uuid::new_v4().to_string(),
            site_id: v.site_id,
            visitor_id: v.visitor_id,
            session_id: String::new(),
            kind: v.kind,
            occurred_at: v.occurred_at,
            url: v.url,
            referrer_domain: v.referrer.as_deref().and_then(extract_referrer_domain),
            referrer: v.referrer,
            traffic: v.traffic,
            device_class: device.clone(),
            country: country.clone(),
            language: v.language,
            identity: v.identity,
            fingerprint: fingerprint.clone(),
        })
        .collect();

    let submitted = events.len();
    let outcome = state.buffer.submit(events).await;
    debug!(
        accepted = outcome.accepted,
        rejected = outcome.rejected,
        "collect batch submitted"
    );

    if outcome.rejected > 0 {
        return Err(AppError::Overloaded {
            retry_after_seconds: 1,
            accepted: outcome.accepted,
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": submitted })),
    ))
}
