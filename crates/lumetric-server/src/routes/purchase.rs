use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

use lumetric_core::attribution::PurchaseNotification;

use crate::error::AppError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-lumetric-signature";

/// POST /api/purchase — payment processor webhook.
///
/// The raw body is HMAC-SHA256 signed with the shared webhook secret; the
/// signature arrives hex-encoded in `x-lumetric-signature`. Verification runs
/// against the exact bytes received, before any JSON parsing. Delivery is
/// at-least-once upstream, so attribution is idempotent on `purchase_id` and
/// a redelivery returns the already-stored record.
pub async fn purchase(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    verify_signature(&state.config.webhook_secret, &headers, &body)?;

    let notification: PurchaseNotification = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid purchase payload: {e}")))?;

    if notification.purchase_id.trim().is_empty() {
        return Err(AppError::BadRequest("purchase_id is required".to_string()));
    }
    if !notification.amount.is_finite() || notification.amount < 0.0 {
        return Err(AppError::BadRequest(
            "amount must be a non-negative finite number".to_string(),
        ));
    }
    if !state.is_valid_site(&notification.site_id).await {
        return Err(AppError::NotFound(format!(
            "unknown site: {}",
            notification.site_id
        )));
    }

    let (record, newly_attributed) = state
        .db
        .attribute(&notification, state.config.lookback_days, &state.matchers)
        .await?;

    if newly_attributed {
        info!(
            purchase_id = %record.purchase_id,
            site_id = %record.site_id,
            matched = record.matched_session_id.is_some(),
            "purchase attributed"
        );
    } else {
        info!(purchase_id = %record.purchase_id, "duplicate purchase delivery, returning stored record");
    }

    Ok((StatusCode::OK, Json(record)))
}

fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), AppError> {
    if secret.is_empty() {
        warn!("webhook secret not configured, rejecting purchase notification");
        return Err(AppError::SignatureInvalid);
    }

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::SignatureInvalid)?;
    let provided = hex::decode(provided.trim()).map_err(|_| AppError::SignatureInvalid)?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::SignatureInvalid)?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| {
        warn!("purchase webhook signature mismatch");
        AppError::SignatureInvalid
    })
}
