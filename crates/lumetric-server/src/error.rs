use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// One rejected item of a collect batch.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub index: usize,
    pub field: &'static str,
    pub code: &'static str,
    pub message: String,
}

/// Application-level errors that map directly to HTTP responses.
///
/// Every variant implements [`IntoResponse`] so Axum handlers can use
/// `Result<impl IntoResponse, AppError>` as their return type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// One or more collect items failed validation. The whole batch is
    /// rejected — no partial write — with a per-item error list.
    #[error("{} item(s) failed validation", .0.len())]
    ValidationFailed(Vec<ItemError>),

    /// Ingestion shard is full. Surfaced immediately so the tracking script
    /// can apply its own local backoff; `accepted` reports how many items of
    /// the batch were queued before the shard filled.
    #[error("ingestion overloaded")]
    Overloaded {
        retry_after_seconds: u64,
        accepted: usize,
    },

    /// Webhook signature missing or wrong. Rejected and logged, never
    /// processed.
    #[error("invalid signature")]
    SignatureInvalid,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, "not_found", &msg),
            AppError::BadRequest(msg) => {
                error_response(StatusCode::BAD_REQUEST, "validation_error", &msg)
            }
            AppError::ValidationFailed(items) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": {
                        "code": "validation_error",
                        "message": "one or more events failed validation",
                        "field": null
                    },
                    "errors": items
                })),
            )
                .into_response(),
            AppError::Overloaded {
                retry_after_seconds,
                accepted,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": {
                            "code": "overloaded",
                            "message": "ingestion queue is full, retry later",
                            "field": null
                        },
                        "accepted": accepted
                    })),
                )
                    .into_response();
                if let Ok(value) = retry_after_seconds.to_string().parse() {
                    response
                        .headers_mut()
                        .insert(axum::http::header::RETRY_AFTER, value);
                }
                response
            }
            AppError::SignatureInvalid => error_response(
                StatusCode::UNAUTHORIZED,
                "signature_invalid",
                "Webhook signature verification failed",
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Internal server error",
                )
            }
        }
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message,
                "field": null
            }
        })),
    )
        .into_response()
}
