use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::routes;
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/collect", post(routes::collect::collect))
        .route("/api/webhooks/purchase", post(routes::purchase::purchase))
        .route("/api/sites/{site_id}/stats", get(routes::stats::stats))
        .route("/api/sites/{site_id}/events", get(routes::stats::events))
        .route("/api/retention/expire", post(routes::retention::expire))
        .route(
            "/api/sites/{site_id}/visitors/{visitor_id}/erase",
            post(routes::retention::erase_visitor),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Collect endpoints are hit cross-origin by the tracking script, so an empty
/// origin list means "allow any origin".
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<axum::http::HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}
