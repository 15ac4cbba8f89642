//! Export HTTP surface.

pub mod body;
pub mod routes;

use axum::{Router, routing::get};
use tower_http::compression::CompressionLayer;

use crate::server::AppState;

/// JSON endpoints, compressed when the client allows it.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/analytics/export", get(routes::request_export))
        .route(
            "/analytics/export/{export_id}/status",
            get(routes::export_status),
        )
        .route("/analytics/exports", get(routes::export_history))
        .layer(CompressionLayer::new())
}

/// Payload endpoints. Left uncompressed so chunks reach the client as they
/// are produced.
pub fn download_router() -> Router<AppState> {
    Router::new()
        .route("/analytics/export/stream", get(routes::stream_export))
        .route("/analytics/export/download", get(routes::download_export))
        .route(
            "/analytics/export/{export_id}/download",
            get(routes::download_artifact),
        )
}
