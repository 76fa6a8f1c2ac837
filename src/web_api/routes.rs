//! API Routes

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};

use crate::state::AppState;
use crate::stream_encoder;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(super::index))
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/status", get(super::light_status))
        // Streaming
        .route("/video_feed", get(video_feed))
        .with_state(state)
}

/// Multipart JPEG stream, one per viewer
async fn video_feed(State(state): State<AppState>) -> impl IntoResponse {
    let stream = state.stream.viewer_stream(state.shutdown.clone());
    (
        [
            (header::CONTENT_TYPE, stream_encoder::content_type()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(stream),
    )
}
