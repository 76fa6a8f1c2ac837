//! WebAPI - Detector HTTP Endpoints
//!
//! ## Responsibilities
//!
//! - Live video feed
//! - Health and last-known light status
//! - Response formatting

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::error::Error;
use crate::models::HealthResponse;
use crate::state::AppState;

/// Landing endpoint
pub async fn index() -> impl IntoResponse {
    Json(json!({ "message": "Connect to /video_feed for streaming." }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        intersection_id: state.config.intersection_id.clone(),
        viewers: state.stream.viewer_count(),
        frames_captured: state.frames.frames_captured(),
        light_status: state.status.current().map(|event| event.status),
    };

    Json(response)
}

/// Last status read from the snapshot
pub async fn light_status(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    state
        .status
        .current()
        .map(Json)
        .ok_or_else(|| Error::NotFound("no light status observed yet".to_string()))
}
