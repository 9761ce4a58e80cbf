//! WebApi - command surface for the presentation layer
//!
//! ## Responsibilities
//! - REST routes over the registry and coordinators
//! - Companion WebSocket endpoint and LAN discovery endpoint
//! - Request validation and response formatting

mod routes;

pub use routes::create_router;

use crate::models::HealthResponse;
use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cameras: state.registry.list().await.len(),
        active_streams: state.streams.active_ids().await.len(),
        active_recordings: state.recordings.active_ids().await.len(),
    };
    Json(response)
}
