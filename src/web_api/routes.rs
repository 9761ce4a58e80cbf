//! Route handlers

use crate::companion::messages::DiscoverResponse;
use crate::device::{Device, DeviceStatus};
use crate::error::{Error, Result};
use crate::models::{
    AddRtspRequest, ApiResponse, CameraCommand, SetCredentialsRequest,
};
use crate::secrets::Credentials;
use crate::snapshot;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(super::health_check))
        .route("/discover", get(companion_discover))
        .route("/ws/companion", get(companion_ws))
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras/rtsp", post(add_rtsp_camera))
        .route(
            "/api/cameras/:id",
            get(get_camera).delete(remove_camera),
        )
        .route("/api/cameras/:id/credentials", post(set_credentials))
        .route("/api/cameras/:id/command", post(camera_command))
        .route("/api/discovery/start", post(start_discovery))
        .route("/api/discovery/stop", post(stop_discovery))
        .route("/api/discovery/run", post(run_discovery))
        .route("/api/events/recent", get(recent_events))
        .with_state(state)
}

/// LAN discovery endpoint polled by companion apps
async fn companion_discover(State(state): State<AppState>) -> impl IntoResponse {
    Json(DiscoverResponse::current(state.config.port))
}

async fn companion_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        state.gateway.handle_socket(socket).await;
    })
}

async fn list_cameras(State(state): State<AppState>) -> Json<ApiResponse<Vec<Device>>> {
    Json(ApiResponse::success(state.registry.list().await))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Device>>> {
    let device = state.registry.get(&id).await?;
    Ok(Json(ApiResponse::success(device)))
}

async fn remove_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<String>>> {
    // Tear down anything running before the device disappears
    let _ = state.recordings.stop(&id).await;
    let _ = state.streams.stop(&id).await;
    state.registry.remove(&id).await?;
    Ok(Json(ApiResponse::success(id)))
}

async fn add_rtsp_camera(
    State(state): State<AppState>,
    Json(body): Json<AddRtspRequest>,
) -> Result<Json<ApiResponse<Device>>> {
    if body.name.trim().is_empty() {
        return Err(Error::Validation("Camera name must not be empty".into()));
    }
    let device = state.registry.add_rtsp_camera(&body.name, &body.url).await?;
    Ok(Json(ApiResponse::success(device)))
}

async fn set_credentials(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetCredentialsRequest>,
) -> Result<Json<ApiResponse<String>>> {
    state
        .registry
        .set_credentials(
            &id,
            Credentials {
                username: body.username,
                password: body.password,
            },
        )
        .await?;
    Ok(Json(ApiResponse::success(id)))
}

/// Per-camera command dispatch
async fn camera_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(command): Json<CameraCommand>,
) -> Result<Response> {
    let device = state.registry.get(&id).await?;

    let response = match command {
        CameraCommand::StartStream { config } => {
            state
                .streams
                .start(&device, config.unwrap_or_default())
                .await?;
            state
                .registry
                .set_status(&id, DeviceStatus::Streaming)
                .await?;
            Json(ApiResponse::success(json!({ "streaming": true }))).into_response()
        }
        CameraCommand::StopStream => {
            state.streams.stop(&id).await?;
            state
                .registry
                .set_status(&id, DeviceStatus::Connected)
                .await?;
            Json(ApiResponse::success(json!({ "streaming": false }))).into_response()
        }
        CameraCommand::PauseStream => {
            state.streams.pause(&id).await?;
            Json(ApiResponse::success(json!({ "paused": true }))).into_response()
        }
        CameraCommand::ResumeStream => {
            state.streams.resume(&id).await?;
            Json(ApiResponse::success(json!({ "paused": false }))).into_response()
        }
        CameraCommand::StartRecording { config } => {
            let session_id = state
                .recordings
                .start(&device, config.unwrap_or_default())
                .await?;
            state
                .registry
                .set_status(&id, DeviceStatus::Recording)
                .await?;
            Json(ApiResponse::success(json!({ "session_id": session_id }))).into_response()
        }
        CameraCommand::StopRecording => {
            let files = state.recordings.stop(&id).await?;
            let status = if state.streams.is_active(&id).await {
                DeviceStatus::Streaming
            } else {
                DeviceStatus::Connected
            };
            state.registry.set_status(&id, status).await?;
            Json(ApiResponse::success(json!({ "files": files }))).into_response()
        }
        CameraCommand::Snapshot => {
            let image = snapshot::capture_snapshot(&device, &state.secrets).await?;
            ([(header::CONTENT_TYPE, "image/jpeg")], image).into_response()
        }
        CameraCommand::TestConnection => {
            let reachable = state.registry.test_connection(&id).await?;
            Json(ApiResponse::success(json!({ "reachable": reachable }))).into_response()
        }
        CameraCommand::Restart => {
            state.streams.restart(&device).await?;
            Json(ApiResponse::success(json!({ "restarted": true }))).into_response()
        }
    };
    Ok(response)
}

async fn start_discovery(State(state): State<AppState>) -> Result<Json<ApiResponse<String>>> {
    state.registry.start_discovery().await?;
    Ok(Json(ApiResponse::success("started".to_string())))
}

async fn stop_discovery(State(state): State<AppState>) -> Json<ApiResponse<String>> {
    state.registry.stop_discovery().await;
    Json(ApiResponse::success("stopped".to_string()))
}

/// Trigger one discovery cycle immediately
async fn run_discovery(State(state): State<AppState>) -> Json<ApiResponse<usize>> {
    state.registry.run_cycle().await;
    Json(ApiResponse::success(state.registry.list().await.len()))
}

#[derive(Debug, Deserialize)]
struct RecentEventsQuery {
    #[serde(default = "default_event_count")]
    count: usize,
}

fn default_event_count() -> usize {
    50
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentEventsQuery>,
) -> impl IntoResponse {
    let events = state.events.recent(query.count.min(500)).await;
    Json(ApiResponse::success(events))
}
