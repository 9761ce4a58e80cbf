//! Shared API models
//!
//! Types shared between the web layer and callers, kept here to avoid
//! circular dependencies.

use crate::stream::session::StreamConfig;
use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cameras: usize,
    pub active_streams: usize,
    pub active_recordings: usize,
}

/// Commands accepted by the per-camera command endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CameraCommand {
    StartStream {
        #[serde(default)]
        config: Option<StreamConfig>,
    },
    StopStream,
    PauseStream,
    ResumeStream,
    StartRecording {
        #[serde(default)]
        config: Option<crate::recording::RecordingConfig>,
    },
    StopRecording,
    Snapshot,
    TestConnection,
    Restart,
}

/// Body for manual RTSP registration
#[derive(Debug, Clone, Deserialize)]
pub struct AddRtspRequest {
    pub name: String,
    pub url: String,
}

/// Body for credential assignment
#[derive(Debug, Clone, Deserialize)]
pub struct SetCredentialsRequest {
    pub username: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_command_tags() {
        let cmd: CameraCommand = serde_json::from_str(r#"{"command":"stop_stream"}"#).unwrap();
        assert!(matches!(cmd, CameraCommand::StopStream));

        let cmd: CameraCommand =
            serde_json::from_str(r#"{"command":"start_stream","config":{"quality":"low"}}"#)
                .unwrap();
        match cmd {
            CameraCommand::StartStream { config } => assert!(config.is_some()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_api_response_skips_absent_fields() {
        let json = serde_json::to_string(&ApiResponse::success(1u32)).unwrap();
        assert_eq!(json, r#"{"ok":true,"data":1}"#);
    }
}
