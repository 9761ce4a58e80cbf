//! Companion wire protocol
//!
//! JSON messages over a WebSocket, tagged by `type`. Unknown message types
//! deserialize to [`CompanionMessage::Unrecognized`] and are ignored, so
//! newer companion app versions never break the session.

use crate::device::DeviceCapabilities;
use serde::{Deserialize, Serialize};

/// Messages exchanged with a companion device, both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompanionMessage {
    /// First message from the device after connect
    Handshake {
        version: String,
    },
    /// Server acknowledgement of the handshake
    HandshakeAck {
        session_id: String,
    },
    /// Device announces its identity
    Register {
        device_id: String,
        device_info: CompanionDeviceInfo,
    },
    /// Device reports its capability set
    Capabilities {
        capabilities: DeviceCapabilities,
    },
    /// Server asks the device to start streaming
    StreamStart,
    /// Frame payload from the device, base64-encoded
    StreamData {
        data: String,
    },
    /// Server asks the device to stop streaming
    StreamStop,
    Ping,
    Pong,
    /// Device-side status report (battery, thermal state)
    Status {
        #[serde(default)]
        battery_percent: Option<u8>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Forward-compatibility catch-all
    #[serde(other)]
    Unrecognized,
}

/// Identity block sent with Register
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionDeviceInfo {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
}

/// Body of the HTTP discovery endpoint companion apps poll on the LAN
#[derive(Debug, Clone, Serialize)]
pub struct DiscoverResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub port: u16,
    pub capabilities: Vec<&'static str>,
}

impl DiscoverResponse {
    pub fn current(port: u16) -> Self {
        Self {
            service: "camhub",
            version: env!("CARGO_PKG_VERSION"),
            port,
            capabilities: vec!["stream", "snapshot", "status"],
        }
    }
}
