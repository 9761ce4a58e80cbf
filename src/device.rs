//! Device model shared across probes, registry, and coordinators
//!
//! Devices are owned exclusively by the DeviceRegistry; every other component
//! references them by id, never by mutable handle.

use crate::secrets::SecretHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport a camera is reachable through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportType {
    Local,
    NetworkRtsp,
    NetworkHttp,
    Onvif,
    Companion,
}

impl TransportType {
    /// Namespace prefix used when composing device ids
    pub fn prefix(&self) -> &'static str {
        match self {
            TransportType::Local => "local",
            TransportType::NetworkRtsp => "rtsp",
            TransportType::NetworkHttp => "http",
            TransportType::Onvif => "onvif",
            TransportType::Companion => "companion",
        }
    }
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Compose a transport-prefixed, globally unique device id
pub fn device_id(transport: TransportType, suffix: &str) -> String {
    format!("{}:{}", transport.prefix(), suffix)
}

/// Device lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Recording,
    Error,
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Capability set reported (or assumed) for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub resolutions: Vec<Resolution>,
    pub frame_rates: Vec<u32>,
    pub audio: bool,
    pub ptz: bool,
    pub infrared: bool,
    pub codecs: Vec<String>,
    pub protocols: Vec<String>,
}

impl DeviceCapabilities {
    /// Conservative fallback used when a capability probe fails.
    /// Probing must never fail the caller; it degrades to this set.
    pub fn fallback() -> Self {
        Self {
            resolutions: vec![
                Resolution::new(1920, 1080),
                Resolution::new(1280, 720),
                Resolution::new(854, 480),
            ],
            frame_rates: vec![30],
            audio: false,
            ptz: false,
            infrared: false,
            codecs: vec!["h264".to_string()],
            protocols: Vec::new(),
        }
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Transport-specific connection information.
///
/// Credentials are referenced by [`SecretHandle`], never stored inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionDescriptor {
    Local {
        /// Device node, e.g. /dev/video0
        system_path: String,
    },
    Rtsp {
        host: String,
        port: u16,
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<SecretHandle>,
    },
    Http {
        host: String,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot_path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<SecretHandle>,
    },
    Onvif {
        host: String,
        /// Device service endpoint from WS-Discovery XAddrs
        service_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<SecretHandle>,
    },
    Companion {
        remote_addr: String,
    },
}

impl ConnectionDescriptor {
    pub fn credentials(&self) -> Option<SecretHandle> {
        match self {
            ConnectionDescriptor::Rtsp { credentials, .. }
            | ConnectionDescriptor::Http { credentials, .. }
            | ConnectionDescriptor::Onvif { credentials, .. } => *credentials,
            _ => None,
        }
    }
}

/// A camera known to the registry, regardless of transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Transport-prefixed, globally unique id
    pub id: String,
    pub name: String,
    pub transport: TransportType,
    pub status: DeviceStatus,
    pub capabilities: DeviceCapabilities,
    pub descriptor: ConnectionDescriptor,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(
        id: String,
        name: String,
        transport: TransportType,
        descriptor: ConnectionDescriptor,
    ) -> Self {
        Self {
            id,
            name,
            transport,
            status: DeviceStatus::Connected,
            capabilities: DeviceCapabilities::fallback(),
            descriptor,
            last_seen: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_prefixing() {
        assert_eq!(
            device_id(TransportType::NetworkRtsp, "192.168.1.10:554"),
            "rtsp:192.168.1.10:554"
        );
        assert_eq!(device_id(TransportType::Local, "video0"), "local:video0");
    }

    #[test]
    fn test_transport_serde_kebab_case() {
        let json = serde_json::to_string(&TransportType::NetworkRtsp).unwrap();
        assert_eq!(json, "\"network-rtsp\"");
    }

    #[test]
    fn test_fallback_capabilities() {
        let caps = DeviceCapabilities::fallback();
        assert_eq!(caps.resolutions.len(), 3);
        assert_eq!(caps.frame_rates, vec![30]);
    }
}
