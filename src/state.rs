//! Application state
//!
//! Holds configuration and all shared components.

use crate::companion::CompanionGateway;
use crate::events::EventBus;
use crate::recording::RecordingCoordinator;
use crate::registry::DeviceRegistry;
use crate::secrets::SecretStore;
use crate::storage::StorageManager;
use crate::stream::StreamCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration, loaded from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Directory recordings are written to
    pub recording_dir: PathBuf,
    /// Free-space floor for recordings (GiB)
    pub min_free_space_gb: u64,
    /// Delete oldest recordings when below the floor
    pub recycle_oldest: bool,
    /// Optional total recording cap (GiB)
    pub max_storage_gb: Option<u64>,
    /// Concurrent recording cap
    pub max_concurrent_recordings: usize,
    /// Seconds between discovery cycles
    pub discovery_interval_secs: u64,
    /// Address range for the network sweep, e.g. "192.168.1.0/24"
    pub scan_range: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8090),
            recording_dir: std::env::var("RECORDING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/camhub/recordings")),
            min_free_space_gb: std::env::var("MIN_FREE_SPACE_GB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            recycle_oldest: std::env::var("RECYCLE_OLDEST")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            max_storage_gb: std::env::var("MAX_STORAGE_GB")
                .ok()
                .and_then(|v| v.parse().ok()),
            max_concurrent_recordings: std::env::var("MAX_CONCURRENT_RECORDINGS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            discovery_interval_secs: std::env::var("DISCOVERY_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            scan_range: std::env::var("SCAN_RANGE").ok(),
        }
    }
}

impl AppConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(10))
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub events: Arc<EventBus>,
    pub secrets: Arc<SecretStore>,
    pub gateway: Arc<CompanionGateway>,
    pub registry: Arc<DeviceRegistry>,
    pub streams: Arc<StreamCoordinator>,
    pub recordings: Arc<RecordingCoordinator>,
    pub storage: Arc<StorageManager>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_interval_floor() {
        let mut config = AppConfig::default();
        config.discovery_interval_secs = 1;
        assert_eq!(config.discovery_interval(), Duration::from_secs(10));
    }
}
