//! DeviceRegistry - merged device table, the single query surface
//!
//! ## Responsibilities
//! - Own the authoritative device table across all transports
//! - Periodic discovery cycles with failure isolation per probe
//! - Staleness sweep for network/ONVIF devices that stop answering
//! - Consume companion gateway events and local hotplug events
//!
//! Discovered-again devices keep their runtime status; discovery updates
//! presence, not lifecycle. Local and companion devices are never swept by
//! staleness, their transports report removal explicitly.

use crate::companion::{CompanionGateway, GatewayEvent};
use crate::device::{Device, DeviceStatus, TransportType};
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::local_probe::{self, HotplugEvent};
use crate::network_probe::{self, ScanOptions};
use crate::onvif;
use crate::secrets::{Credentials, SecretHandle, SecretStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

/// Network/ONVIF devices unseen this long after going provisionally stale
/// are dropped from the table
const STALE_CUTOFF_SECS: i64 = 120;
const ONVIF_DISCOVER_TIMEOUT_MS: u64 = 3000;

/// Discovery cadence and sweep ranges
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Address range for the network sweep; None disables it
    pub scan_range: Option<String>,
    pub discovery_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scan_range: None,
            discovery_interval: Duration::from_secs(300),
        }
    }
}

struct DeviceEntry {
    device: Device,
    /// Set at the start of a discovery cycle, cleared when the device is
    /// seen again. An explicit marker, not a forged timestamp.
    provisionally_stale: bool,
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceEntry>>,
    config: RegistryConfig,
    events: Arc<EventBus>,
    gateway: Arc<CompanionGateway>,
    secrets: Arc<SecretStore>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DeviceRegistry {
    pub fn new(
        config: RegistryConfig,
        events: Arc<EventBus>,
        gateway: Arc<CompanionGateway>,
        secrets: Arc<SecretStore>,
    ) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            config,
            events,
            gateway,
            secrets,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn list(&self) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut list: Vec<Device> = devices.values().map(|e| e.device.clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn get(&self, device_id: &str) -> Result<Device> {
        let devices = self.devices.read().await;
        devices
            .get(device_id)
            .map(|e| e.device.clone())
            .ok_or_else(|| Error::NotFound(format!("Unknown camera: {}", device_id)))
    }

    /// Status transitions are total-ordered under the table's write lock
    pub async fn set_status(&self, device_id: &str, status: DeviceStatus) -> Result<()> {
        {
            let mut devices = self.devices.write().await;
            let entry = devices
                .get_mut(device_id)
                .ok_or_else(|| Error::NotFound(format!("Unknown camera: {}", device_id)))?;
            if entry.device.status == status {
                return Ok(());
            }
            entry.device.status = status;
        }
        self.events
            .publish(CoreEvent::CameraStatusChanged {
                device_id: device_id.to_string(),
                status,
            })
            .await;
        Ok(())
    }

    /// Insert or refresh a device. Existing entries keep their runtime
    /// status and credentials; only presence data is refreshed.
    pub async fn upsert(&self, device: Device) {
        let added = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(&device.id) {
                Some(entry) => {
                    entry.device.name = device.name.clone();
                    entry.device.capabilities = device.capabilities.clone();
                    entry.device.last_seen = Utc::now();
                    entry.provisionally_stale = false;
                    if entry.device.descriptor.credentials().is_none() {
                        entry.device.descriptor = device.descriptor.clone();
                    }
                    false
                }
                None => {
                    let mut device = device.clone();
                    device.last_seen = Utc::now();
                    devices.insert(
                        device.id.clone(),
                        DeviceEntry {
                            device,
                            provisionally_stale: false,
                        },
                    );
                    true
                }
            }
        };

        if added {
            info!(camera_id = %device.id, transport = %device.transport, "Camera added");
            self.events.publish(CoreEvent::CameraAdded { device }).await;
        }
    }

    pub async fn remove(&self, device_id: &str) -> Result<()> {
        let removed = {
            let mut devices = self.devices.write().await;
            devices.remove(device_id)
        };
        let Some(entry) = removed else {
            return Err(Error::NotFound(format!("Unknown camera: {}", device_id)));
        };

        if let Some(handle) = entry.device.descriptor.credentials() {
            self.secrets.revoke(&handle).await;
        }
        info!(camera_id = %device_id, "Camera removed");
        self.events
            .publish(CoreEvent::CameraRemoved {
                device_id: device_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Attach credentials to a device, replacing any existing handle
    pub async fn set_credentials(&self, device_id: &str, credentials: Credentials) -> Result<()> {
        let new_handle = self.secrets.insert(credentials).await;
        let old_handle = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .get_mut(device_id)
                .ok_or_else(|| Error::NotFound(format!("Unknown camera: {}", device_id)))?;
            replace_credentials(&mut entry.device, new_handle)?
        };
        if let Some(old) = old_handle {
            self.secrets.revoke(&old).await;
        }
        info!(camera_id = %device_id, "Credentials updated");
        Ok(())
    }

    /// Register a camera from a user-supplied RTSP URL
    pub async fn add_rtsp_camera(&self, name: &str, url: &str) -> Result<Device> {
        let device = network_probe::add_rtsp_camera(name, url, 3000).await?;
        self.upsert(device.clone()).await;
        Ok(device)
    }

    /// Transport-appropriate reachability check
    pub async fn test_connection(&self, device_id: &str) -> Result<bool> {
        let device = self.get(device_id).await?;
        let ok = match &device.descriptor {
            crate::device::ConnectionDescriptor::Local { system_path } => {
                local_probe::test_camera(system_path).await
            }
            crate::device::ConnectionDescriptor::Rtsp { host, port, .. } => {
                match host.parse() {
                    Ok(ip) => network_probe::rtsp::probe_rtsp(ip, *port, 3000).await,
                    Err(_) => false,
                }
            }
            crate::device::ConnectionDescriptor::Http { host, port, .. } => match host.parse() {
                Ok(ip) => network_probe::http::probe_http_snapshot(ip, *port, 3000)
                    .await
                    .is_some(),
                Err(_) => false,
            },
            crate::device::ConnectionDescriptor::Onvif { service_url, credentials, .. } => {
                let creds = match credentials {
                    Some(h) => self.secrets.resolve(h).await,
                    None => None,
                };
                let caps = onvif::get_capabilities(service_url, creds.as_ref(), 3000).await;
                caps.media_xaddr.is_some()
            }
            crate::device::ConnectionDescriptor::Companion { .. } => {
                self.gateway.ping(device_id).await
            }
        };
        Ok(ok)
    }

    /// One discovery cycle: stale-mark, probe all transports with failure
    /// isolation, upsert, then sweep network/ONVIF devices that stayed
    /// stale past the cutoff.
    pub async fn run_cycle(self: &Arc<Self>) {
        self.mark_provisionally_stale(self.config.scan_range.is_some())
            .await;

        let scan = async {
            match &self.config.scan_range {
                Some(range) => match network_probe::scan(&ScanOptions::for_range(range)).await {
                    Ok(devices) => devices,
                    Err(e) => {
                        warn!(error = %e, "Network sweep failed");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            }
        };
        let onvif_scan = async {
            match onvif::discover(ONVIF_DISCOVER_TIMEOUT_MS).await {
                Ok(devices) => devices,
                Err(e) => {
                    warn!(error = %e, "ONVIF discovery failed");
                    Vec::new()
                }
            }
        };

        let (local, network, onvif_devices) = tokio::join!(local_probe::detect(), scan, onvif_scan);

        let found = local.len() + network.len() + onvif_devices.len();
        for device in local.into_iter().chain(network).chain(onvif_devices) {
            self.upsert(device).await;
        }

        self.sweep_stale().await;
        info!(found = found, "Discovery cycle complete");
    }

    /// Mark sweepable entries stale ahead of a cycle. Only transports a
    /// probe can re-confirm this cycle are marked; with no scan range the
    /// RTSP/HTTP sweep never runs, so those entries must not rot away.
    async fn mark_provisionally_stale(&self, network_probed: bool) {
        let mut devices = self.devices.write().await;
        for entry in devices.values_mut() {
            if !is_sweepable(entry.device.transport) {
                continue;
            }
            let reconfirmable = match entry.device.transport {
                TransportType::Onvif => true,
                _ => network_probed,
            };
            if reconfirmable {
                entry.provisionally_stale = true;
            }
        }
    }

    async fn sweep_stale(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(STALE_CUTOFF_SECS);
        let swept: Vec<String> = {
            let mut devices = self.devices.write().await;
            let ids: Vec<String> = devices
                .iter()
                .filter(|(_, e)| {
                    is_sweepable(e.device.transport)
                        && e.provisionally_stale
                        && e.device.last_seen < cutoff
                        // Discovery never tears down a device in active use
                        && !matches!(
                            e.device.status,
                            DeviceStatus::Streaming | DeviceStatus::Recording
                        )
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                devices.remove(id);
            }
            ids
        };

        for id in swept {
            info!(camera_id = %id, "Camera swept as stale");
            self.events
                .publish(CoreEvent::CameraRemoved { device_id: id })
                .await;
        }
    }

    /// Start the periodic discovery loop plus the companion and hotplug
    /// consumers. Calling again while running is a Conflict.
    pub async fn start_discovery(self: &Arc<Self>) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(Error::Conflict("Discovery already running".into()));
        }

        let registry = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.discovery_interval);
            loop {
                interval.tick().await;
                registry.run_cycle().await;
            }
        }));

        let registry = self.clone();
        let mut gateway_events = self.gateway.subscribe();
        tasks.push(tokio::spawn(async move {
            while let Ok(event) = gateway_events.recv().await {
                registry.handle_gateway_event(event).await;
            }
        }));

        let registry = self.clone();
        let mut core_events = self.events.subscribe();
        tasks.push(tokio::spawn(async move {
            while let Ok(event) = core_events.recv().await {
                registry.handle_core_event(event).await;
            }
        }));

        let registry = self.clone();
        let (hotplug_tx, mut hotplug_rx) = mpsc::channel(16);
        tasks.push(local_probe::start_monitoring(hotplug_tx));
        tasks.push(tokio::spawn(async move {
            while let Some(event) = hotplug_rx.recv().await {
                match event {
                    HotplugEvent::Attached(device) => registry.upsert(device).await,
                    HotplugEvent::Detached(id) => {
                        let _ = registry.remove(&id).await;
                    }
                }
            }
        }));

        info!("Discovery started");
        Ok(())
    }

    /// Stop discovery. Idempotent.
    pub async fn stop_discovery(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Discovery stopped");
    }

    /// A terminal stream failure must show on the device, not only in the
    /// event feed; otherwise a dead camera keeps reporting `streaming`.
    async fn handle_core_event(&self, event: CoreEvent) {
        if let CoreEvent::StreamError { device_id, .. } = event {
            let _ = self.set_status(&device_id, DeviceStatus::Error).await;
        }
    }

    async fn handle_gateway_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::DeviceConnected(device) => self.upsert(device).await,
            GatewayEvent::DeviceDisconnected(id) => {
                let _ = self.remove(&id).await;
            }
            GatewayEvent::CapabilitiesUpdated(id, capabilities) => {
                let mut devices = self.devices.write().await;
                if let Some(entry) = devices.get_mut(&id) {
                    entry.device.capabilities = capabilities;
                    entry.device.last_seen = Utc::now();
                }
            }
            GatewayEvent::StreamStarted(id) => {
                let _ = self.set_status(&id, DeviceStatus::Streaming).await;
            }
            GatewayEvent::StreamStopped(id) => {
                let _ = self.set_status(&id, DeviceStatus::Connected).await;
            }
        }
    }
}

/// Only sweep transports discovered by polling; local and companion
/// removal comes from their own transports
fn is_sweepable(transport: TransportType) -> bool {
    matches!(
        transport,
        TransportType::NetworkRtsp | TransportType::NetworkHttp | TransportType::Onvif
    )
}

fn replace_credentials(device: &mut Device, handle: SecretHandle) -> Result<Option<SecretHandle>> {
    use crate::device::ConnectionDescriptor::*;
    match &mut device.descriptor {
        Rtsp { credentials, .. } | Http { credentials, .. } | Onvif { credentials, .. } => {
            Ok(credentials.replace(handle))
        }
        Local { .. } | Companion { .. } => Err(Error::Validation(format!(
            "{} transport does not take credentials",
            device.transport
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{device_id, ConnectionDescriptor};

    fn registry() -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(
            RegistryConfig::default(),
            Arc::new(EventBus::default()),
            Arc::new(CompanionGateway::new()),
            Arc::new(SecretStore::new()),
        ))
    }

    fn rtsp_device(host: &str) -> Device {
        Device::new(
            device_id(TransportType::NetworkRtsp, &format!("{}:554", host)),
            format!("RTSP Camera {}", host),
            TransportType::NetworkRtsp,
            ConnectionDescriptor::Rtsp {
                host: host.to_string(),
                port: 554,
                path: "/stream1".to_string(),
                credentials: None,
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_preserves_runtime_status() {
        let registry = registry();
        let device = rtsp_device("10.0.0.5");
        registry.upsert(device.clone()).await;
        registry
            .set_status(&device.id, DeviceStatus::Recording)
            .await
            .unwrap();

        // Re-discovery must not reset status
        registry.upsert(rtsp_device("10.0.0.5")).await;
        let stored = registry.get(&device.id).await.unwrap();
        assert_eq!(stored.status, DeviceStatus::Recording);
    }

    #[tokio::test]
    async fn test_upsert_emits_added_once() {
        let registry = registry();
        let mut events = registry.events.subscribe();

        registry.upsert(rtsp_device("10.0.0.6")).await;
        registry.upsert(rtsp_device("10.0.0.6")).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            CoreEvent::CameraAdded { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_sweep_requires_marker_and_cutoff() {
        let registry = registry();
        registry.upsert(rtsp_device("10.0.0.7")).await;
        let id = "rtsp:10.0.0.7:554";

        // Freshly seen: marked stale but within the cutoff, survives
        {
            let mut devices = registry.devices.write().await;
            devices.get_mut(id).unwrap().provisionally_stale = true;
        }
        registry.sweep_stale().await;
        assert!(registry.get(id).await.is_ok());

        // Stale and past the cutoff: swept
        {
            let mut devices = registry.devices.write().await;
            let entry = devices.get_mut(id).unwrap();
            entry.provisionally_stale = true;
            entry.device.last_seen = Utc::now() - chrono::Duration::seconds(STALE_CUTOFF_SECS + 10);
        }
        registry.sweep_stale().await;
        assert!(registry.get(id).await.is_err());
    }

    #[tokio::test]
    async fn test_rtsp_not_marked_without_network_sweep() {
        let registry = registry();
        registry.upsert(rtsp_device("10.0.0.9")).await;
        let id = "rtsp:10.0.0.9:554";

        // No scan range: nothing can re-confirm the device, so it is
        // not put on the chopping block
        registry.mark_provisionally_stale(false).await;
        {
            let devices = registry.devices.read().await;
            assert!(!devices.get(id).unwrap().provisionally_stale);
        }

        registry.mark_provisionally_stale(true).await;
        let devices = registry.devices.read().await;
        assert!(devices.get(id).unwrap().provisionally_stale);
    }

    #[tokio::test]
    async fn test_streaming_device_never_swept() {
        let registry = registry();
        registry.upsert(rtsp_device("10.0.0.10")).await;
        let id = "rtsp:10.0.0.10:554";
        registry
            .set_status(id, DeviceStatus::Streaming)
            .await
            .unwrap();
        {
            let mut devices = registry.devices.write().await;
            let entry = devices.get_mut(id).unwrap();
            entry.provisionally_stale = true;
            entry.device.last_seen =
                Utc::now() - chrono::Duration::seconds(STALE_CUTOFF_SECS + 60);
        }
        registry.sweep_stale().await;
        assert!(registry.get(id).await.is_ok());

        // Once idle again the same entry is sweepable
        registry
            .set_status(id, DeviceStatus::Connected)
            .await
            .unwrap();
        registry.sweep_stale().await;
        assert!(registry.get(id).await.is_err());
    }

    #[tokio::test]
    async fn test_local_devices_never_swept() {
        let registry = registry();
        let device = Device::new(
            "local:video0".to_string(),
            "Webcam".to_string(),
            TransportType::Local,
            ConnectionDescriptor::Local {
                system_path: "/dev/video0".to_string(),
            },
        );
        registry.upsert(device).await;

        {
            let mut devices = registry.devices.write().await;
            let entry = devices.get_mut("local:video0").unwrap();
            entry.device.last_seen = Utc::now() - chrono::Duration::seconds(3600);
        }
        registry.sweep_stale().await;
        assert!(registry.get("local:video0").await.is_ok());
    }

    #[tokio::test]
    async fn test_set_credentials_rejects_local() {
        let registry = registry();
        let device = Device::new(
            "local:video0".to_string(),
            "Webcam".to_string(),
            TransportType::Local,
            ConnectionDescriptor::Local {
                system_path: "/dev/video0".to_string(),
            },
        );
        registry.upsert(device).await;

        let err = registry
            .set_credentials(
                "local:video0",
                Credentials {
                    username: "a".to_string(),
                    password: "b".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_stream_error_marks_device() {
        let registry = registry();
        registry.upsert(rtsp_device("10.0.0.11")).await;
        let id = "rtsp:10.0.0.11:554";
        registry
            .set_status(id, DeviceStatus::Streaming)
            .await
            .unwrap();

        registry
            .handle_core_event(CoreEvent::StreamError {
                device_id: id.to_string(),
                message: "pipeline died".to_string(),
            })
            .await;
        assert_eq!(registry.get(id).await.unwrap().status, DeviceStatus::Error);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let registry = registry();
        assert!(matches!(
            registry.remove("rtsp:ghost:554").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_status_change_emits_event() {
        let registry = registry();
        registry.upsert(rtsp_device("10.0.0.8")).await;
        let mut events = registry.events.subscribe();

        registry
            .set_status("rtsp:10.0.0.8:554", DeviceStatus::Streaming)
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            CoreEvent::CameraStatusChanged { device_id, status } => {
                assert_eq!(device_id, "rtsp:10.0.0.8:554");
                assert_eq!(status, DeviceStatus::Streaming);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
