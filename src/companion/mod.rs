//! CompanionGateway - inbound mobile-device camera connections
//!
//! ## Responsibilities
//! - Accept companion WebSocket sessions and keep per-connection senders
//! - Track the device-id to connection mapping for registered devices
//! - Forward base64 frame payloads to stream taps while streaming
//! - Liveness pings raced against a timeout
//!
//! The gateway never touches the registry directly; it emits
//! [`GatewayEvent`]s that the registry consumes.

pub mod messages;

use crate::device::{device_id, ConnectionDescriptor, Device, DeviceCapabilities, TransportType};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use self::messages::{CompanionDeviceInfo, CompanionMessage};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

const PING_TIMEOUT_SECS: u64 = 5;

/// Gateway lifecycle events consumed by the registry
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    DeviceConnected(Device),
    DeviceDisconnected(String),
    CapabilitiesUpdated(String, DeviceCapabilities),
    StreamStarted(String),
    StreamStopped(String),
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<String>,
    device_id: Option<String>,
    streaming: bool,
}

/// Hub for companion device sessions
pub struct CompanionGateway {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
    by_device: RwLock<HashMap<String, Uuid>>,
    /// Frame sinks per streaming device
    taps: RwLock<HashMap<String, mpsc::Sender<Bytes>>>,
    pending_pings: Mutex<HashMap<String, oneshot::Sender<()>>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl CompanionGateway {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connections: RwLock::new(HashMap::new()),
            by_device: RwLock::new(HashMap::new()),
            taps: RwLock::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Drive one WebSocket session to completion
    pub async fn handle_socket(&self, socket: WebSocket) {
        let conn_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        {
            let mut connections = self.connections.write().await;
            connections.insert(
                conn_id,
                ConnectionEntry {
                    tx,
                    device_id: None,
                    streaming: false,
                },
            );
        }
        info!(connection_id = %conn_id, "Companion connected");

        let (mut sender, mut receiver) = socket.split();

        let mut send_task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_message(conn_id, &text).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(connection_id = %conn_id, error = %e, "Companion socket error");
                            break;
                        }
                    }
                }
                _ = &mut send_task => break,
            }
        }

        send_task.abort();
        self.cleanup(conn_id).await;
    }

    async fn handle_message(&self, conn_id: Uuid, text: &str) {
        let msg: CompanionMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(connection_id = %conn_id, error = %e, "Malformed companion message");
                return;
            }
        };

        match msg {
            CompanionMessage::Handshake { version } => {
                debug!(connection_id = %conn_id, version = %version, "Companion handshake");
                self.send_to_connection(
                    conn_id,
                    &CompanionMessage::HandshakeAck {
                        session_id: conn_id.to_string(),
                    },
                )
                .await;
            }
            CompanionMessage::Register { device_id: raw_id, device_info } => {
                self.register_device(conn_id, raw_id, device_info).await;
            }
            CompanionMessage::Capabilities { capabilities } => {
                if let Some(id) = self.device_for_connection(conn_id).await {
                    let _ = self
                        .events
                        .send(GatewayEvent::CapabilitiesUpdated(id, capabilities));
                }
            }
            CompanionMessage::StreamStart => {
                if let Some(id) = self.device_for_connection(conn_id).await {
                    if self.mark_streaming(&id, true).await {
                        info!(camera_id = %id, "Companion started streaming");
                        let _ = self.events.send(GatewayEvent::StreamStarted(id));
                    }
                }
            }
            CompanionMessage::StreamData { data } => {
                self.forward_frame(conn_id, &data).await;
            }
            CompanionMessage::StreamStop => {
                if let Some(id) = self.device_for_connection(conn_id).await {
                    if self.mark_streaming(&id, false).await {
                        info!(camera_id = %id, "Companion stopped streaming");
                        let _ = self.events.send(GatewayEvent::StreamStopped(id));
                    }
                }
            }
            CompanionMessage::Ping => {
                self.send_to_connection(conn_id, &CompanionMessage::Pong).await;
            }
            CompanionMessage::Pong => {
                if let Some(id) = self.device_for_connection(conn_id).await {
                    if let Some(waiter) = self.pending_pings.lock().await.remove(&id) {
                        let _ = waiter.send(());
                    }
                }
            }
            CompanionMessage::Status { battery_percent, message } => {
                if let Some(id) = self.device_for_connection(conn_id).await {
                    debug!(
                        camera_id = %id,
                        battery = ?battery_percent,
                        message = ?message,
                        "Companion status"
                    );
                }
            }
            // Server-to-device replies echoed back, or future message types
            _ => {}
        }
    }

    async fn register_device(&self, conn_id: Uuid, raw_id: String, info: CompanionDeviceInfo) {
        let id = device_id(TransportType::Companion, &raw_id);
        {
            let mut connections = self.connections.write().await;
            if let Some(entry) = connections.get_mut(&conn_id) {
                entry.device_id = Some(id.clone());
            }
        }
        self.by_device.write().await.insert(id.clone(), conn_id);

        info!(camera_id = %id, name = %info.name, "Companion device registered");
        let device = Device::new(
            id,
            info.name,
            TransportType::Companion,
            ConnectionDescriptor::Companion {
                remote_addr: conn_id.to_string(),
            },
        );
        let _ = self.events.send(GatewayEvent::DeviceConnected(device));
    }

    /// Decode and forward a frame to the device's tap.
    /// Frames arriving while no stream is active are dropped silently.
    async fn forward_frame(&self, conn_id: Uuid, data: &str) {
        let device_id = {
            let connections = self.connections.read().await;
            match connections.get(&conn_id) {
                Some(entry) if entry.streaming => entry.device_id.clone(),
                _ => return,
            }
        };
        let Some(device_id) = device_id else { return };

        let decoded = match base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            data,
        ) {
            Ok(d) => d,
            Err(e) => {
                debug!(camera_id = %device_id, error = %e, "Bad frame payload");
                return;
            }
        };

        let taps = self.taps.read().await;
        if let Some(tap) = taps.get(&device_id) {
            // Back-pressure: drop the frame when the tap is full
            let _ = tap.try_send(Bytes::from(decoded));
        }
    }

    async fn cleanup(&self, conn_id: Uuid) {
        let device_id = {
            let mut connections = self.connections.write().await;
            connections.remove(&conn_id).and_then(|e| e.device_id)
        };

        if let Some(id) = device_id {
            self.by_device.write().await.remove(&id);
            self.taps.write().await.remove(&id);
            self.pending_pings.lock().await.remove(&id);
            info!(camera_id = %id, "Companion device disconnected");
            let _ = self.events.send(GatewayEvent::DeviceDisconnected(id));
        } else {
            info!(connection_id = %conn_id, "Companion disconnected before registering");
        }
    }

    async fn device_for_connection(&self, conn_id: Uuid) -> Option<String> {
        let connections = self.connections.read().await;
        connections.get(&conn_id).and_then(|e| e.device_id.clone())
    }

    async fn send_to_connection(&self, conn_id: Uuid, msg: &CompanionMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "Failed to serialize companion message");
                return;
            }
        };
        let connections = self.connections.read().await;
        if let Some(entry) = connections.get(&conn_id) {
            let _ = entry.tx.send(json);
        }
    }

    /// Best-effort command to a registered device
    pub async fn send_command(&self, device_id: &str, msg: &CompanionMessage) -> bool {
        let conn_id = {
            let by_device = self.by_device.read().await;
            match by_device.get(device_id) {
                Some(id) => *id,
                None => return false,
            }
        };
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(_) => return false,
        };
        let connections = self.connections.read().await;
        match connections.get(&conn_id) {
            Some(entry) => entry.tx.send(json).is_ok(),
            None => false,
        }
    }

    /// Attach a frame tap and ask the device to start streaming
    pub async fn start_stream(&self, device_id: &str, tap: mpsc::Sender<Bytes>) -> bool {
        if !self.mark_streaming(device_id, true).await {
            return false;
        }
        self.taps.write().await.insert(device_id.to_string(), tap);
        if !self.send_command(device_id, &CompanionMessage::StreamStart).await {
            self.taps.write().await.remove(device_id);
            self.mark_streaming(device_id, false).await;
            return false;
        }
        let _ = self
            .events
            .send(GatewayEvent::StreamStarted(device_id.to_string()));
        true
    }

    /// Stop streaming and drop the tap. Idempotent.
    pub async fn stop_stream(&self, device_id: &str) {
        let was_streaming = self.mark_streaming(device_id, false).await;
        self.taps.write().await.remove(device_id);
        if was_streaming {
            self.send_command(device_id, &CompanionMessage::StreamStop).await;
            let _ = self
                .events
                .send(GatewayEvent::StreamStopped(device_id.to_string()));
        }
    }

    async fn mark_streaming(&self, device_id: &str, streaming: bool) -> bool {
        let conn_id = {
            let by_device = self.by_device.read().await;
            match by_device.get(device_id) {
                Some(id) => *id,
                None => return false,
            }
        };
        let mut connections = self.connections.write().await;
        match connections.get_mut(&conn_id) {
            Some(entry) => {
                entry.streaming = streaming;
                true
            }
            None => false,
        }
    }

    /// Liveness check: Ping raced against a fixed timeout
    pub async fn ping(&self, device_id: &str) -> bool {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending_pings
            .lock()
            .await
            .insert(device_id.to_string(), waiter_tx);

        if !self.send_command(device_id, &CompanionMessage::Ping).await {
            self.pending_pings.lock().await.remove(device_id);
            return false;
        }

        let alive = tokio::time::timeout(Duration::from_secs(PING_TIMEOUT_SECS), waiter_rx)
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        if !alive {
            self.pending_pings.lock().await.remove(device_id);
        }
        alive
    }

    pub async fn connected_device_ids(&self) -> Vec<String> {
        self.by_device.read().await.keys().cloned().collect()
    }
}

impl Default for CompanionGateway {
    fn default() -> Self {
        Self::new()
    }
}
