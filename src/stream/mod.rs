//! StreamCoordinator - per-device live pipelines
//!
//! ## Responsibilities
//! - One pipeline per device; duplicate starts are rejected, not merged
//! - Transport dispatch: V4L2 capture, RTSP/ONVIF pull, HTTP snapshot
//!   polling, companion frame taps
//! - Pause as forwarding suppression; the source keeps producing
//! - Bounded restart on pipeline failure per [`pipeline::RestartPolicy`]
//!
//! Chunks fan out over a broadcast channel; the recording coordinator and
//! any live viewers subscribe to the same feed.

pub mod pipeline;
pub mod session;

use crate::companion::CompanionGateway;
use crate::device::{ConnectionDescriptor, Device, TransportType};
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::onvif;
use crate::secrets::{Credentials, SecretStore};
use bytes::Bytes;
use self::pipeline::RestartPolicy;
use self::session::{BitrateWindow, ChunkRing, StreamConfig, StreamState, StreamStats};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Byte budget for each session's replay ring
const RING_MAX_BYTES: usize = 8 * 1024 * 1024;
/// Read size for pipeline stdout
const CHUNK_SIZE: usize = 32 * 1024;
const SOAP_TIMEOUT_MS: u64 = 5000;

struct SessionHandle {
    session_id: Uuid,
    config: StreamConfig,
    state: Arc<RwLock<StreamState>>,
    paused: Arc<AtomicBool>,
    chunks: broadcast::Sender<Bytes>,
    ring: Arc<Mutex<ChunkRing>>,
    stats: Arc<Mutex<StreamStats>>,
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Everything a pipeline task needs, detached from the coordinator
#[derive(Clone)]
struct PipelineCtx {
    device: Device,
    session_id: Uuid,
    config: StreamConfig,
    paused: Arc<AtomicBool>,
    chunks: broadcast::Sender<Bytes>,
    ring: Arc<Mutex<ChunkRing>>,
    stats: Arc<Mutex<StreamStats>>,
    state: Arc<RwLock<StreamState>>,
    stop_rx: watch::Receiver<bool>,
    secrets: Arc<SecretStore>,
    gateway: Arc<CompanionGateway>,
    events: Arc<EventBus>,
    restart_policy: RestartPolicy,
    /// Back-reference for self-removal on terminal failure
    sessions: Weak<RwLock<HashMap<String, SessionHandle>>>,
}

pub struct StreamCoordinator {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    secrets: Arc<SecretStore>,
    gateway: Arc<CompanionGateway>,
    events: Arc<EventBus>,
    restart_policy: RestartPolicy,
}

impl StreamCoordinator {
    pub fn new(
        secrets: Arc<SecretStore>,
        gateway: Arc<CompanionGateway>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            secrets,
            gateway,
            events,
            restart_policy: RestartPolicy::default(),
        }
    }

    /// Start a live pipeline for a device.
    ///
    /// A second start for the same device is a [`Error::Conflict`];
    /// callers stop the existing session first if they want new parameters.
    pub async fn start(&self, device: &Device, config: StreamConfig) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&device.id) {
            return Err(Error::Conflict(format!(
                "Stream already active for {}",
                device.id
            )));
        }

        let session_id = Uuid::new_v4();
        let state = Arc::new(RwLock::new(StreamState::Starting));
        let paused = Arc::new(AtomicBool::new(false));
        let (chunks, _) = broadcast::channel(256);
        let ring = Arc::new(Mutex::new(ChunkRing::new(RING_MAX_BYTES)));
        let stats = Arc::new(Mutex::new(StreamStats::default()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = PipelineCtx {
            device: device.clone(),
            session_id,
            config: config.clone(),
            paused: paused.clone(),
            chunks: chunks.clone(),
            ring: ring.clone(),
            stats: stats.clone(),
            state: state.clone(),
            stop_rx,
            secrets: self.secrets.clone(),
            gateway: self.gateway.clone(),
            events: self.events.clone(),
            restart_policy: self.restart_policy,
            sessions: Arc::downgrade(&self.sessions),
        };

        let task = tokio::spawn(run_session(ctx));

        sessions.insert(
            device.id.clone(),
            SessionHandle {
                session_id,
                config,
                state,
                paused,
                chunks,
                ring,
                stats,
                stop_tx,
                task,
            },
        );
        drop(sessions);

        info!(camera_id = %device.id, "Stream session started");
        self.events
            .publish(CoreEvent::StreamStarted {
                device_id: device.id.clone(),
            })
            .await;
        Ok(())
    }

    /// Stop a session. Idempotent: stopping an unknown device is a no-op.
    pub async fn stop(&self, device_id: &str) -> Result<()> {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(device_id)
        };
        let Some(handle) = handle else {
            debug!(camera_id = %device_id, "Stop for inactive stream, ignoring");
            return Ok(());
        };

        let _ = handle.stop_tx.send(true);
        // Give the pipeline a moment to exit cleanly, then abort
        let abort = handle.task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(3), handle.task)
            .await
            .is_err()
        {
            warn!(camera_id = %device_id, "Pipeline did not exit in time, aborting");
            abort.abort();
        }
        *handle.state.write().await = StreamState::Stopped;

        if matches!(transport_of(device_id), Some(TransportType::Companion)) {
            self.gateway.stop_stream(device_id).await;
        }

        info!(camera_id = %device_id, "Stream session stopped");
        self.events
            .publish(CoreEvent::StreamStopped {
                device_id: device_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Suppress chunk forwarding without touching the source
    pub async fn pause(&self, device_id: &str) -> Result<()> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("No active stream for {}", device_id)))?;
        handle.paused.store(true, Ordering::SeqCst);
        *handle.state.write().await = StreamState::Paused;
        info!(camera_id = %device_id, "Stream paused");
        Ok(())
    }

    pub async fn resume(&self, device_id: &str) -> Result<()> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("No active stream for {}", device_id)))?;
        handle.paused.store(false, Ordering::SeqCst);
        *handle.state.write().await = StreamState::Active;
        info!(camera_id = %device_id, "Stream resumed");
        Ok(())
    }

    /// Tear down and relaunch with the session's last config
    pub async fn restart(&self, device: &Device) -> Result<()> {
        let config = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&device.id)
                .map(|h| h.config.clone())
                .unwrap_or_default()
        };
        self.stop(&device.id).await?;
        self.start(device, config).await
    }

    /// Subscribe to a session's chunk feed
    pub async fn subscribe_chunks(&self, device_id: &str) -> Result<broadcast::Receiver<Bytes>> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("No active stream for {}", device_id)))?;
        Ok(handle.chunks.subscribe())
    }

    /// Recent buffered chunks for late joiners
    pub async fn recent_chunks(&self, device_id: &str) -> Result<Vec<Bytes>> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("No active stream for {}", device_id)))?;
        let ring = handle.ring.lock().await;
        Ok(ring.snapshot())
    }

    pub async fn state(&self, device_id: &str) -> Option<StreamState> {
        let sessions = self.sessions.read().await;
        match sessions.get(device_id) {
            Some(handle) => Some(*handle.state.read().await),
            None => None,
        }
    }

    pub async fn stats(&self, device_id: &str) -> Option<StreamStats> {
        let sessions = self.sessions.read().await;
        match sessions.get(device_id) {
            Some(handle) => Some(handle.stats.lock().await.clone()),
            None => None,
        }
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn is_active(&self, device_id: &str) -> bool {
        self.sessions.read().await.contains_key(device_id)
    }
}

fn transport_of(device_id: &str) -> Option<TransportType> {
    match device_id.split(':').next()? {
        "local" => Some(TransportType::Local),
        "rtsp" => Some(TransportType::NetworkRtsp),
        "http" => Some(TransportType::NetworkHttp),
        "onvif" => Some(TransportType::Onvif),
        "companion" => Some(TransportType::Companion),
        _ => None,
    }
}

/// Session task: run the pipeline, restarting per policy on failure.
///
/// Exhausting the policy is terminal: the session removes its own table
/// entry so the device returns to idle, chunk subscribers observe channel
/// closure, and a [`CoreEvent::StreamError`] goes out for the registry.
async fn run_session(ctx: PipelineCtx) {
    let mut attempts = 0u32;
    loop {
        *ctx.state.write().await = StreamState::Active;
        let result = run_pipeline_once(&ctx).await;

        if *ctx.stop_rx.borrow() {
            return;
        }

        let reason = match result {
            Ok(()) => "pipeline ended unexpectedly".to_string(),
            Err(e) => e.to_string(),
        };
        warn!(camera_id = %ctx.device.id, reason = %reason, attempts = attempts, "Stream pipeline failed");

        if attempts >= ctx.restart_policy.max_attempts {
            *ctx.state.write().await = StreamState::Error;
            ctx.events
                .publish(CoreEvent::StreamError {
                    device_id: ctx.device.id.clone(),
                    message: reason,
                })
                .await;
            remove_own_session(&ctx).await;
            return;
        }
        attempts += 1;

        let mut stop_rx = ctx.stop_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(ctx.restart_policy.delay) => {}
            _ = stop_rx.changed() => return,
        }
    }
}

/// Drop the dead session's entry unless a concurrent stop or restart
/// already replaced it. The task's own ctx holds the last chunk sender,
/// so subscribers see `Closed` as soon as the task finishes.
async fn remove_own_session(ctx: &PipelineCtx) {
    let Some(sessions) = ctx.sessions.upgrade() else {
        return;
    };
    let mut sessions = sessions.write().await;
    let ours = sessions
        .get(&ctx.device.id)
        .map(|h| h.session_id == ctx.session_id)
        .unwrap_or(false);
    if ours {
        sessions.remove(&ctx.device.id);
        debug!(camera_id = %ctx.device.id, "Failed session cleared");
    }
}

async fn run_pipeline_once(ctx: &PipelineCtx) -> Result<()> {
    match &ctx.device.descriptor {
        ConnectionDescriptor::Local { system_path } => {
            let (resolution, frame_rate) =
                pipeline::select_output(&ctx.config, &ctx.device.capabilities.resolutions);
            let args = pipeline::local_pipeline_args(system_path, resolution, frame_rate);
            run_ffmpeg(ctx, args).await
        }
        ConnectionDescriptor::Rtsp {
            host,
            port,
            path,
            credentials,
        } => {
            let creds = resolve_credentials(ctx, credentials.as_ref()).await;
            let url = compose_rtsp_url(host, *port, path, creds.as_ref());
            run_ffmpeg(ctx, pipeline::network_pipeline_args(&url)).await
        }
        ConnectionDescriptor::Onvif {
            service_url,
            credentials,
            ..
        } => {
            let creds = resolve_credentials(ctx, credentials.as_ref()).await;
            let caps =
                onvif::get_capabilities(service_url, creds.as_ref(), SOAP_TIMEOUT_MS).await;
            let media_url = caps.media_xaddr.unwrap_or_else(|| service_url.clone());
            let profiles = onvif::get_profiles(&media_url, creds.as_ref(), SOAP_TIMEOUT_MS).await?;
            let uri = onvif::get_stream_uri(
                &media_url,
                &profiles[0].token,
                creds.as_ref(),
                SOAP_TIMEOUT_MS,
            )
            .await?;
            run_ffmpeg(ctx, pipeline::network_pipeline_args(&uri)).await
        }
        ConnectionDescriptor::Http {
            host,
            port,
            snapshot_path,
            credentials,
        } => {
            let path = snapshot_path.clone().unwrap_or_else(|| "/snapshot.jpg".to_string());
            let creds = resolve_credentials(ctx, credentials.as_ref()).await;
            run_snapshot_poll(ctx, host, *port, &path, creds.as_ref()).await
        }
        ConnectionDescriptor::Companion { .. } => run_companion_tap(ctx).await,
    }
}

async fn resolve_credentials(
    ctx: &PipelineCtx,
    handle: Option<&crate::secrets::SecretHandle>,
) -> Option<Credentials> {
    match handle {
        Some(h) => ctx.secrets.resolve(h).await,
        None => None,
    }
}

/// Compose an RTSP URL, splicing credentials into the authority.
/// The result is for pipeline arguments only and is never logged.
fn compose_rtsp_url(host: &str, port: u16, path: &str, creds: Option<&Credentials>) -> String {
    match creds {
        Some(c) => format!("rtsp://{}:{}@{}:{}{}", c.username, c.password, host, port, path),
        None => format!("rtsp://{}:{}{}", host, port, path),
    }
}

/// Spawn ffmpeg and pump stdout chunks into the session feed
async fn run_ffmpeg(ctx: &PipelineCtx, args: Vec<String>) -> Result<()> {
    let mut child = Command::new("ffmpeg")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Pipeline(format!("Failed to spawn ffmpeg: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Pipeline("No stdout from pipeline".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Pipeline("No stderr from pipeline".into()))?;

    // Progress lines go to stderr; scrape fps/bitrate for stats
    let stats = ctx.stats.clone();
    let progress_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(progress) = pipeline::parse_progress(&line) {
                let mut stats = stats.lock().await;
                if let Some(fps) = progress.fps {
                    stats.fps = fps;
                }
                if let Some(kbps) = progress.bitrate_kbps {
                    stats.bitrate_kbps = kbps;
                }
            }
        }
    });

    let mut reader = stdout;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bitrate = BitrateWindow::new(Duration::from_secs(5));
    let mut stop_rx = ctx.stop_rx.clone();

    let result = loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        deliver_chunk(ctx, chunk, &mut bitrate).await;
                    }
                    Err(e) => break Err(Error::Pipeline(format!("Pipeline read failed: {}", e))),
                }
            }
            _ = stop_rx.changed() => {
                break Ok(());
            }
        }
    };

    progress_task.abort();
    let _ = child.kill().await;
    result
}

/// HTTP snapshot devices stream by polling the still endpoint
async fn run_snapshot_poll(
    ctx: &PipelineCtx,
    host: &str,
    port: u16,
    path: &str,
    creds: Option<&Credentials>,
) -> Result<()> {
    let url = format!("http://{}:{}{}", host, port, path);
    let frame_rate = ctx.config.frame_rate.unwrap_or(2).clamp(1, 10);
    let mut interval = tokio::time::interval(Duration::from_millis(1000 / frame_rate as u64));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let mut bitrate = BitrateWindow::new(Duration::from_secs(5));
    let mut stop_rx = ctx.stop_rx.clone();
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let mut request = client.get(&url);
                if let Some(c) = creds {
                    request = request.basic_auth(&c.username, Some(&c.password));
                }
                match request.send().await {
                    Ok(resp) if resp.status().is_success() => {
                        consecutive_failures = 0;
                        if let Ok(body) = resp.bytes().await {
                            deliver_chunk(ctx, body, &mut bitrate).await;
                        }
                    }
                    _ => {
                        consecutive_failures += 1;
                        if consecutive_failures >= 5 {
                            return Err(Error::Transport(format!(
                                "Snapshot endpoint unreachable at {}:{}",
                                host, port
                            )));
                        }
                    }
                }
            }
            _ = stop_rx.changed() => return Ok(()),
        }
    }
}

/// Companion devices push frames through a gateway tap
async fn run_companion_tap(ctx: &PipelineCtx) -> Result<()> {
    let (tap_tx, mut tap_rx) = mpsc::channel::<Bytes>(64);
    if !ctx.gateway.start_stream(&ctx.device.id, tap_tx).await {
        return Err(Error::Transport(format!(
            "Companion device {} not connected",
            ctx.device.id
        )));
    }

    let mut bitrate = BitrateWindow::new(Duration::from_secs(5));
    let mut stop_rx = ctx.stop_rx.clone();

    let result = loop {
        tokio::select! {
            frame = tap_rx.recv() => {
                match frame {
                    Some(chunk) => deliver_chunk(ctx, chunk, &mut bitrate).await,
                    None => break Err(Error::Transport("Companion stream closed".into())),
                }
            }
            _ = stop_rx.changed() => break Ok(()),
        }
    };

    ctx.gateway.stop_stream(&ctx.device.id).await;
    result
}

async fn deliver_chunk(ctx: &PipelineCtx, chunk: Bytes, bitrate: &mut BitrateWindow) {
    bitrate.record(chunk.len());
    {
        let mut stats = ctx.stats.lock().await;
        stats.packets += 1;
        stats.bytes_total += chunk.len() as u64;
        stats.bitrate_kbps = bitrate.kbps();
    }

    // Paused sessions keep consuming but forward nothing
    if ctx.paused.load(Ordering::SeqCst) {
        return;
    }

    {
        let mut ring = ctx.ring.lock().await;
        ring.push(chunk.clone());
        let mut stats = ctx.stats.lock().await;
        stats.buffer_level = ring.bytes();
    }
    let _ = ctx.chunks.send(chunk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{device_id, Device};

    fn companion_device(raw: &str) -> Device {
        Device::new(
            device_id(TransportType::Companion, raw),
            "Phone".to_string(),
            TransportType::Companion,
            ConnectionDescriptor::Companion {
                remote_addr: "test".to_string(),
            },
        )
    }

    fn coordinator() -> StreamCoordinator {
        StreamCoordinator::new(
            Arc::new(SecretStore::new()),
            Arc::new(CompanionGateway::new()),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn test_duplicate_start_is_conflict() {
        let coordinator = coordinator();
        let device = companion_device("phone-1");

        coordinator
            .start(&device, StreamConfig::default())
            .await
            .unwrap();
        let err = coordinator
            .start(&device, StreamConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        coordinator.stop(&device.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_session_clears_and_allows_restart() {
        let mut coordinator = coordinator();
        coordinator.restart_policy = RestartPolicy {
            max_attempts: 0,
            delay: Duration::from_millis(10),
        };
        // Companion device with no live connection: the tap fails at once
        let device = companion_device("phone-dead");

        coordinator
            .start(&device, StreamConfig::default())
            .await
            .unwrap();
        let subscription = coordinator.subscribe_chunks(&device.id).await;

        // The exhausted session must clear its own entry
        for _ in 0..50 {
            if !coordinator.is_active(&device.id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!coordinator.is_active(&device.id).await);

        // Subscribers observe closure rather than hanging forever
        if let Ok(mut rx) = subscription {
            assert!(matches!(
                rx.recv().await,
                Err(broadcast::error::RecvError::Closed)
            ));
        }

        // The device is back to idle: a fresh start is accepted
        coordinator
            .start(&device, StreamConfig::default())
            .await
            .unwrap();
        coordinator.stop(&device.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let coordinator = coordinator();
        assert!(coordinator.stop("companion:ghost").await.is_ok());
        assert!(coordinator.stop("companion:ghost").await.is_ok());
    }

    #[tokio::test]
    async fn test_pause_requires_active_session() {
        let coordinator = coordinator();
        let err = coordinator.pause("local:video0").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_compose_rtsp_url() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: "pw".to_string(),
        };
        assert_eq!(
            compose_rtsp_url("192.168.1.10", 554, "/stream1", Some(&creds)),
            "rtsp://admin:pw@192.168.1.10:554/stream1"
        );
        assert_eq!(
            compose_rtsp_url("192.168.1.10", 8554, "/live", None),
            "rtsp://192.168.1.10:8554/live"
        );
    }

    #[test]
    fn test_transport_of() {
        assert_eq!(transport_of("rtsp:10.0.0.2:554"), Some(TransportType::NetworkRtsp));
        assert_eq!(transport_of("companion:phone-1"), Some(TransportType::Companion));
        assert_eq!(transport_of("bogus"), None);
    }
}
