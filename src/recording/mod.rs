//! RecordingCoordinator - rotation-aware persistent capture
//!
//! ## Responsibilities
//! - One recording per device, capped at a configured concurrent total
//! - Storage preflight before any file is opened
//! - Segment rotation by size (in the writer) and by wall-clock duration
//! - Single bounded recovery when the source stream dies mid-recording
//! - Stop resolves only after buffers are flushed to disk

pub mod writer;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::storage::StorageManager;
use crate::stream::session::StreamConfig;
use crate::stream::StreamCoordinator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;
use self::writer::{RecordingFile, SegmentWriter};

const RECOVERY_DELAY: Duration = Duration::from_secs(2);
const STATS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Recording,
    Paused,
    Stopped,
    Error,
}

/// Recording parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Container format / file extension
    pub format: String,
    /// Per-file byte ceiling
    pub max_file_size: u64,
    /// Wall-clock rotation period
    pub segment_duration_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            format: "ts".to_string(),
            max_file_size: 512 * 1024 * 1024,
            segment_duration_secs: 600,
        }
    }
}

/// Cumulative statistics for a recording session
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordingStats {
    pub total_frames: u64,
    /// Chunks lost to broadcast lag or pause
    pub dropped_frames: u64,
    pub total_bytes: u64,
    pub average_fps: f64,
    pub average_bitrate_kbps: f64,
}

struct RecordingHandle {
    session_id: Uuid,
    state: Arc<RwLock<RecordingState>>,
    paused: Arc<AtomicBool>,
    stats: Arc<Mutex<RecordingStats>>,
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<Vec<RecordingFile>>,
}

/// Public view of an active recording
#[derive(Debug, Clone, Serialize)]
pub struct RecordingInfo {
    pub device_id: String,
    pub session_id: Uuid,
    pub state: RecordingState,
    pub stats: RecordingStats,
}

pub struct RecordingCoordinator {
    sessions: RwLock<HashMap<String, RecordingHandle>>,
    streams: Arc<StreamCoordinator>,
    storage: Arc<StorageManager>,
    events: Arc<EventBus>,
    max_concurrent: usize,
}

impl RecordingCoordinator {
    pub fn new(
        streams: Arc<StreamCoordinator>,
        storage: Arc<StorageManager>,
        events: Arc<EventBus>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            streams,
            storage,
            events,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Start recording a device.
    ///
    /// Requires (or starts) a live stream for the device. Rejected with
    /// Conflict when already recording, OverCapacity at the concurrent cap,
    /// and InsufficientStorage when the preflight fails.
    pub async fn start(&self, device: &Device, config: RecordingConfig) -> Result<Uuid> {
        // One critical section covers check and insert, so racing starts
        // cannot both pass the duplicate or capacity gate
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&device.id) {
            return Err(Error::Conflict(format!("{} is already recording", device.id)));
        }
        if sessions.len() >= self.max_concurrent {
            return Err(Error::OverCapacity(format!(
                "Concurrent recording cap of {} reached",
                self.max_concurrent
            )));
        }

        self.storage.preflight().await?;

        let auto_started = !self.streams.is_active(&device.id).await;
        if auto_started {
            self.streams.start(device, StreamConfig::default()).await?;
        }
        let chunks = match self.streams.subscribe_chunks(&device.id).await {
            Ok(rx) => rx,
            Err(e) => {
                if auto_started {
                    let _ = self.streams.stop(&device.id).await;
                }
                return Err(e);
            }
        };

        let session_id = Uuid::new_v4();
        let state = Arc::new(RwLock::new(RecordingState::Recording));
        let paused = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(RecordingStats::default()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run_recording(RecordingCtx {
            device: device.clone(),
            config,
            session_id,
            state: state.clone(),
            paused: paused.clone(),
            stats: stats.clone(),
            stop_rx,
            chunks,
            streams: self.streams.clone(),
            storage: self.storage.clone(),
            events: self.events.clone(),
        }));

        sessions.insert(
            device.id.clone(),
            RecordingHandle {
                session_id,
                state,
                paused,
                stats,
                stop_tx,
                task,
            },
        );
        drop(sessions);

        info!(camera_id = %device.id, session_id = %session_id, "Recording started");
        self.events
            .publish(CoreEvent::RecordingStarted {
                device_id: device.id.clone(),
                session_id,
            })
            .await;
        Ok(session_id)
    }

    /// Stop a recording, resolving only after the writer has flushed.
    /// Idempotent: an inactive device yields an empty file list.
    pub async fn stop(&self, device_id: &str) -> Result<Vec<RecordingFile>> {
        let handle = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(device_id)
        };
        let Some(handle) = handle else {
            return Ok(Vec::new());
        };

        let _ = handle.stop_tx.send(true);
        let files = handle.task.await.unwrap_or_default();
        *handle.state.write().await = RecordingState::Stopped;

        info!(
            camera_id = %device_id,
            session_id = %handle.session_id,
            files = files.len(),
            "Recording stopped"
        );
        self.events
            .publish(CoreEvent::RecordingStopped {
                device_id: device_id.to_string(),
                session_id: handle.session_id,
            })
            .await;
        Ok(files)
    }

    /// Suspend writes; incoming chunks are counted as dropped
    pub async fn pause(&self, device_id: &str) -> Result<()> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("No recording for {}", device_id)))?;
        handle.paused.store(true, Ordering::SeqCst);
        *handle.state.write().await = RecordingState::Paused;
        Ok(())
    }

    pub async fn resume(&self, device_id: &str) -> Result<()> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("No recording for {}", device_id)))?;
        handle.paused.store(false, Ordering::SeqCst);
        *handle.state.write().await = RecordingState::Recording;
        Ok(())
    }

    pub async fn info(&self, device_id: &str) -> Option<RecordingInfo> {
        let sessions = self.sessions.read().await;
        let handle = sessions.get(device_id)?;
        let info = RecordingInfo {
            device_id: device_id.to_string(),
            session_id: handle.session_id,
            state: *handle.state.read().await,
            stats: handle.stats.lock().await.clone(),
        };
        Some(info)
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

struct RecordingCtx {
    device: Device,
    config: RecordingConfig,
    session_id: Uuid,
    state: Arc<RwLock<RecordingState>>,
    paused: Arc<AtomicBool>,
    stats: Arc<Mutex<RecordingStats>>,
    stop_rx: watch::Receiver<bool>,
    chunks: broadcast::Receiver<bytes::Bytes>,
    streams: Arc<StreamCoordinator>,
    storage: Arc<StorageManager>,
    events: Arc<EventBus>,
}

/// Writer task. Owns the segment writer; rotation by duration happens
/// here, rotation by size inside the writer.
async fn run_recording(mut ctx: RecordingCtx) -> Vec<RecordingFile> {
    let dir = ctx.storage.policy().primary_path.clone();
    let mut writer = SegmentWriter::new(
        &dir,
        &ctx.device.id,
        &ctx.config.format,
        ctx.config.max_file_size,
    );

    let started = Instant::now();
    let mut rotation = tokio::time::interval(Duration::from_secs(
        ctx.config.segment_duration_secs.max(1),
    ));
    rotation.tick().await;
    let mut stats_timer = tokio::time::interval(STATS_INTERVAL);
    stats_timer.tick().await;
    let mut stop_rx = ctx.stop_rx.clone();
    // The stream gets one restart before the session goes to Error
    let mut recovered = false;
    let mut rotated_segments = 0usize;

    loop {
        tokio::select! {
            chunk = ctx.chunks.recv() => {
                match chunk {
                    Ok(data) => {
                        if ctx.paused.load(Ordering::SeqCst) {
                            let mut stats = ctx.stats.lock().await;
                            stats.dropped_frames += 1;
                            continue;
                        }
                        if let Err(e) = writer.append(&data).await {
                            warn!(camera_id = %ctx.device.id, error = %e, "Recording write failed");
                            *ctx.state.write().await = RecordingState::Error;
                            ctx.events.publish(CoreEvent::RecordingError {
                                device_id: ctx.device.id.clone(),
                                message: e.to_string(),
                            }).await;
                            break;
                        }
                        // A size rotation just opened a fresh segment; the
                        // duration clock starts over for it
                        if writer.finished_count() > rotated_segments {
                            rotated_segments = writer.finished_count();
                            rotation.reset();
                        }
                        let mut stats = ctx.stats.lock().await;
                        stats.total_frames += 1;
                        stats.total_bytes += data.len() as u64;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        let mut stats = ctx.stats.lock().await;
                        stats.dropped_frames += n;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if recovered {
                            warn!(camera_id = %ctx.device.id, "Stream lost again, recording aborted");
                            *ctx.state.write().await = RecordingState::Error;
                            ctx.events.publish(CoreEvent::RecordingError {
                                device_id: ctx.device.id.clone(),
                                message: "Source stream lost after recovery".to_string(),
                            }).await;
                            break;
                        }
                        recovered = true;
                        match recover_stream(&mut ctx, &mut writer).await {
                            Ok(rx) => ctx.chunks = rx,
                            Err(e) => {
                                *ctx.state.write().await = RecordingState::Error;
                                ctx.events.publish(CoreEvent::RecordingError {
                                    device_id: ctx.device.id.clone(),
                                    message: e.to_string(),
                                }).await;
                                break;
                            }
                        }
                    }
                }
            }
            _ = rotation.tick() => {
                if let Err(e) = writer.rotate_now().await {
                    warn!(camera_id = %ctx.device.id, error = %e, "Segment rotation failed");
                }
                rotated_segments = writer.finished_count();
            }
            _ = stats_timer.tick() => {
                let stats = {
                    let mut stats = ctx.stats.lock().await;
                    let elapsed = started.elapsed().as_secs_f64().max(0.001);
                    stats.average_fps = stats.total_frames as f64 / elapsed;
                    stats.average_bitrate_kbps =
                        (stats.total_bytes as f64 * 8.0) / 1000.0 / elapsed;
                    stats.clone()
                };
                ctx.events.publish(CoreEvent::RecordingStats {
                    device_id: ctx.device.id.clone(),
                    stats,
                }).await;
            }
            _ = stop_rx.changed() => break,
        }
    }

    match writer.finish().await {
        Ok(files) => files,
        Err(e) => {
            warn!(camera_id = %ctx.device.id, error = %e, "Failed to finalize recording");
            Vec::new()
        }
    }
}

/// One-shot stream recovery: brief backoff, restart the source, resubscribe,
/// and continue into a fresh segment so a corrupt tail stays isolated.
async fn recover_stream(
    ctx: &mut RecordingCtx,
    writer: &mut SegmentWriter,
) -> Result<broadcast::Receiver<bytes::Bytes>> {
    warn!(camera_id = %ctx.device.id, "Source stream lost, attempting recovery");
    ctx.events
        .publish(CoreEvent::RecordingError {
            device_id: ctx.device.id.clone(),
            message: "Source stream lost, recovering".to_string(),
        })
        .await;

    tokio::time::sleep(RECOVERY_DELAY).await;
    writer.rotate_now().await?;

    ctx.streams.stop(&ctx.device.id).await?;
    ctx.streams
        .start(&ctx.device, StreamConfig::default())
        .await?;
    let rx = ctx.streams.subscribe_chunks(&ctx.device.id).await?;
    info!(camera_id = %ctx.device.id, session_id = %ctx.session_id, "Recording recovered");
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::CompanionGateway;
    use crate::device::{device_id, ConnectionDescriptor, TransportType};
    use crate::secrets::SecretStore;
    use crate::storage::{StorageInspector, StoragePolicy};
    use async_trait::async_trait;
    use std::path::Path;

    struct PlentyOfSpace;

    #[async_trait]
    impl StorageInspector for PlentyOfSpace {
        async fn free_space(&self, _path: &Path) -> Result<u64> {
            Ok(u64::MAX)
        }
    }

    struct NoSpace;

    #[async_trait]
    impl StorageInspector for NoSpace {
        async fn free_space(&self, _path: &Path) -> Result<u64> {
            Ok(0)
        }
    }

    fn test_device(raw: &str) -> Device {
        Device::new(
            device_id(TransportType::Companion, raw),
            "Phone".to_string(),
            TransportType::Companion,
            ConnectionDescriptor::Companion {
                remote_addr: "test".to_string(),
            },
        )
    }

    fn coordinator_with(
        dir: &Path,
        inspector: Box<dyn StorageInspector>,
        max_concurrent: usize,
    ) -> RecordingCoordinator {
        let events = Arc::new(EventBus::default());
        let streams = Arc::new(StreamCoordinator::new(
            Arc::new(SecretStore::new()),
            Arc::new(CompanionGateway::new()),
            events.clone(),
        ));
        let storage = Arc::new(StorageManager::new(
            StoragePolicy {
                primary_path: dir.to_path_buf(),
                min_free_space_gb: 1,
                recycle_oldest: false,
                max_storage_gb: None,
            },
            inspector,
        ));
        RecordingCoordinator::new(streams, storage, events, max_concurrent)
    }

    #[tokio::test]
    async fn test_storage_preflight_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(dir.path(), Box::new(NoSpace), 4);
        let device = test_device("phone-1");

        let err = coordinator
            .start(&device, RecordingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientStorage(_)));
    }

    #[tokio::test]
    async fn test_duplicate_recording_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(dir.path(), Box::new(PlentyOfSpace), 4);
        let device = test_device("phone-1");

        coordinator
            .start(&device, RecordingConfig::default())
            .await
            .unwrap();
        let err = coordinator
            .start(&device, RecordingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        coordinator.stop(&device.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_cap_is_over_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(dir.path(), Box::new(PlentyOfSpace), 1);

        let first = test_device("phone-1");
        coordinator
            .start(&first, RecordingConfig::default())
            .await
            .unwrap();

        let second = test_device("phone-2");
        let err = coordinator
            .start(&second, RecordingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OverCapacity(_)));

        coordinator.stop(&first.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_info_reports_active_session() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(dir.path(), Box::new(PlentyOfSpace), 4);
        let device = test_device("phone-info");

        let session_id = coordinator
            .start(&device, RecordingConfig::default())
            .await
            .unwrap();
        let info = coordinator.info(&device.id).await.unwrap();
        assert_eq!(info.session_id, session_id);
        assert_eq!(info.state, RecordingState::Recording);

        coordinator.stop(&device.id).await.unwrap();
        assert!(coordinator.info(&device.id).await.is_none());
    }

    #[tokio::test]
    async fn test_racing_starts_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(dir.path(), Box::new(PlentyOfSpace), 4);
        let device = test_device("phone-race");

        let (a, b) = tokio::join!(
            coordinator.start(&device, RecordingConfig::default()),
            coordinator.start(&device, RecordingConfig::default()),
        );
        assert!(a.is_ok() != b.is_ok());
        assert_eq!(coordinator.active_ids().await.len(), 1);

        coordinator.stop(&device.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_racing_starts_respect_cap() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(dir.path(), Box::new(PlentyOfSpace), 1);
        let first = test_device("phone-a");
        let second = test_device("phone-b");

        let (a, b) = tokio::join!(
            coordinator.start(&first, RecordingConfig::default()),
            coordinator.start(&second, RecordingConfig::default()),
        );
        assert!(a.is_ok() != b.is_ok());

        let active = coordinator.active_ids().await;
        assert_eq!(active.len(), 1);
        coordinator.stop(&active[0]).await.unwrap();
    }

    #[tokio::test]
    async fn test_size_rotation_restarts_duration_clock() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::default());
        let streams = Arc::new(StreamCoordinator::new(
            Arc::new(SecretStore::new()),
            Arc::new(CompanionGateway::new()),
            events.clone(),
        ));
        let storage = Arc::new(StorageManager::new(
            StoragePolicy {
                primary_path: dir.path().to_path_buf(),
                min_free_space_gb: 1,
                recycle_oldest: false,
                max_storage_gb: None,
            },
            Box::new(PlentyOfSpace),
        ));

        let (chunk_tx, chunk_rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_recording(RecordingCtx {
            device: test_device("phone-rotate"),
            config: RecordingConfig {
                format: "ts".to_string(),
                max_file_size: 100,
                segment_duration_secs: 2,
            },
            session_id: Uuid::new_v4(),
            state: Arc::new(RwLock::new(RecordingState::Recording)),
            paused: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(RecordingStats::default())),
            stop_rx,
            chunks: chunk_rx,
            streams,
            storage,
            events,
        }));

        use tokio::time::sleep;
        chunk_tx.send(bytes::Bytes::from(vec![0u8; 40])).unwrap();
        sleep(Duration::from_millis(1500)).await;
        // Fills the first segment: size rotation, duration clock restarts
        chunk_tx.send(bytes::Bytes::from(vec![0u8; 60])).unwrap();
        sleep(Duration::from_millis(200)).await;
        chunk_tx.send(bytes::Bytes::from(vec![0u8; 30])).unwrap();
        sleep(Duration::from_millis(600)).await;
        // Past the original two-second mark; the open segment must not
        // have been cut short by the stale duration timer
        chunk_tx.send(bytes::Bytes::from(vec![0u8; 30])).unwrap();
        sleep(Duration::from_millis(300)).await;
        let _ = stop_tx.send(true);

        let files = task.await.unwrap();
        let mut sizes: Vec<u64> = files.iter().map(|f| f.size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![60, 100]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_resolves_empty() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator_with(dir.path(), Box::new(PlentyOfSpace), 4);
        assert!(coordinator.stop("companion:ghost").await.unwrap().is_empty());
    }
}
