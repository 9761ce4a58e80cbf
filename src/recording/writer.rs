//! Segment-rotating recording writer
//!
//! A recording is a sequence of files under a byte ceiling. Writes that
//! would cross the ceiling are split at the boundary, so for a ceiling of
//! M bytes, B total bytes always land in exactly ceil(B / M) files with no
//! byte lost or duplicated.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One finished file of a recording session
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordingFile {
    pub path: PathBuf,
    pub size: u64,
    pub duration_secs: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Compose a segment file name. Timestamps use `-` in place of `:` so the
/// names stay valid on every filesystem.
pub fn segment_file_name(
    device_id: &str,
    started: DateTime<Utc>,
    segment_index: u32,
    format: &str,
) -> String {
    let safe_device = device_id.replace([':', '/'], "-");
    let timestamp = started.format("%Y-%m-%dT%H-%M-%S");
    if segment_index == 0 {
        format!("{}_{}.{}", safe_device, timestamp, format)
    } else {
        format!("{}_{}_{}.{}", safe_device, timestamp, segment_index, format)
    }
}

pub struct SegmentWriter {
    dir: PathBuf,
    device_id: String,
    format: String,
    max_file_size: u64,
    session_start: DateTime<Utc>,
    segment_index: u32,
    current: Option<OpenSegment>,
    finished: Vec<RecordingFile>,
}

struct OpenSegment {
    file: File,
    path: PathBuf,
    written: u64,
    start_time: DateTime<Utc>,
}

impl SegmentWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        device_id: impl Into<String>,
        format: impl Into<String>,
        max_file_size: u64,
    ) -> Self {
        Self {
            dir: dir.into(),
            device_id: device_id.into(),
            format: format.into(),
            max_file_size: max_file_size.max(1),
            session_start: Utc::now(),
            segment_index: 0,
            current: None,
            finished: Vec::new(),
        }
    }

    /// Append bytes, splitting across segment boundaries as needed
    pub async fn append(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.current.is_none() {
                self.open_segment().await?;
            }
            let Some(segment) = self.current.as_mut() else {
                return Err(Error::Internal("segment missing after open".into()));
            };

            let remaining = (self.max_file_size - segment.written) as usize;
            let take = remaining.min(data.len());
            segment.file.write_all(&data[..take]).await?;
            segment.written += take as u64;
            data = &data[take..];

            if segment.written >= self.max_file_size {
                self.close_segment().await?;
            }
        }
        Ok(())
    }

    /// Number of segments closed so far; grows when `append` crosses the
    /// size ceiling, letting the caller notice size-based rotations
    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    /// Force a boundary now (used by duration-based rotation)
    pub async fn rotate_now(&mut self) -> Result<()> {
        if self.current.is_some() {
            self.close_segment().await?;
        }
        Ok(())
    }

    /// Flush, close the open segment, and return all finished files
    pub async fn finish(mut self) -> Result<Vec<RecordingFile>> {
        if self.current.is_some() {
            self.close_segment().await?;
        }
        Ok(self.finished)
    }

    pub fn bytes_written(&self) -> u64 {
        let finished: u64 = self.finished.iter().map(|f| f.size).sum();
        finished + self.current.as_ref().map(|s| s.written).unwrap_or(0)
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|s| s.path.as_path())
    }

    async fn open_segment(&mut self) -> Result<()> {
        let name = segment_file_name(
            &self.device_id,
            self.session_start,
            self.segment_index,
            &self.format,
        );
        let path = self.dir.join(name);
        let file = File::create(&path).await?;
        debug!(camera_id = %self.device_id, path = %path.display(), "Opened recording segment");
        self.current = Some(OpenSegment {
            file,
            path,
            written: 0,
            start_time: Utc::now(),
        });
        self.segment_index += 1;
        Ok(())
    }

    async fn close_segment(&mut self) -> Result<()> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };
        // Data must be durable before the file is reported finished
        segment.file.flush().await?;
        segment.file.sync_all().await?;

        let end_time = Utc::now();
        let duration = (end_time - segment.start_time).num_milliseconds() as f64 / 1000.0;
        debug!(
            camera_id = %self.device_id,
            path = %segment.path.display(),
            size = segment.written,
            "Closed recording segment"
        );
        self.finished.push(RecordingFile {
            path: segment.path,
            size: segment.written,
            duration_secs: duration,
            start_time: segment.start_time,
            end_time,
        });
        Ok(())
    }
}
