//! Per-session stream state, buffering, and statistics

use crate::device::Resolution;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Starting,
    Active,
    Paused,
    Stopped,
    Error,
}

/// Quality preset mapped onto device capabilities at start time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamQuality {
    Low,
    Medium,
    High,
}

/// Requested stream parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub quality: StreamQuality,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub frame_rate: Option<u32>,
    #[serde(default)]
    pub audio: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            quality: StreamQuality::Medium,
            resolution: None,
            frame_rate: None,
            audio: false,
        }
    }
}

/// Live statistics reported per session
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub packets: u64,
    /// Bytes currently held in the chunk ring
    pub buffer_level: usize,
    pub bytes_total: u64,
}

/// Bounded byte-budget ring of recent chunks.
///
/// When a new chunk would exceed the budget, oldest chunks are evicted
/// first; a consumer that joins late sees only recent data.
pub struct ChunkRing {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    max_bytes: usize,
}

impl ChunkRing {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        while self.bytes + chunk.len() > self.max_bytes {
            match self.chunks.pop_front() {
                Some(evicted) => self.bytes -= evicted.len(),
                None => break,
            }
        }
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().cloned().collect()
    }
}

/// Sliding-window bitrate estimator over recent chunk arrivals
pub struct BitrateWindow {
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
}

impl BitrateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: usize) {
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Kilobits per second over the span actually covered by samples,
    /// clamped to the window. Dividing by the full window would understate
    /// the rate until the window has filled once.
    pub fn kbps(&mut self) -> f64 {
        self.kbps_at(Instant::now())
    }

    fn kbps_at(&mut self, now: Instant) -> f64 {
        self.evict(now);
        let Some(&(first, _)) = self.samples.front() else {
            return 0.0;
        };
        let total_bytes: usize = self.samples.iter().map(|&(_, b)| b).sum();
        let span = now
            .duration_since(first)
            .min(self.window)
            .as_secs_f64()
            .max(0.1);
        (total_bytes as f64 * 8.0) / 1000.0 / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ring_evicts_oldest_first() {
        let mut ring = ChunkRing::new(10);
        ring.push(Bytes::from(vec![1u8; 4]));
        ring.push(Bytes::from(vec![2u8; 4]));
        assert_eq!(ring.bytes(), 8);
        assert_eq!(ring.len(), 2);

        // 4 more would exceed 10: the first chunk goes
        ring.push(Bytes::from(vec![3u8; 4]));
        assert_eq!(ring.bytes(), 8);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.snapshot()[0][0], 2);
    }

    #[test]
    fn test_chunk_ring_oversized_chunk_still_stored() {
        let mut ring = ChunkRing::new(4);
        ring.push(Bytes::from(vec![0u8; 16]));
        // Budget exceeded but the newest chunk is never dropped
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.bytes(), 16);

        ring.push(Bytes::from(vec![1u8; 2]));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.bytes(), 2);
    }

    #[test]
    fn test_bitrate_window_expires_samples() {
        let mut window = BitrateWindow::new(Duration::from_secs(5));
        let base = Instant::now() - Duration::from_secs(60);
        // Old sample, fully outside the window
        window.record_at(base, 1_000_000);
        assert_eq!(window.kbps(), 0.0);

        window.record(5_000 * 5 / 8 * 1000);
        assert!(window.kbps() > 0.0);
    }

    #[test]
    fn test_bitrate_uses_actual_span_before_window_fills() {
        let mut window = BitrateWindow::new(Duration::from_secs(5));
        let now = Instant::now();
        // 250 KB over one second of a five-second window
        window.record_at(now - Duration::from_secs(1), 125_000);
        window.record_at(now, 125_000);

        let kbps = window.kbps_at(now);
        assert!((kbps - 2000.0).abs() < 1.0, "got {}", kbps);
    }

    #[test]
    fn test_stream_config_defaults() {
        let config: StreamConfig = serde_json::from_str(r#"{"quality":"high"}"#).unwrap();
        assert_eq!(config.quality, StreamQuality::High);
        assert!(config.resolution.is_none());
        assert!(!config.audio);
    }
}
