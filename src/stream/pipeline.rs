//! Capture pipeline processes and their supervision
//!
//! Pipelines are external ffmpeg processes writing MPEG-TS to stdout in
//! small chunks. Supervision is governed by an explicit [`RestartPolicy`]
//! instead of an unconditional respawn loop.

use crate::device::Resolution;
use crate::stream::session::{StreamConfig, StreamQuality};
use std::time::Duration;

/// How a failed pipeline may be restarted
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Automatic restarts before the session goes to Error
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_secs(2),
        }
    }
}

/// Progress line fields parsed from ffmpeg stderr
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineProgress {
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
}

/// Parse an ffmpeg stderr progress line, e.g.
/// `frame=  120 fps= 30 q=28.0 size=    512kB time=00:00:04.00 bitrate=1048.6kbits/s`
pub fn parse_progress(line: &str) -> Option<PipelineProgress> {
    if !line.contains("fps=") && !line.contains("bitrate=") {
        return None;
    }

    let fps = field_value(line, "fps=").and_then(|v| v.parse().ok());
    let bitrate_kbps = field_value(line, "bitrate=")
        .and_then(|v| v.strip_suffix("kbits/s").map(str::to_string))
        .and_then(|v| v.parse().ok());

    if fps.is_none() && bitrate_kbps.is_none() {
        return None;
    }
    Some(PipelineProgress { fps, bitrate_kbps })
}

fn field_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(' ').unwrap_or(rest.len());
    let value = &rest[..end];
    if value.is_empty() || value == "N/A" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Pick the output resolution and frame rate for a config
pub fn select_output(
    config: &StreamConfig,
    available: &[Resolution],
) -> (Resolution, u32) {
    let resolution = config.resolution.unwrap_or_else(|| {
        let mut sorted: Vec<Resolution> = available.to_vec();
        sorted.sort_by(|a, b| (b.width * b.height).cmp(&(a.width * a.height)));
        let pick = match config.quality {
            StreamQuality::High => sorted.first(),
            StreamQuality::Medium => sorted.get(sorted.len() / 2),
            StreamQuality::Low => sorted.last(),
        };
        pick.copied().unwrap_or(Resolution::new(1280, 720))
    });

    let frame_rate = config.frame_rate.unwrap_or(match config.quality {
        StreamQuality::High => 30,
        StreamQuality::Medium => 25,
        StreamQuality::Low => 15,
    });

    (resolution, frame_rate)
}

/// ffmpeg arguments for a local V4L2 device, chunked MPEG-TS on stdout
pub fn local_pipeline_args(system_path: &str, resolution: Resolution, frame_rate: u32) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-f".into(),
        "v4l2".into(),
        "-framerate".into(),
        frame_rate.to_string(),
        "-video_size".into(),
        resolution.to_string(),
        "-i".into(),
        system_path.into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        "ultrafast".into(),
        "-tune".into(),
        "zerolatency".into(),
        "-f".into(),
        "mpegts".into(),
        "pipe:1".into(),
    ]
}

/// ffmpeg arguments for an RTSP source, copy codec, MPEG-TS on stdout.
///
/// The URL may embed credentials; callers must never log these args.
pub fn network_pipeline_args(url: &str) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-rtsp_transport".into(),
        "tcp".into(),
        "-i".into(),
        url.into(),
        "-c".into(),
        "copy".into(),
        "-f".into(),
        "mpegts".into(),
        "pipe:1".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_full_line() {
        let line = "frame=  120 fps= 30 q=28.0 size=    512kB time=00:00:04.00 bitrate=1048.6kbits/s speed=1.0x";
        let progress = parse_progress(line).unwrap();
        assert_eq!(progress.fps, Some(30.0));
        assert_eq!(progress.bitrate_kbps, Some(1048.6));
    }

    #[test]
    fn test_parse_progress_na_bitrate() {
        let line = "frame=    1 fps=0.0 q=0.0 size=       0kB time=00:00:00.00 bitrate=N/A";
        let progress = parse_progress(line).unwrap();
        assert_eq!(progress.fps, Some(0.0));
        assert_eq!(progress.bitrate_kbps, None);
    }

    #[test]
    fn test_parse_progress_ignores_noise() {
        assert_eq!(parse_progress("Input #0, rtsp, from 'rtsp://...'"), None);
        assert_eq!(parse_progress(""), None);
    }

    #[test]
    fn test_select_output_by_quality() {
        let available = vec![
            Resolution::new(1920, 1080),
            Resolution::new(1280, 720),
            Resolution::new(640, 480),
        ];
        let high = StreamConfig {
            quality: StreamQuality::High,
            ..Default::default()
        };
        let low = StreamConfig {
            quality: StreamQuality::Low,
            ..Default::default()
        };
        assert_eq!(select_output(&high, &available).0, Resolution::new(1920, 1080));
        assert_eq!(select_output(&low, &available).0, Resolution::new(640, 480));
        assert_eq!(select_output(&low, &available).1, 15);
    }

    #[test]
    fn test_explicit_resolution_wins() {
        let config = StreamConfig {
            quality: StreamQuality::Low,
            resolution: Some(Resolution::new(1920, 1080)),
            frame_rate: Some(60),
            audio: false,
        };
        let (res, fps) = select_output(&config, &[]);
        assert_eq!(res, Resolution::new(1920, 1080));
        assert_eq!(fps, 60);
    }

    #[test]
    fn test_restart_policy_default_is_single_attempt() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_attempts, 1);
    }
}
