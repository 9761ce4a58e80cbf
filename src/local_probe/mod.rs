//! LocalCaptureProbe - attached capture hardware enumeration
//!
//! ## Responsibilities
//! - Enumerate capture devices via `v4l2-ctl --list-devices`
//! - Filter built-in / virtual devices out of the candidate set
//! - Probe per-device capabilities, degrading to a fallback set on failure
//! - Hotplug monitoring: periodic re-enumeration diffed against the last
//!   snapshot, emitting attach/detach events

use crate::device::{
    device_id, ConnectionDescriptor, Device, DeviceCapabilities, Resolution, TransportType,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hotplug monitoring poll interval
const MONITOR_INTERVAL_SECS: u64 = 5;

/// Name fragments that mark a device as built-in or virtual
const EXCLUDED_NAME_FRAGMENTS: &[&str] = &["integrated", "built-in", "builtin", "virtual", "loopback", "dummy"];

/// Hotplug event emitted by the monitoring task
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    Attached(Device),
    Detached(String),
}

/// Enumerate attached capture devices.
///
/// Enumeration failure (tool missing, no devices) yields an empty list,
/// never an error.
pub async fn detect() -> Vec<Device> {
    let output = match Command::new("v4l2-ctl").arg("--list-devices").output().await {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "v4l2-ctl not available, no local cameras");
            return Vec::new();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut devices = Vec::new();

    for (name, node) in parse_device_list(&stdout) {
        if is_excluded_name(&name) {
            debug!(name = %name, node = %node, "Skipping built-in/virtual device");
            continue;
        }

        let suffix = node.trim_start_matches("/dev/").to_string();
        let id = device_id(TransportType::Local, &suffix);
        let mut device = Device::new(
            id,
            name,
            TransportType::Local,
            ConnectionDescriptor::Local {
                system_path: node.clone(),
            },
        );
        device.capabilities = probe_capabilities(&node).await;
        devices.push(device);
    }

    info!(count = devices.len(), "Local capture scan complete");
    devices
}

/// Probe formats and frame rates for a device node.
///
/// Always resolves; any failure degrades to [`DeviceCapabilities::fallback`].
pub async fn probe_capabilities(node: &str) -> DeviceCapabilities {
    let output = Command::new("v4l2-ctl")
        .args(["-d", node, "--list-formats-ext"])
        .output()
        .await;

    match output {
        Ok(o) if o.status.success() => {
            let stdout = String::from_utf8_lossy(&o.stdout);
            let caps = parse_formats_ext(&stdout);
            if caps.resolutions.is_empty() {
                DeviceCapabilities::fallback()
            } else {
                caps
            }
        }
        Ok(o) => {
            debug!(node = %node, code = ?o.status.code(), "Capability probe failed, using fallback");
            DeviceCapabilities::fallback()
        }
        Err(e) => {
            debug!(node = %node, error = %e, "Capability probe failed, using fallback");
            DeviceCapabilities::fallback()
        }
    }
}

/// Open-and-release liveness test for a device node
pub async fn test_camera(node: &str) -> bool {
    match tokio::fs::File::open(node).await {
        Ok(file) => {
            drop(file);
            true
        }
        Err(e) => {
            debug!(node = %node, error = %e, "Local camera open failed");
            false
        }
    }
}

/// Spawn the hotplug monitoring task.
///
/// Re-enumerates every [`MONITOR_INTERVAL_SECS`] and diffs against the
/// previous id set. Abort the returned handle to stop monitoring.
pub fn start_monitoring(tx: mpsc::Sender<HotplugEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut known: HashSet<String> = detect().await.into_iter().map(|d| d.id).collect();
        let mut interval = tokio::time::interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
        interval.tick().await;

        loop {
            interval.tick().await;
            let current = detect().await;
            let current_ids: HashSet<String> = current.iter().map(|d| d.id.clone()).collect();

            for device in &current {
                if !known.contains(&device.id) {
                    info!(camera_id = %device.id, "Local camera attached");
                    if tx.send(HotplugEvent::Attached(device.clone())).await.is_err() {
                        return;
                    }
                }
            }

            for id in known.difference(&current_ids) {
                info!(camera_id = %id, "Local camera detached");
                if tx.send(HotplugEvent::Detached(id.clone())).await.is_err() {
                    return;
                }
            }

            known = current_ids;
        }
    })
}

fn is_excluded_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    EXCLUDED_NAME_FRAGMENTS.iter().any(|f| lower.contains(f))
}

/// Parse `v4l2-ctl --list-devices` output into (name, first node) pairs.
///
/// The format is a device name line followed by indented /dev/video* lines;
/// only the first node per device is a capture entry point.
fn parse_device_list(output: &str) -> Vec<(String, String)> {
    let mut devices = Vec::new();
    let mut current_name: Option<String> = None;
    let mut taken_node_for_current = false;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            // Name line, e.g. "HD Webcam C920 (usb-0000:00:14.0-1):"
            let name = line.trim().trim_end_matches(':');
            let name = match name.rfind(" (") {
                Some(idx) => &name[..idx],
                None => name,
            };
            current_name = Some(name.to_string());
            taken_node_for_current = false;
        } else if let Some(ref name) = current_name {
            let node = line.trim();
            if node.starts_with("/dev/video") && !taken_node_for_current {
                devices.push((name.clone(), node.to_string()));
                taken_node_for_current = true;
            }
        }
    }

    devices
}

/// Parse `v4l2-ctl --list-formats-ext` output into a capability set
fn parse_formats_ext(output: &str) -> DeviceCapabilities {
    let mut resolutions: Vec<Resolution> = Vec::new();
    let mut frame_rates: Vec<u32> = Vec::new();
    let mut codecs: Vec<String> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();

        // e.g. "[0]: 'MJPG' (Motion-JPEG, compressed)"
        if trimmed.starts_with('[') {
            if let Some(start) = trimmed.find('\'') {
                if let Some(end) = trimmed[start + 1..].find('\'') {
                    let fourcc = trimmed[start + 1..start + 1 + end].to_lowercase();
                    if !codecs.contains(&fourcc) {
                        codecs.push(fourcc);
                    }
                }
            }
        }

        // e.g. "Size: Discrete 1920x1080"
        if let Some(rest) = trimmed.strip_prefix("Size: Discrete ") {
            if let Some((w, h)) = rest.trim().split_once('x') {
                if let (Ok(width), Ok(height)) = (w.trim().parse(), h.trim().parse()) {
                    let res = Resolution::new(width, height);
                    if !resolutions.contains(&res) {
                        resolutions.push(res);
                    }
                }
            }
        }

        // e.g. "Interval: Discrete 0.033s (30.000 fps)"
        if let Some(open) = trimmed.find('(') {
            if let Some(close) = trimmed[open..].find(" fps)") {
                let num = &trimmed[open + 1..open + close];
                if let Ok(fps) = num.trim().parse::<f64>() {
                    let fps = fps.round() as u32;
                    if fps > 0 && !frame_rates.contains(&fps) {
                        frame_rates.push(fps);
                    }
                }
            }
        }
    }

    // Largest first, matching how quality selection walks the list
    resolutions.sort_by(|a, b| (b.width * b.height).cmp(&(a.width * a.height)));
    frame_rates.sort_unstable_by(|a, b| b.cmp(a));

    DeviceCapabilities {
        resolutions,
        frame_rates,
        audio: false,
        ptz: false,
        infrared: false,
        codecs,
        protocols: vec!["v4l2".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_DEVICES_OUTPUT: &str = "\
HD Webcam C920 (usb-0000:00:14.0-1):
\t/dev/video0
\t/dev/video1

Integrated Camera (usb-0000:00:14.0-5):
\t/dev/video2

Dummy video device (0x0000):
\t/dev/video4
";

    const FORMATS_EXT_OUTPUT: &str = "\
ioctl: VIDIOC_ENUM_FMT
\tType: Video Capture

\t[0]: 'MJPG' (Motion-JPEG, compressed)
\t\tSize: Discrete 1920x1080
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\tSize: Discrete 1280x720
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\t\tInterval: Discrete 0.017s (60.000 fps)
\t[1]: 'YUYV' (YUYV 4:2:2)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.067s (15.000 fps)
";

    #[test]
    fn test_parse_device_list_takes_first_node() {
        let devices = parse_device_list(LIST_DEVICES_OUTPUT);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].0, "HD Webcam C920");
        assert_eq!(devices[0].1, "/dev/video0");
        assert_eq!(devices[1].1, "/dev/video2");
    }

    #[test]
    fn test_excluded_names() {
        assert!(is_excluded_name("Integrated Camera"));
        assert!(is_excluded_name("Dummy video device"));
        assert!(is_excluded_name("v4l2loopback"));
        assert!(!is_excluded_name("HD Webcam C920"));
    }

    #[test]
    fn test_parse_formats_ext() {
        let caps = parse_formats_ext(FORMATS_EXT_OUTPUT);
        assert_eq!(caps.resolutions[0], Resolution::new(1920, 1080));
        assert!(caps.resolutions.contains(&Resolution::new(640, 480)));
        assert_eq!(caps.frame_rates, vec![60, 30, 15]);
        assert_eq!(caps.codecs, vec!["mjpg".to_string(), "yuyv".to_string()]);
    }

    #[test]
    fn test_parse_formats_ext_empty_is_empty() {
        let caps = parse_formats_ext("");
        assert!(caps.resolutions.is_empty());
    }
}
