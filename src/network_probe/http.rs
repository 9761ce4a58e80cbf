//! HTTP snapshot probing
//!
//! Cameras without RTSP often expose a still-image endpoint. A host counts
//! as an HTTP camera when one of the well-known snapshot paths answers 200
//! with an image content type.

use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Snapshot paths tried in order; first hit wins
pub const SNAPSHOT_PATHS: &[&str] = &[
    "/snapshot.jpg",
    "/snapshot.cgi",
    "/image/jpeg.cgi",
    "/cgi-bin/snapshot.cgi",
    "/axis-cgi/jpg/image.cgi",
    "/onvif-http/snapshot",
];

/// Probe a host for an HTTP snapshot endpoint, returning the matching path
pub async fn probe_http_snapshot(ip: IpAddr, port: u16, timeout_ms: u64) -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .ok()?;

    for path in SNAPSHOT_PATHS {
        let url = format!("http://{}:{}{}", ip, port, path);
        let resp = match client.get(&url).send().await {
            Ok(r) => r,
            Err(_) => continue,
        };

        if !resp.status().is_success() {
            continue;
        }

        let is_image = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("image"))
            .unwrap_or(false);

        if is_image {
            debug!(ip = %ip, port = port, path = %path, "HTTP snapshot endpoint found");
            return Some(path.to_string());
        }
    }

    None
}
