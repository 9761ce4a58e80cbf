//! NetworkProbe - RTSP/HTTP-snapshot address-range sweep
//!
//! ## Responsibilities
//! - Expand an address range (CIDR or start-end) into candidate hosts
//! - Sweep hosts in bounded-concurrency chunks, probing RTSP then HTTP
//! - Manual RTSP registration with handshake re-validation
//!
//! A sweep visits every candidate exactly once; per-host failures are
//! silent, only the sweep summary is logged.

pub mod http;
pub mod rtsp;

use crate::device::{device_id, ConnectionDescriptor, Device, TransportType};
use crate::error::{Error, Result};
use futures::future::join_all;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{info, warn};

/// Protocols a sweep probes for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProtocol {
    Rtsp,
    Http,
}

/// Sweep parameters
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// CIDR ("192.168.1.0/24") or inclusive range ("192.168.1.10-192.168.1.50")
    pub ip_range: String,
    pub ports: Vec<u16>,
    pub protocols: Vec<ScanProtocol>,
    pub timeout_ms: u64,
    /// Hosts probed in parallel per chunk
    pub concurrency: usize,
}

impl ScanOptions {
    pub fn for_range(ip_range: impl Into<String>) -> Self {
        Self {
            ip_range: ip_range.into(),
            ports: vec![554, 8554, 80, 8080],
            protocols: vec![ScanProtocol::Rtsp, ScanProtocol::Http],
            timeout_ms: 2000,
            concurrency: 10,
        }
    }
}

/// Expand an address range into individual hosts.
///
/// Accepts CIDR notation, an inclusive "start-end" pair, or a single IP.
/// For /24 and narrower, network and broadcast addresses are skipped.
pub fn expand_ip_range(range: &str) -> Result<Vec<IpAddr>> {
    if let Some((start, end)) = range.split_once('-') {
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|e| Error::Validation(format!("Invalid range start: {}", e)))?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|e| Error::Validation(format!("Invalid range end: {}", e)))?;
        let (start_u32, end_u32) = (u32::from(start), u32::from(end));
        if start_u32 > end_u32 {
            return Err(Error::Validation(format!("Range start after end: {}", range)));
        }
        return Ok((start_u32..=end_u32)
            .map(|u| IpAddr::V4(Ipv4Addr::from(u)))
            .collect());
    }

    if !range.contains('/') {
        return range
            .parse::<IpAddr>()
            .map(|ip| vec![ip])
            .map_err(|e| Error::Validation(format!("Invalid IP: {}", e)));
    }

    let (base, prefix) = range
        .split_once('/')
        .ok_or_else(|| Error::Validation(format!("Invalid CIDR: {}", range)))?;
    let base_ip: Ipv4Addr = base
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid IP: {}", e)))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| Error::Validation(format!("Invalid prefix: {}", e)))?;
    if prefix > 32 {
        return Err(Error::Validation(format!(
            "Invalid prefix: {} (must be 0-32)",
            prefix
        )));
    }

    let base_u32 = u32::from(base_ip);
    let mask = if prefix == 0 {
        0
    } else {
        !((1u32 << (32 - prefix)) - 1)
    };
    let network = base_u32 & mask;
    let broadcast = network | !mask;

    let start = if prefix >= 24 && prefix < 31 { network + 1 } else { network };
    let end = if prefix >= 24 && prefix < 31 { broadcast - 1 } else { broadcast };

    Ok((start..=end).map(|u| IpAddr::V4(Ipv4Addr::from(u))).collect())
}

/// Sweep an address range for RTSP/HTTP cameras.
///
/// Hosts are probed in chunks of `concurrency`; a chunk's probes run in
/// parallel and all settle before the next chunk starts.
pub async fn scan(options: &ScanOptions) -> Result<Vec<Device>> {
    let hosts = expand_ip_range(&options.ip_range)?;
    info!(
        range = %options.ip_range,
        hosts = hosts.len(),
        concurrency = options.concurrency,
        "Network sweep started"
    );

    let mut found = Vec::new();
    let concurrency = options.concurrency.max(1);
    let total_chunks = hosts.len().div_ceil(concurrency);

    for (chunk_idx, chunk) in hosts.chunks(concurrency).enumerate() {
        let probes = chunk
            .iter()
            .map(|&ip| probe_host(ip, options))
            .collect::<Vec<_>>();
        for device in join_all(probes).await.into_iter().flatten() {
            found.push(device);
        }

        if total_chunks > 1 && (chunk_idx + 1) % 8 == 0 {
            info!(
                chunk = chunk_idx + 1,
                total_chunks = total_chunks,
                found = found.len(),
                "Network sweep progress"
            );
        }
    }

    info!(range = %options.ip_range, found = found.len(), "Network sweep complete");
    Ok(found)
}

/// Probe one host across the configured ports and protocols.
/// RTSP wins over HTTP when both respond.
async fn probe_host(ip: IpAddr, options: &ScanOptions) -> Option<Device> {
    if options.protocols.contains(&ScanProtocol::Rtsp) {
        for &port in options.ports.iter().filter(|p| is_rtsp_port(**p)) {
            if rtsp::probe_rtsp(ip, port, options.timeout_ms).await {
                let id = device_id(TransportType::NetworkRtsp, &format!("{}:{}", ip, port));
                let device = Device::new(
                    id,
                    format!("RTSP Camera {}", ip),
                    TransportType::NetworkRtsp,
                    ConnectionDescriptor::Rtsp {
                        host: ip.to_string(),
                        port,
                        path: "/stream1".to_string(),
                        credentials: None,
                    },
                );
                return Some(device);
            }
        }
    }

    if options.protocols.contains(&ScanProtocol::Http) {
        for &port in options.ports.iter().filter(|p| !is_rtsp_port(**p)) {
            if let Some(path) = http::probe_http_snapshot(ip, port, options.timeout_ms).await {
                let id = device_id(TransportType::NetworkHttp, &format!("{}:{}", ip, port));
                let device = Device::new(
                    id,
                    format!("HTTP Camera {}", ip),
                    TransportType::NetworkHttp,
                    ConnectionDescriptor::Http {
                        host: ip.to_string(),
                        port,
                        snapshot_path: Some(path),
                        credentials: None,
                    },
                );
                return Some(device);
            }
        }
    }

    None
}

fn is_rtsp_port(port: u16) -> bool {
    matches!(port, 554 | 8554 | 2020)
}

/// Register a camera from a user-supplied RTSP URL.
///
/// The handshake is re-validated even for manual entries; an unreachable
/// URL is rejected, never silently registered.
pub async fn add_rtsp_camera(name: &str, url: &str, timeout_ms: u64) -> Result<Device> {
    let (host, port) = rtsp::host_port_from_url(url)
        .ok_or_else(|| Error::Validation(format!("Not an rtsp:// URL: {}", url)))?;

    if !rtsp::validate_rtsp_url(url, timeout_ms).await {
        warn!(host = %host, port = port, "Manual RTSP registration failed handshake");
        return Err(Error::Transport(format!(
            "No RTSP response from {}:{}",
            host, port
        )));
    }

    let path = url
        .strip_prefix("rtsp://")
        .and_then(|rest| rest.find('/').map(|idx| rest[idx..].to_string()))
        .unwrap_or_else(|| "/".to_string());

    let id = device_id(TransportType::NetworkRtsp, &format!("{}:{}", host, port));
    Ok(Device::new(
        id,
        name.to_string(),
        TransportType::NetworkRtsp,
        ConnectionDescriptor::Rtsp {
            host,
            port,
            path,
            credentials: None,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_expand_cidr_24() {
        let hosts = expand_ip_range("192.168.1.0/24").unwrap();
        assert_eq!(hosts.len(), 254);

        // Every host exactly once, no network/broadcast
        let unique: HashSet<_> = hosts.iter().collect();
        assert_eq!(unique.len(), 254);
        assert!(!hosts.contains(&"192.168.1.0".parse().unwrap()));
        assert!(!hosts.contains(&"192.168.1.255".parse().unwrap()));
        assert!(hosts.contains(&"192.168.1.1".parse().unwrap()));
        assert!(hosts.contains(&"192.168.1.254".parse().unwrap()));
    }

    #[test]
    fn test_expand_start_end_range() {
        let hosts = expand_ip_range("192.168.1.10-192.168.1.13").unwrap();
        assert_eq!(hosts.len(), 4);
        assert_eq!(hosts[0], "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(hosts[3], "192.168.1.13".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_expand_single_ip() {
        let hosts = expand_ip_range("10.0.0.5").unwrap();
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn test_expand_rejects_garbage() {
        assert!(expand_ip_range("not-an-ip").is_err());
        assert!(expand_ip_range("192.168.1.0/40").is_err());
        assert!(expand_ip_range("192.168.1.50-192.168.1.10").is_err());
    }

    #[test]
    fn test_chunking_covers_all_hosts() {
        let hosts = expand_ip_range("192.168.1.0/24").unwrap();
        let mut visited = 0usize;
        for chunk in hosts.chunks(10) {
            visited += chunk.len();
        }
        assert_eq!(visited, 254);
    }
}
