//! OnvifDiscovery - WS-Discovery multicast plus SOAP introspection
//!
//! ## Responsibilities
//! - Probe the local segment via WS-Discovery multicast (239.255.255.250:3702)
//! - Resolve service capabilities and media profiles over SOAP 1.2
//! - Compose stream URIs with credentials injected at point of use
//!
//! Discovery is deadline-bounded and always resolves: a silent network
//! yields an empty list at the deadline, never a hang.

pub mod soap;
pub mod xml;

use crate::device::{device_id, ConnectionDescriptor, Device, TransportType};
use crate::error::{Error, Result};
use crate::secrets::Credentials;
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const WS_DISCOVERY_ADDR: &str = "239.255.255.250:3702";

/// Media/device service endpoints extracted from GetCapabilities
#[derive(Debug, Clone, Default)]
pub struct OnvifCapabilities {
    pub media_xaddr: Option<String>,
    pub events_xaddr: Option<String>,
    pub ptz_xaddr: Option<String>,
}

/// One media profile as reported by GetProfiles
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileSummary {
    pub token: String,
    pub name: String,
    pub video_encoder: Option<String>,
    pub audio_encoder: Option<String>,
}

/// Probe the local segment for ONVIF devices.
///
/// Sends a WS-Discovery Probe and collects ProbeMatch responses until the
/// deadline. Duplicate responders (multihomed devices answer per interface)
/// are collapsed by address.
pub async fn discover(timeout_ms: u64) -> Result<Vec<Device>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let probe = soap::ws_discovery_probe();
    socket.send_to(probe.as_bytes(), WS_DISCOVERY_ADDR).await?;

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut buf = vec![0u8; 8192];
    let mut seen_hosts: HashSet<String> = HashSet::new();
    let mut devices = Vec::new();

    loop {
        let (len, addr) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                debug!(error = %e, "WS-Discovery recv error, continuing until deadline");
                continue;
            }
            // Deadline reached: resolve with whatever arrived
            Err(_) => break,
        };

        let body = String::from_utf8_lossy(&buf[..len]);
        let Some(xaddrs) = xml::extract_xml_value(&body, "XAddrs") else {
            continue;
        };
        // XAddrs is space-separated; take the first http endpoint
        let Some(service_url) = xaddrs.split_whitespace().find(|u| u.starts_with("http")) else {
            continue;
        };

        let host = addr.ip().to_string();
        if !seen_hosts.insert(host.clone()) {
            continue;
        }

        debug!(host = %host, "ONVIF device responded");
        let id = device_id(TransportType::Onvif, &host);
        devices.push(Device::new(
            id,
            format!("ONVIF Camera {}", host),
            TransportType::Onvif,
            ConnectionDescriptor::Onvif {
                host,
                service_url: service_url.to_string(),
                credentials: None,
            },
        ));
    }

    info!(found = devices.len(), timeout_ms = timeout_ms, "ONVIF discovery complete");
    Ok(devices)
}

async fn soap_request(
    service_url: &str,
    credentials: Option<&Credentials>,
    body: &str,
    timeout_ms: u64,
) -> Result<String> {
    let header = credentials.map(|c| soap::security_header(&c.username, &c.password));
    let request = soap::envelope(header.as_deref(), body);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()?;

    let resp = client
        .post(service_url)
        .header("Content-Type", "application/soap+xml")
        .body(request)
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(Error::Transport(format!(
            "SOAP request to {} failed: {}",
            service_url,
            resp.status()
        )));
    }

    Ok(resp.text().await?)
}

/// GetCapabilities. Degrades to the default (device-service-only) set when
/// the device rejects or garbles the request; introspection failures must
/// not remove a discovered device.
pub async fn get_capabilities(
    service_url: &str,
    credentials: Option<&Credentials>,
    timeout_ms: u64,
) -> OnvifCapabilities {
    let body = match soap_request(
        service_url,
        credentials,
        soap::get_capabilities_body(),
        timeout_ms,
    )
    .await
    {
        Ok(b) => b,
        Err(e) => {
            warn!(service_url = %service_url, error = %e, "GetCapabilities failed, using defaults");
            return OnvifCapabilities::default();
        }
    };

    let media_xaddr = section_xaddr(&body, "Media");
    let events_xaddr = section_xaddr(&body, "Events");
    let ptz_xaddr = section_xaddr(&body, "PTZ");

    OnvifCapabilities {
        media_xaddr,
        events_xaddr,
        ptz_xaddr,
    }
}

fn section_xaddr(body: &str, section: &str) -> Option<String> {
    let sections = xml::extract_sections(body, section);
    sections
        .first()
        .and_then(|s| xml::extract_xml_value(s, "XAddr"))
}

/// GetProfiles against the media service
pub async fn get_profiles(
    media_url: &str,
    credentials: Option<&Credentials>,
    timeout_ms: u64,
) -> Result<Vec<ProfileSummary>> {
    let body = soap_request(media_url, credentials, soap::get_profiles_body(), timeout_ms).await?;

    let mut profiles = Vec::new();
    for section in xml::extract_sections(&body, "Profiles") {
        let Some(token) = xml::extract_xml_attribute(section, "Profiles", "token") else {
            continue;
        };
        profiles.push(ProfileSummary {
            name: xml::extract_xml_value(section, "Name").unwrap_or_else(|| token.clone()),
            video_encoder: xml::extract_xml_value(section, "Encoding"),
            audio_encoder: audio_encoding(section),
            token,
        });
    }

    if profiles.is_empty() {
        return Err(Error::Parse(format!("No profiles in response from {}", media_url)));
    }
    Ok(profiles)
}

fn audio_encoding(section: &str) -> Option<String> {
    let audio = xml::extract_sections(section, "AudioEncoderConfiguration");
    audio
        .first()
        .and_then(|s| xml::extract_xml_value(s, "Encoding"))
}

/// GetStreamUri for a profile, with credentials injected into the URI.
///
/// The returned URI embeds the password and is for immediate pipeline use
/// only; callers must not log or persist it.
pub async fn get_stream_uri(
    media_url: &str,
    profile_token: &str,
    credentials: Option<&Credentials>,
    timeout_ms: u64,
) -> Result<String> {
    let body = soap_request(
        media_url,
        credentials,
        &soap::get_stream_uri_body(profile_token),
        timeout_ms,
    )
    .await?;

    let uri = xml::extract_xml_value(&body, "Uri")
        .ok_or_else(|| Error::Parse(format!("No stream URI for profile {}", profile_token)))?;

    Ok(inject_credentials(&uri, credentials))
}

/// Splice userinfo into an rtsp:// URI
fn inject_credentials(uri: &str, credentials: Option<&Credentials>) -> String {
    let Some(creds) = credentials else {
        return uri.to_string();
    };
    let Some(rest) = uri.strip_prefix("rtsp://") else {
        return uri.to_string();
    };
    format!("rtsp://{}:{}@{}", creds.username, creds.password, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_empty_segment_resolves_at_deadline() {
        let started = std::time::Instant::now();
        // Multicast may be unavailable in constrained environments; what
        // must never happen is a hang past the deadline.
        if let Ok(devices) = discover(300).await {
            assert!(devices.is_empty());
            assert!(started.elapsed() >= Duration::from_millis(250));
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_inject_credentials() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: "pw".to_string(),
        };
        assert_eq!(
            inject_credentials("rtsp://192.168.1.20:554/profile1", Some(&creds)),
            "rtsp://admin:pw@192.168.1.20:554/profile1"
        );
        assert_eq!(
            inject_credentials("rtsp://192.168.1.20/p", None),
            "rtsp://192.168.1.20/p"
        );
    }

    #[test]
    fn test_capabilities_sections() {
        let body = r#"<tds:Capabilities>
            <tt:Media><tt:XAddr>http://192.168.1.20/onvif/media</tt:XAddr></tt:Media>
            <tt:Events><tt:XAddr>http://192.168.1.20/onvif/events</tt:XAddr></tt:Events>
        </tds:Capabilities>"#;
        // extract_sections works on unprefixed matching via ":Media" fallback
        assert_eq!(
            section_xaddr(body, "Media"),
            Some("http://192.168.1.20/onvif/media".to_string())
        );
    }
}
