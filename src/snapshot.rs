//! Still-frame capture for any registered camera
//!
//! RTSP/ONVIF/local sources go through a one-frame ffmpeg run; HTTP
//! cameras are fetched from their snapshot endpoint directly.

use crate::device::{ConnectionDescriptor, Device};
use crate::error::{Error, Result};
use crate::onvif;
use crate::secrets::{Credentials, SecretStore};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const SOAP_TIMEOUT_MS: u64 = 5000;

/// Capture a single JPEG frame from a device
pub async fn capture_snapshot(device: &Device, secrets: &SecretStore) -> Result<Vec<u8>> {
    match &device.descriptor {
        ConnectionDescriptor::Local { system_path } => {
            ffmpeg_one_frame(&[
                "-f".into(),
                "v4l2".into(),
                "-i".into(),
                system_path.clone(),
            ])
            .await
        }
        ConnectionDescriptor::Rtsp {
            host,
            port,
            path,
            credentials,
        } => {
            let creds = resolve(secrets, credentials.as_ref()).await;
            let url = match &creds {
                Some(c) => format!("rtsp://{}:{}@{}:{}{}", c.username, c.password, host, port, path),
                None => format!("rtsp://{}:{}{}", host, port, path),
            };
            ffmpeg_one_frame(&[
                "-rtsp_transport".into(),
                "tcp".into(),
                "-i".into(),
                url,
            ])
            .await
        }
        ConnectionDescriptor::Onvif {
            service_url,
            credentials,
            ..
        } => {
            let creds = resolve(secrets, credentials.as_ref()).await;
            let caps = onvif::get_capabilities(service_url, creds.as_ref(), SOAP_TIMEOUT_MS).await;
            let media_url = caps.media_xaddr.unwrap_or_else(|| service_url.clone());
            let profiles = onvif::get_profiles(&media_url, creds.as_ref(), SOAP_TIMEOUT_MS).await?;
            let uri = onvif::get_stream_uri(
                &media_url,
                &profiles[0].token,
                creds.as_ref(),
                SOAP_TIMEOUT_MS,
            )
            .await?;
            ffmpeg_one_frame(&["-rtsp_transport".into(), "tcp".into(), "-i".into(), uri]).await
        }
        ConnectionDescriptor::Http {
            host,
            port,
            snapshot_path,
            credentials,
        } => {
            let path = snapshot_path.as_deref().unwrap_or("/snapshot.jpg");
            let url = format!("http://{}:{}{}", host, port, path);
            let creds = resolve(secrets, credentials.as_ref()).await;

            let client = reqwest::Client::builder().timeout(SNAPSHOT_TIMEOUT).build()?;
            let mut request = client.get(&url);
            if let Some(c) = &creds {
                request = request.basic_auth(&c.username, Some(&c.password));
            }
            let resp = request.send().await?;
            if !resp.status().is_success() {
                return Err(Error::Transport(format!(
                    "Snapshot endpoint returned {} for {}",
                    resp.status(),
                    device.id
                )));
            }
            Ok(resp.bytes().await?.to_vec())
        }
        ConnectionDescriptor::Companion { .. } => Err(Error::Validation(format!(
            "Snapshots for {} come from its live stream",
            device.id
        ))),
    }
}

async fn resolve(
    secrets: &SecretStore,
    handle: Option<&crate::secrets::SecretHandle>,
) -> Option<Credentials> {
    match handle {
        Some(h) => secrets.resolve(h).await,
        None => None,
    }
}

/// Run ffmpeg for exactly one output frame, JPEG on stdout.
/// Input args may embed credentials and are never logged.
async fn ffmpeg_one_frame(input_args: &[String]) -> Result<Vec<u8>> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    args.extend_from_slice(input_args);
    args.extend([
        "-frames:v".into(),
        "1".into(),
        "-f".into(),
        "image2".into(),
        "-c:v".into(),
        "mjpeg".into(),
        "pipe:1".into(),
    ]);

    let child = Command::new("ffmpeg")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Pipeline(format!("Failed to spawn ffmpeg: {}", e)))?;

    let output = tokio::time::timeout(SNAPSHOT_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| Error::Transport("Snapshot capture timed out".into()))??;

    if !output.status.success() || output.stdout.is_empty() {
        return Err(Error::Pipeline(format!(
            "Snapshot capture failed with status {:?}",
            output.status.code()
        )));
    }

    debug!(bytes = output.stdout.len(), "Snapshot captured");
    Ok(output.stdout)
}
