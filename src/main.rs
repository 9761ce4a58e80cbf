//! CamHub - Unified Camera Core
//!
//! Main entry point.

use camhub::companion::CompanionGateway;
use camhub::events::EventBus;
use camhub::recording::RecordingCoordinator;
use camhub::registry::{DeviceRegistry, RegistryConfig};
use camhub::secrets::SecretStore;
use camhub::state::{AppConfig, AppState};
use camhub::storage::{StorageManager, StoragePolicy, SystemStorageInspector};
use camhub::stream::StreamCoordinator;
use camhub::web_api;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camhub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CamHub v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        recording_dir = %config.recording_dir.display(),
        scan_range = ?config.scan_range,
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.recording_dir).await?;

    let events = Arc::new(EventBus::default());
    let secrets = Arc::new(SecretStore::new());
    let gateway = Arc::new(CompanionGateway::new());

    let registry = Arc::new(DeviceRegistry::new(
        RegistryConfig {
            scan_range: config.scan_range.clone(),
            discovery_interval: config.discovery_interval(),
        },
        events.clone(),
        gateway.clone(),
        secrets.clone(),
    ));

    let streams = Arc::new(StreamCoordinator::new(
        secrets.clone(),
        gateway.clone(),
        events.clone(),
    ));

    let storage = Arc::new(StorageManager::new(
        StoragePolicy {
            primary_path: config.recording_dir.clone(),
            min_free_space_gb: config.min_free_space_gb,
            recycle_oldest: config.recycle_oldest,
            max_storage_gb: config.max_storage_gb,
        },
        Box::new(SystemStorageInspector),
    ));

    let recordings = Arc::new(RecordingCoordinator::new(
        streams.clone(),
        storage.clone(),
        events.clone(),
        config.max_concurrent_recordings,
    ));

    registry.start_discovery().await?;
    tracing::info!("Discovery running");

    let state = AppState {
        config: config.clone(),
        events,
        secrets,
        gateway,
        registry,
        streams,
        recordings,
        storage,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = web_api::create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(addr = %addr, "Listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
