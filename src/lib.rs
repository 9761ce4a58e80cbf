//! CamHub - Unified Camera Core
//!
//! Unifies cameras reachable through incompatible transports into a single
//! device registry and drives concurrent live streaming and on-disk
//! recording for any subset of them.
//!
//! ## Architecture (8 Components)
//!
//! 1. LocalCaptureProbe - attached capture hardware enumeration
//! 2. NetworkProbe - RTSP/HTTP-snapshot address-range sweep
//! 3. OnvifDiscovery - WS-Discovery multicast + SOAP introspection
//! 4. CompanionGateway - inbound mobile-device camera connections
//! 5. DeviceRegistry - merged device table, the single query surface
//! 6. StreamCoordinator - per-device live pipelines
//! 7. RecordingCoordinator - rotation-aware persistent capture
//! 8. WebApi - command surface consumed by the presentation layer
//!
//! ## Design Principles
//!
//! - DeviceRegistry is the single source of truth for "what cameras exist"
//! - One typed event channel per component, no ambient global bus
//! - Credentials live behind SecretStore handles, injected at point of use

pub mod companion;
pub mod device;
pub mod error;
pub mod events;
pub mod local_probe;
pub mod models;
pub mod network_probe;
pub mod onvif;
pub mod recording;
pub mod registry;
pub mod secrets;
pub mod snapshot;
pub mod state;
pub mod storage;
pub mod stream;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
