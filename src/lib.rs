//! Virtual AirPlay receivers for speakers you can only reach through a backend
//!
//! Each registered virtual device is announced on the local network as an
//! AirPlay receiver. Playback commands that arrive on its control connection
//! are relayed to the real speaker through one of two backends:
//!
//! - the Alexa cloud API (OAuth credentials, device discovery, directives)
//! - the Home Assistant REST API (`media_player` entities and services)
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use alexa_airplay_bridge::{BridgeContext, Config, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Arc::new(BridgeContext::build(Config::load()?)?);
//!     ctx.registry.add("Kitchen Echo")?;
//!
//!     let runtime = Runtime::start(ctx).await?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Credentials**: OAuth token exchange, refresh and persistence
//! - **Discovery**: multi-endpoint backend device listing and normalization
//! - **Registry**: virtual device to backend entity mapping with live state
//! - **Advertiser**: one mDNS record per virtual device
//! - **Session / Server**: RTSP control connections
//! - **Bridge**: control verbs to backend calls
//! - **Audio**: inbound media buffer and playback poller
//! - **Worker / Runtime**: periodic refresh tasks and process wiring

mod advertiser;
mod audio;
mod backend;
mod bridge;
mod config;
mod context;
mod credentials;
mod discovery;
mod error;
mod events;
mod home_assistant;
mod protocol;
mod registry;
mod rtsp;
mod runtime;
mod server;
mod session;
mod storage;
mod types;
mod worker;

// Public exports
pub use advertiser::{advertise_ip, instance_name, txt_properties, ServiceAdvertiser, SERVICE_TYPE};
pub use audio::{AudioStreamBuffer, PlaybackPoller};
pub use backend::{AlexaBackend, PlaybackBackend};
pub use bridge::{CommandBridge, CommandOutcome};
pub use config::{BackendKind, Config};
pub use context::BridgeContext;
pub use credentials::{Credential, CredentialManager, OAuthSettings};
pub use discovery::{normalize_devices, DiscoveryClient, DEVICE_ENDPOINTS};
pub use error::{BridgeError, Result};
pub use events::{RegistryEvent, RegistryReceiver};
pub use home_assistant::{EntityState, HaClient, HomeAssistantBackend};
pub use protocol::Directive;
pub use registry::{clamp_volume, derive_id, DeviceRegistry};
pub use rtsp::{Method, RtspRequest, RtspResponse};
pub use runtime::Runtime;
pub use server::RtspServer;
pub use session::{handle_connection, ControlSession, SessionState};
pub use storage::Storage;
pub use types::{
    BackendDeviceRecord, DeviceId, DeviceKind, PlaybackState, RemoteState, Verb, VirtualDevice,
    VolumePercent,
};
pub use worker::{DeviceRefreshTask, PeriodicTask, TokenRefreshTask, Worker};
