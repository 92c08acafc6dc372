//! Multi-peer real-time connection engine with spatial audio synchronization
//!
//! This crate connects a local peer to a mesh of remote peers, keeps a
//! positional audio sink per connected peer synchronized to shared presence
//! state, and paces periodic work (audio refresh, world-state capture) with
//! a drift-corrected scheduler.
//!
//! # Features
//!
//! - **Multi-peer mesh topology**: Up to 10 simultaneous peer connections
//! - **Tolerant signaling**: Duplicate, reordered and early-arriving signals
//!   are absorbed; simultaneous offers resolve deterministically
//! - **Presence-driven spatial audio**: One positional sink per peer, kept
//!   at the peer's pose relative to the local listener
//! - **Drift-corrected scheduling**: Periodic jobs hold their cadence under
//!   jitter and recover from stalls without catch-up bursts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  WorldConnection                                     │
//! │  ├─ SignalingChannel (WebSocket client provided)     │
//! │  ├─ PeerSession per remote peer                      │
//! │  │   ├─ PeerTransport (WebRTC provided)              │
//! │  │   └─ AudioBinding (sink + refresh job)            │
//! │  ├─ PresenceStore (poses, last-write-wins)           │
//! │  ├─ TickScheduler (drift-corrected jobs)             │
//! │  └─ FrameCapture (server-paced world snapshots)      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use spatial_mesh::{
//!     RtcTransportFactory, WorldCapabilities, WorldConfig, WorldConnection,
//!     WsSignalingClient,
//! };
//!
//! let config = WorldConfig {
//!     world_id: "lobby".to_string(),
//!     ..Default::default()
//! };
//!
//! let (signaling, signals) = WsSignalingClient::connect("ws://localhost:8080").await?;
//! let world = WorldConnection::join(
//!     config,
//!     WorldCapabilities {
//!         signaling: std::sync::Arc::new(signaling),
//!         signals,
//!         transport: RtcTransportFactory::new(),
//!         audio: None,
//!         time_authority: None,
//!         local_media: None,
//!     },
//! )
//! .await?;
//!
//! world.invite_peer("peer-abc123").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod presence;
pub mod rtc;
pub mod scheduler;
pub mod signaling;
pub mod transport;
pub mod world;

// Internal modules
mod peer;

// Re-exports for public API
pub use audio::{
    AudioBinding, AudioListener, DistanceModel, ListenerState, PanningModel, SpatialSink,
    SpatialSinkConfig,
};
pub use capture::{CaptureStats, FrameCapture, TimeAuthority};
pub use config::{TurnServerConfig, WorldConfig};
pub use error::{Error, Result};
pub use peer::SessionState;
pub use presence::{PresenceRecord, PresenceStore, Vec3};
pub use rtc::{RtcLocalAudioTrack, RtcTransportFactory};
pub use scheduler::{JobId, TickScheduler};
pub use signaling::{Signal, SignalEnvelope, SignalingChannel, WsSignalingClient};
pub use transport::{
    IceCandidate, LocalMediaTrack, PeerTransport, RemoteAudioSource, TransportEvent,
    TransportFactory,
};
pub use world::{WorldCapabilities, WorldConnection, WorldEvent};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
