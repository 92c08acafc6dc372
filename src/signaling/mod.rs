//! Signaling protocol and transport seam
//!
//! The engine never owns the signaling transport; it consumes a
//! [`SignalingChannel`] for outbound signals and an mpsc receiver of
//! [`SignalEnvelope`]s for inbound ones. Delivery is at-least-once and
//! unordered, so every consumer of these messages tolerates duplicates and
//! reordering. A WebSocket-backed channel is provided in [`client`].

pub mod client;
pub mod protocol;

pub use client::WsSignalingClient;
pub use protocol::{Signal, SignalEnvelope};

use crate::Result;
use async_trait::async_trait;

/// Outbound half of the signaling transport
///
/// Implementations relay an envelope to the peer named in `envelope.to`.
/// Failures are transient ([`Error::Signaling`](crate::Error::Signaling));
/// the engine logs them and relies on at-least-once delivery rather than
/// retrying.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Relay one signal to its target peer
    async fn send(&self, envelope: SignalEnvelope) -> Result<()>;
}
