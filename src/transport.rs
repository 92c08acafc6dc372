//! Transport capability seam
//!
//! The lifecycle manager negotiates over these traits and never touches a
//! concrete WebRTC stack directly; the production implementation lives in
//! [`rtc`](crate::rtc) and tests substitute in-memory doubles. Each peer
//! session owns exactly one [`PeerTransport`] plus the event receiver its
//! factory returned.

use crate::config::WorldConfig;
use crate::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Trickled ICE candidate payload
#[derive(Debug, Clone, PartialEq)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// Media stream identification tag, if known
    pub sdp_mid: Option<String>,
    /// Index of the media description the candidate belongs to
    pub sdp_mline_index: Option<u16>,
}

/// Handle to an inbound media stream, opaque to the engine
///
/// The audio listener implementation downcasts via [`as_any`]
/// (`RemoteAudioSource::as_any`) to recover its backend's concrete type.
pub trait RemoteAudioSource: Send + Sync {
    /// Stable identifier of the underlying stream
    fn stream_id(&self) -> &str;

    /// Backend downcast hook
    fn as_any(&self) -> &dyn Any;
}

/// Handle to a locally captured media track, opaque to the engine
///
/// Shared read-only across every session of one world; sessions add their
/// own sender referencing the same track and never mutate it.
pub trait LocalMediaTrack: Send + Sync {
    /// Stable identifier of the underlying track
    fn track_id(&self) -> &str;

    /// Backend downcast hook
    fn as_any(&self) -> &dyn Any;
}

/// Event emitted by a peer transport
pub enum TransportEvent {
    /// A local ICE candidate is ready to be signaled to the remote peer
    IceCandidate(IceCandidate),
    /// The data channel opened; the transport is ready
    DataChannelOpen,
    /// The data channel closed (remote-initiated close)
    DataChannelClosed,
    /// An application message arrived on the data channel
    DataChannelMessage(Vec<u8>),
    /// An inbound media stream arrived
    TrackReceived(Arc<dyn RemoteAudioSource>),
    /// The transport wants a fresh offer (e.g. after a track was added)
    NegotiationNeeded,
    /// The transport failed and will not recover on its own
    Failed(String),
}

impl TransportEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::IceCandidate(_) => "ice_candidate",
            TransportEvent::DataChannelOpen => "data_channel_open",
            TransportEvent::DataChannelClosed => "data_channel_closed",
            TransportEvent::DataChannelMessage(_) => "data_channel_message",
            TransportEvent::TrackReceived(_) => "track_received",
            TransportEvent::NegotiationNeeded => "negotiation_needed",
            TransportEvent::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// One bidirectional peer transport: a data channel plus optional media
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a local offer and return its SDP
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and return the SDP of a local answer
    async fn create_answer(&self, remote_offer: String) -> Result<String>;

    /// Apply a remote answer to a previously created offer
    async fn set_answer(&self, remote_answer: String) -> Result<()>;

    /// Apply a remote ICE candidate
    ///
    /// Callers must only invoke this after a remote description is set; the
    /// session buffers earlier candidates.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach an outbound sender referencing a shared local track
    async fn add_local_track(&self, track: Arc<dyn LocalMediaTrack>) -> Result<()>;

    /// Swap this transport's outbound sender to a new track
    async fn replace_local_track(&self, track: Arc<dyn LocalMediaTrack>) -> Result<()>;

    /// Send an application message over the data channel
    async fn send_data(&self, payload: &[u8]) -> Result<()>;

    /// Close the transport; idempotent
    async fn close(&self) -> Result<()>;
}

/// Creates one transport per remote peer from the world's ICE configuration
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport and the stream of its lifecycle events
    async fn create(
        &self,
        config: &WorldConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)>;
}
