//! WebRTC-backed peer transport
//!
//! Production implementation of [`TransportFactory`] and [`PeerTransport`]
//! over `webrtc`. Each transport wraps one `RTCPeerConnection` carrying a
//! reliable "data" channel plus an optional Opus audio sender; connection
//! callbacks are translated into [`TransportEvent`]s so the lifecycle
//! manager never sees the stack directly.

use crate::config::WorldConfig;
use crate::transport::{
    IceCandidate, LocalMediaTrack, PeerTransport, RemoteAudioSource, TransportEvent,
    TransportFactory,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const DATA_CHANNEL_LABEL: &str = "data";

/// Locally captured Opus audio track
///
/// One instance is shared read-only across every session of a world; each
/// transport adds its own sender referencing it.
pub struct RtcLocalAudioTrack {
    track: Arc<TrackLocalStaticSample>,
}

impl RtcLocalAudioTrack {
    /// Create an Opus track with the given track ID
    pub fn new(track_id: &str) -> Arc<Self> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_owned(),
                ..Default::default()
            },
            track_id.to_owned(),
            "spatial-mesh".to_owned(),
        ));
        Arc::new(Self { track })
    }

    /// Underlying sample track, for feeding captured audio into
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl LocalMediaTrack for RtcLocalAudioTrack {
    fn track_id(&self) -> &str {
        self.track.id()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Inbound remote audio track
pub struct RtcRemoteAudioSource {
    track: Arc<TrackRemote>,
    stream_id: String,
}

impl RtcRemoteAudioSource {
    fn new(track: Arc<TrackRemote>) -> Arc<Self> {
        let stream_id = track.stream_id();
        Arc::new(Self { track, stream_id })
    }

    /// Underlying remote track, for reading RTP out of
    pub fn track(&self) -> Arc<TrackRemote> {
        Arc::clone(&self.track)
    }
}

impl RemoteAudioSource for RtcRemoteAudioSource {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates one [`RtcPeerTransport`] per remote peer
pub struct RtcTransportFactory;

impl RtcTransportFactory {
    /// Create a factory
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &WorldConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = RtcPeerTransport::new(config, events_tx).await?;
        Ok((transport as Arc<dyn PeerTransport>, events_rx))
    }
}

/// One `RTCPeerConnection` with a data channel and optional audio sender
///
/// The connection is replaceable: answering while a local offer is pending
/// (simultaneous offers resolved against us) swaps in a fresh one, since the
/// stack cannot roll back a local description.
pub struct RtcPeerTransport {
    ice_servers: Vec<RTCIceServer>,
    peer_connection: RwLock<Arc<RTCPeerConnection>>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    // Retained so the sender is not dropped and to allow track replacement.
    audio_sender: RwLock<Option<Arc<RTCRtpSender>>>,
    // Retained to re-attach the sender after a connection swap.
    audio_track: RwLock<Option<Arc<TrackLocalStaticSample>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

impl RtcPeerTransport {
    async fn new(
        config: &WorldConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<Self>> {
        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        let peer_connection = build_connection(&ice_servers).await?;
        let data_channel = Arc::new(RwLock::new(None));
        wire_connection(&peer_connection, &events, &data_channel);

        Ok(Arc::new(Self {
            ice_servers,
            peer_connection: RwLock::new(peer_connection),
            data_channel,
            audio_sender: RwLock::new(None),
            audio_track: RwLock::new(None),
            events,
            closed: AtomicBool::new(false),
        }))
    }

    async fn connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&*self.peer_connection.read().await)
    }

    /// Create the offerer-side data channel if none exists yet
    async fn ensure_data_channel(&self) -> Result<()> {
        let pc = self.connection().await;
        let mut slot = self.data_channel.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let channel = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| Error::transport(format!("Failed to create data channel: {e}")))?;

        wire_data_channel(&channel, &self.events);
        *slot = Some(channel);
        Ok(())
    }

    /// Swap in a fresh connection, discarding the pending local offer
    ///
    /// Used on the losing side of simultaneous offers: the remote offer must
    /// be answered, but the connection sits in have-local-offer and the stack
    /// has no rollback. The outbound audio sender is re-attached to the new
    /// connection; the data channel arrives from the remote offerer.
    async fn restart_connection(&self) -> Result<()> {
        let fresh = build_connection(&self.ice_servers).await?;
        wire_connection(&fresh, &self.events, &self.data_channel);

        *self.data_channel.write().await = None;
        *self.audio_sender.write().await = None;

        let old = std::mem::replace(
            &mut *self.peer_connection.write().await,
            Arc::clone(&fresh),
        );
        if let Err(e) = old.close().await {
            debug!("Closing superseded connection: {e}");
        }

        if let Some(track) = self.audio_track.read().await.clone() {
            let sender = fresh
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::transport(format!("Failed to re-add track: {e}")))?;
            *self.audio_sender.write().await = Some(sender);
        }
        Ok(())
    }
}

async fn build_connection(ice_servers: &[RTCIceServer]) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Error::transport(format!("Failed to register codecs: {e}")))?;

    let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
        .map_err(|e| Error::transport(format!("Failed to register interceptors: {e}")))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(interceptor_registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: ice_servers.to_vec(),
        ..Default::default()
    };

    let peer_connection = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(|e| Error::transport(format!("Failed to create peer connection: {e}")))?;
    Ok(Arc::new(peer_connection))
}

fn wire_connection(
    peer_connection: &Arc<RTCPeerConnection>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    data_channel: &Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
) {
    {
        let events = events.clone();
        peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(TransportEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    }
                })
            }));

    }

    {
        let events = events.clone();
        peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    debug!("Peer connection state: {state}");
                    if state == RTCPeerConnectionState::Failed {
                        let _ = events.send(TransportEvent::Failed(
                            "peer connection entered failed state".to_string(),
                        ));
                    }
                })
            }));
    }

    {
        let events = events.clone();
        peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        debug!("Ignoring non-audio remote track");
                        return;
                    }
                    info!(stream = %track.stream_id(), "Remote audio track added");
                    let _ = events.send(TransportEvent::TrackReceived(
                        RtcRemoteAudioSource::new(track) as Arc<dyn RemoteAudioSource>,
                    ));
                })
            }));
    }

    // The answering side receives the channel the offerer created.
    {
        let events = events.clone();
        let slot = Arc::clone(data_channel);
        peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let events = events.clone();
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    debug!(label = channel.label(), "Data channel announced");
                    wire_data_channel(&channel, &events);
                    *slot.write().await = Some(channel);
                })
            }));
    }

    {
        let events = events.clone();
        peer_connection
            .on_negotiation_needed(Box::new(move || {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(TransportEvent::NegotiationNeeded);
                })
            }));
    }
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    channel.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::DataChannelOpen);
        })
    }));

    let tx = events.clone();
    channel.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::DataChannelClosed);
        })
    }));

    let tx = events.clone();
    channel.on_message(Box::new(move |msg| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::DataChannelMessage(msg.data.to_vec()));
        })
    }));

    if channel.ready_state() == RTCDataChannelState::Open {
        let _ = events.send(TransportEvent::DataChannelOpen);
    }
}

fn downcast_local(track: &Arc<dyn LocalMediaTrack>) -> Result<Arc<TrackLocalStaticSample>> {
    track
        .as_any()
        .downcast_ref::<RtcLocalAudioTrack>()
        .map(RtcLocalAudioTrack::sample_track)
        .ok_or_else(|| Error::transport("local track is not an RtcLocalAudioTrack"))
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<String> {
        self.ensure_data_channel().await?;
        let pc = self.connection().await;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::transport(format!("Failed to create offer: {e}")))?;

        pc.set_local_description(offer)
            .await
            .map_err(|e| Error::transport(format!("Failed to set local description: {e}")))?;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::transport("no local description after setting offer"))?;

        Ok(local.sdp)
    }

    async fn create_answer(&self, remote_offer: String) -> Result<String> {
        // The glare loser still holds its own pending offer; the remote one
        // cannot be applied over it, so start over on a fresh connection.
        if self.connection().await.signaling_state() == RTCSignalingState::HaveLocalOffer {
            debug!("Discarding pending local offer before answering");
            self.restart_connection().await?;
        }
        let pc = self.connection().await;

        let offer = RTCSessionDescription::offer(remote_offer)
            .map_err(|e| Error::transport(format!("Invalid offer SDP: {e}")))?;

        pc.set_remote_description(offer)
            .await
            .map_err(|e| Error::transport(format!("Failed to set remote description: {e}")))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::transport(format!("Failed to create answer: {e}")))?;

        pc.set_local_description(answer)
            .await
            .map_err(|e| Error::transport(format!("Failed to set local description: {e}")))?;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::transport("no local description after setting answer"))?;

        Ok(local.sdp)
    }

    async fn set_answer(&self, remote_answer: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(remote_answer)
            .map_err(|e| Error::transport(format!("Invalid answer SDP: {e}")))?;

        self.connection()
            .await
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::transport(format!("Failed to set remote description: {e}")))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        self.connection()
            .await
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::transport(format!("Failed to add ICE candidate: {e}")))
    }

    async fn add_local_track(&self, track: Arc<dyn LocalMediaTrack>) -> Result<()> {
        let sample_track = downcast_local(&track)?;

        let sender = self
            .connection()
            .await
            .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::transport(format!("Failed to add track: {e}")))?;

        *self.audio_sender.write().await = Some(sender);
        *self.audio_track.write().await = Some(sample_track);
        debug!(track = track.track_id(), "Added local audio track");
        Ok(())
    }

    async fn replace_local_track(&self, track: Arc<dyn LocalMediaTrack>) -> Result<()> {
        let sample_track = downcast_local(&track)?;

        let sender = self.audio_sender.read().await.clone();
        let Some(sender) = sender else {
            // No sender yet; attach one instead of replacing.
            return self.add_local_track(track).await;
        };

        sender
            .replace_track(Some(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::transport(format!("Failed to replace track: {e}")))?;

        *self.audio_track.write().await = Some(sample_track);
        debug!(track = track.track_id(), "Replaced local audio track");
        Ok(())
    }

    async fn send_data(&self, payload: &[u8]) -> Result<()> {
        let channel = self.data_channel.read().await.clone();
        let Some(channel) = channel else {
            return Err(Error::invalid_state("data channel not established"));
        };
        if channel.ready_state() != RTCDataChannelState::Open {
            return Err(Error::invalid_state("data channel not open"));
        }

        channel
            .send(&Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| Error::transport(format!("Failed to send data: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(channel) = self.data_channel.write().await.take() {
            if let Err(e) = channel.close().await {
                debug!("Data channel close: {e}");
            }
        }

        self.connection()
            .await
            .close()
            .await
            .map_err(|e| Error::transport(format!("Failed to close connection: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;

    fn test_config() -> WorldConfig {
        WorldConfig::default()
    }

    #[tokio::test]
    async fn test_factory_creates_transport() {
        let factory = RtcTransportFactory::new();
        let (transport, _events) = factory.create(&test_config()).await.unwrap();

        // Close must be idempotent.
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_contains_data_channel_media() {
        let factory = RtcTransportFactory::new();
        let (transport, _events) = factory.create(&test_config()).await.unwrap();

        let sdp = transport.create_offer().await.unwrap();
        assert!(sdp.contains("application"), "offer lacks data channel m-line");

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_transports() {
        let factory = RtcTransportFactory::new();
        let (offerer, mut offerer_events) = factory.create(&test_config()).await.unwrap();
        let (answerer, _answerer_events) = factory.create(&test_config()).await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        let answer = answerer.create_answer(offer).await.unwrap();
        offerer.set_answer(answer).await.unwrap();

        // Local candidates must surface as events once descriptions are set.
        let event = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            offerer_events.recv(),
        )
        .await
        .expect("no transport event within deadline")
        .expect("event channel closed");
        assert!(matches!(
            event,
            TransportEvent::IceCandidate(_) | TransportEvent::NegotiationNeeded
        ));

        offerer.close().await.unwrap();
        answerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_discards_pending_local_offer() {
        let factory = RtcTransportFactory::new();
        let (a, _a_events) = factory.create(&test_config()).await.unwrap();
        let (b, _b_events) = factory.create(&test_config()).await.unwrap();

        // Simultaneous offers: both sides offered, then "a" loses the
        // tie-break and must answer "b"'s offer instead of keeping its own.
        let _discarded = a.create_offer().await.unwrap();
        let offer = b.create_offer().await.unwrap();

        let answer = a.create_answer(offer).await.unwrap();
        b.set_answer(answer).await.unwrap();

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_data_requires_open_channel() {
        let factory = RtcTransportFactory::new();
        let (transport, _events) = factory.create(&test_config()).await.unwrap();

        let result = transport.send_data(b"hello").await;
        assert!(matches!(result, Err(Error::InvalidState(_))));

        transport.close().await.unwrap();
    }

    #[test]
    fn test_local_track_downcast() {
        let track = RtcLocalAudioTrack::new("mic");
        let as_dyn: Arc<dyn LocalMediaTrack> = track;
        assert!(downcast_local(&as_dyn).is_ok());
        assert_eq!(as_dyn.track_id(), "mic");
    }
}
