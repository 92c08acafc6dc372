//! Per-peer connection lifecycle
//!
//! One [`PeerSession`] per remote peer per world. The session owns its
//! transport and, while connected with inbound media, the positional audio
//! binding. Signaling is tolerant of the external channel's at-least-once,
//! unordered delivery: duplicate offers/answers are ignored, early ICE
//! candidates are buffered until a remote description exists, and
//! simultaneous offers resolve deterministically (the lexically smaller peer
//! ID's offer wins).

use crate::audio::AudioBinding;
use crate::signaling::{Signal, SignalEnvelope};
use crate::transport::{IceCandidate, PeerTransport, RemoteAudioSource, TransportEvent};
use crate::world::{WorldContext, WorldEvent};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Lifecycle state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no negotiation started
    Idle,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Transport is ready (data channel open or first media track received)
    Connected,
    /// Teardown in progress
    Closing,
    /// Terminal: all owned resources released
    Closed,
    /// Terminal until explicit removal or re-invite
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl SessionState {
    /// Whether the session will never progress again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Which side of the offer/answer exchange this session took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationRole {
    Offerer,
    Answerer,
}

/// Simultaneous-offer tie-break: the lexically smaller peer ID's offer wins.
fn remote_offer_wins(local_peer_id: &str, remote_peer_id: &str) -> bool {
    remote_peer_id < local_peer_id
}

/// One negotiated connection to a remote peer
pub struct PeerSession {
    peer_id: String,
    ctx: Arc<WorldContext>,
    transport: Arc<dyn PeerTransport>,
    state: RwLock<SessionState>,
    role: RwLock<Option<NegotiationRole>>,
    remote_description_set: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    audio: Mutex<Option<AudioBinding>>,
    offer_retried: AtomicBool,
}

impl PeerSession {
    /// Create a session and start its transport event pump
    ///
    /// When `initiate` is set, an offer is sent immediately; otherwise the
    /// session waits for the remote offer.
    pub(crate) async fn create(
        ctx: Arc<WorldContext>,
        peer_id: String,
        initiate: bool,
    ) -> Result<Arc<Self>> {
        let (transport, events) = ctx.transport.create(&ctx.config).await?;

        if let Some(track) = ctx.local_media.read().await.clone() {
            // Outbound media is best effort; a session without a sender is
            // still a usable data connection.
            if let Err(e) = transport.add_local_track(track).await {
                warn!(peer_id = %peer_id, "Failed to add local track: {e}");
            }
        }

        let session = Arc::new(Self {
            peer_id: peer_id.clone(),
            ctx,
            transport,
            state: RwLock::new(SessionState::Idle),
            role: RwLock::new(None),
            remote_description_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            audio: Mutex::new(None),
            offer_retried: AtomicBool::new(false),
        });

        session.spawn_event_pump(events);

        if initiate {
            if let Err(e) = session.send_offer().await {
                // The watchdog owns recovery from here (single re-offer,
                // then Failed).
                warn!(peer_id = %peer_id, "Initial offer failed: {e}");
            }
        }

        info!(peer_id = %session.peer_id, initiate, "Created peer session");
        Ok(session)
    }

    /// Remote peer this session is bound to
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    async fn set_state(&self, new_state: SessionState) {
        let mut state = self.state.write().await;
        if *state == new_state {
            return;
        }
        debug!(
            peer_id = %self.peer_id,
            from = %*state,
            to = %new_state,
            "Session state transition"
        );
        *state = new_state;
        drop(state);

        self.ctx.emit(WorldEvent::PeerStateChanged {
            peer_id: self.peer_id.clone(),
            state: new_state,
        });
    }

    /// Create and send an offer, arming the negotiation watchdog
    async fn send_offer(self: &Arc<Self>) -> Result<()> {
        *self.role.write().await = Some(NegotiationRole::Offerer);
        if self.state().await == SessionState::Idle {
            self.set_state(SessionState::Negotiating).await;
        }
        // Armed before the attempt so a failed offer still times out into
        // the retry-then-Failed path.
        self.arm_watchdog();

        let sdp = self.transport.create_offer().await.map_err(|e| {
            Error::negotiation(format!("create_offer for {}: {e}", self.peer_id))
        })?;

        self.ctx
            .signaling
            .send(SignalEnvelope::new(
                self.ctx.local_peer_id.clone(),
                self.peer_id.clone(),
                Signal::Offer { sdp },
            ))
            .await?;

        Ok(())
    }

    /// Handle a remote offer
    ///
    /// Duplicates and late offers are ignored; a glare (both sides offered)
    /// resolves by the lexical tie-break.
    pub(crate) async fn handle_offer(self: &Arc<Self>, sdp: String) -> Result<()> {
        let state = self.state().await;
        if state == SessionState::Connected || state.is_terminal() || state == SessionState::Closing
        {
            debug!(peer_id = %self.peer_id, %state, "Ignoring offer in settled state");
            return Ok(());
        }

        let role = *self.role.read().await;
        match role {
            Some(NegotiationRole::Offerer) => {
                if !remote_offer_wins(&self.ctx.local_peer_id, &self.peer_id) {
                    debug!(
                        peer_id = %self.peer_id,
                        "Simultaneous offers: keeping ours, remote will answer"
                    );
                    return Ok(());
                }
                debug!(
                    peer_id = %self.peer_id,
                    "Simultaneous offers: discarding ours, answering remote"
                );
            }
            Some(NegotiationRole::Answerer) => {
                if self.remote_description_set.load(Ordering::SeqCst) {
                    debug!(peer_id = %self.peer_id, "Ignoring duplicate offer");
                    return Ok(());
                }
            }
            None => {}
        }

        *self.role.write().await = Some(NegotiationRole::Answerer);
        self.set_state(SessionState::Negotiating).await;

        let answer = match self.transport.create_answer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                self.on_negotiation_failure(Error::negotiation(format!(
                    "create_answer for {}: {e}",
                    self.peer_id
                )))
                .await;
                return Ok(());
            }
        };

        self.remote_description_set.store(true, Ordering::SeqCst);
        self.flush_candidates().await;

        self.ctx
            .signaling
            .send(SignalEnvelope::new(
                self.ctx.local_peer_id.clone(),
                self.peer_id.clone(),
                Signal::Answer { sdp: answer },
            ))
            .await?;

        self.arm_watchdog();
        Ok(())
    }

    /// Handle a remote answer to our outstanding offer
    pub(crate) async fn handle_answer(self: &Arc<Self>, sdp: String) -> Result<()> {
        if self.remote_description_set.load(Ordering::SeqCst) {
            debug!(peer_id = %self.peer_id, "Ignoring duplicate answer");
            return Ok(());
        }

        let state = self.state().await;
        let role = *self.role.read().await;
        if state != SessionState::Negotiating || role != Some(NegotiationRole::Offerer) {
            warn!(
                peer_id = %self.peer_id,
                %state,
                "Dropping answer without matching outstanding offer"
            );
            return Ok(());
        }

        if let Err(e) = self.transport.set_answer(sdp).await {
            self.on_negotiation_failure(Error::negotiation(format!(
                "set_answer for {}: {e}",
                self.peer_id
            )))
            .await;
            return Ok(());
        }

        self.remote_description_set.store(true, Ordering::SeqCst);
        self.flush_candidates().await;
        Ok(())
    }

    /// Handle a remote ICE candidate, buffering until a remote description
    /// exists
    pub(crate) async fn handle_candidate(&self, candidate: IceCandidate) {
        if self.state().await.is_terminal() {
            debug!(peer_id = %self.peer_id, "Dropping candidate for terminal session");
            return;
        }

        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.pending_candidates.lock().await.push(candidate);
            return;
        }

        if let Err(e) = self.transport.add_ice_candidate(candidate).await {
            warn!(peer_id = %self.peer_id, "Failed to apply candidate: {e}");
        }
    }

    /// Apply candidates buffered before the remote description arrived
    async fn flush_candidates(&self) {
        let buffered: Vec<IceCandidate> =
            self.pending_candidates.lock().await.drain(..).collect();
        if buffered.is_empty() {
            return;
        }

        debug!(
            peer_id = %self.peer_id,
            count = buffered.len(),
            "Flushing buffered candidates"
        );
        for candidate in buffered {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!(peer_id = %self.peer_id, "Failed to apply buffered candidate: {e}");
            }
        }
    }

    /// Send an application message over this session's data channel
    pub(crate) async fn send_data(&self, payload: &[u8]) -> Result<()> {
        if self.state().await != SessionState::Connected {
            return Err(Error::invalid_state(format!(
                "peer {} is not connected",
                self.peer_id
            )));
        }
        self.transport.send_data(payload).await
    }

    /// Swap the outbound sender to a new local track
    pub(crate) async fn replace_local_track(
        &self,
        track: Arc<dyn crate::transport::LocalMediaTrack>,
    ) -> Result<()> {
        self.transport.replace_local_track(track).await
    }

    fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.handle_transport_event(event).await;
                if session.state().await.is_terminal() {
                    break;
                }
            }
            debug!(peer_id = %session.peer_id, "Transport event pump terminated");
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                let envelope = SignalEnvelope::new(
                    self.ctx.local_peer_id.clone(),
                    self.peer_id.clone(),
                    Signal::IceCandidate {
                        candidate: candidate.candidate,
                        sdp_mid: candidate.sdp_mid,
                        sdp_mline_index: candidate.sdp_mline_index,
                    },
                );
                if let Err(e) = self.ctx.signaling.send(envelope).await {
                    warn!(peer_id = %self.peer_id, "Failed to signal candidate: {e}");
                }
            }
            TransportEvent::DataChannelOpen => {
                self.mark_connected().await;
            }
            TransportEvent::TrackReceived(source) => {
                self.mark_connected().await;
                self.attach_audio(source).await;
            }
            TransportEvent::DataChannelClosed => {
                if !self.state().await.is_terminal() {
                    info!(peer_id = %self.peer_id, "Remote closed the connection");
                    self.shutdown().await;
                }
            }
            TransportEvent::DataChannelMessage(payload) => {
                debug!(
                    peer_id = %self.peer_id,
                    len = payload.len(),
                    "Data channel message"
                );
            }
            TransportEvent::NegotiationNeeded => {
                if self.state().await == SessionState::Idle {
                    if let Err(e) = self.send_offer().await {
                        warn!(peer_id = %self.peer_id, "Renegotiation offer failed: {e}");
                    }
                }
            }
            TransportEvent::Failed(reason) => {
                self.on_transport_failure(reason).await;
            }
        }
    }

    /// Transition to Connected exactly once
    async fn mark_connected(&self) {
        {
            let state = self.state.read().await;
            if !matches!(*state, SessionState::Idle | SessionState::Negotiating) {
                return;
            }
        }
        self.set_state(SessionState::Connected).await;
        info!(peer_id = %self.peer_id, "Peer connected");
    }

    /// Bind a positional sink to an inbound stream
    ///
    /// An unavailable audio context disables audio for this session only;
    /// the connection itself stays up.
    async fn attach_audio(&self, source: Arc<dyn RemoteAudioSource>) {
        if self.state().await != SessionState::Connected {
            return;
        }

        let mut audio = self.audio.lock().await;
        if audio.is_some() {
            debug!(peer_id = %self.peer_id, "Ignoring duplicate inbound stream");
            return;
        }

        let Some(sync) = self.ctx.audio_sync.as_ref() else {
            debug!(peer_id = %self.peer_id, "No audio listener; skipping sink");
            return;
        };

        match sync.attach(&self.peer_id, source).await {
            Ok(binding) => {
                // Teardown may have started while the sink was being
                // created; a binding stored now would outlive the session.
                if self.state().await != SessionState::Connected {
                    sync.detach(&binding);
                    return;
                }
                *audio = Some(binding);
            }
            Err(e) => {
                warn!(peer_id = %self.peer_id, "Audio disabled for session: {e}");
            }
        }
    }

    /// Release the audio binding, if any; idempotent
    async fn detach_audio(&self) {
        if let Some(binding) = self.audio.lock().await.take() {
            if let Some(sync) = self.ctx.audio_sync.as_ref() {
                sync.detach(&binding);
            }
        }
    }

    /// Watchdog: one automatic re-offer on timeout, then Failed
    fn arm_watchdog(self: &Arc<Self>) {
        let session = Arc::clone(self);
        let timeout = Duration::from_millis(session.ctx.config.negotiation_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            if session.state().await != SessionState::Negotiating {
                return;
            }

            let is_offerer = *session.role.read().await == Some(NegotiationRole::Offerer);
            if is_offerer && !session.offer_retried.swap(true, Ordering::SeqCst) {
                warn!(peer_id = %session.peer_id, "Negotiation timed out, re-offering once");
                session.remote_description_set.store(false, Ordering::SeqCst);
                if let Err(e) = session.send_offer().await {
                    warn!(peer_id = %session.peer_id, "Re-offer failed: {e}");
                }
            } else {
                session
                    .fail(Error::NegotiationTimeout(session.peer_id.clone()))
                    .await;
            }
        });
    }

    /// Negotiation-phase failure: single automatic re-offer, then Failed
    async fn on_negotiation_failure(self: &Arc<Self>, err: Error) {
        let is_offerer = *self.role.read().await == Some(NegotiationRole::Offerer);
        if is_offerer && !self.offer_retried.swap(true, Ordering::SeqCst) {
            warn!(peer_id = %self.peer_id, "Negotiation failed ({err}), re-offering once");
            self.remote_description_set.store(false, Ordering::SeqCst);
            if let Err(e) = self.send_offer().await {
                warn!(peer_id = %self.peer_id, "Re-offer failed: {e}");
            }
            return;
        }
        self.fail(err).await;
    }

    /// Transport failure routing: retry policy differs before and after
    /// the connection was ready
    async fn on_transport_failure(self: &Arc<Self>, reason: String) {
        match self.state().await {
            SessionState::Negotiating | SessionState::Idle => {
                self.on_negotiation_failure(Error::negotiation(reason)).await;
            }
            SessionState::Connected => {
                // Post-connect failures are not retried; the caller decides
                // whether to re-invite.
                self.fail(Error::transport(reason)).await;
            }
            _ => {}
        }
    }

    /// Move to Failed after releasing owned resources
    async fn fail(&self, err: Error) {
        if self.state().await.is_terminal() {
            return;
        }

        warn!(peer_id = %self.peer_id, "Session failed: {err}");
        self.detach_audio().await;
        if let Err(e) = self.transport.close().await {
            debug!(peer_id = %self.peer_id, "Transport close during failure: {e}");
        }
        self.set_state(SessionState::Failed).await;
        let _ = self.ctx.removals.send(RemovalNotice::failed(&self.peer_id));
    }

    /// Full teardown: job cancelled, sink released, transport closed
    ///
    /// Idempotent; callers may await it to observe that all resources are
    /// released the moment it returns.
    pub(crate) async fn shutdown(&self) {
        {
            let state = self.state.read().await;
            if state.is_terminal() || *state == SessionState::Closing {
                return;
            }
        }

        self.set_state(SessionState::Closing).await;
        self.detach_audio().await;
        if let Err(e) = self.transport.close().await {
            // Best effort: a failed transport close must not leak the rest.
            debug!(peer_id = %self.peer_id, "Transport close: {e}");
        }
        self.set_state(SessionState::Closed).await;
        let _ = self.ctx.removals.send(RemovalNotice::closed(&self.peer_id));
    }
}

/// Internal note from a session to its world that it reached a terminal state
#[derive(Debug, Clone)]
pub(crate) struct RemovalNotice {
    pub(crate) peer_id: String,
    pub(crate) remove_entry: bool,
}

impl RemovalNotice {
    fn closed(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            remove_entry: true,
        }
    }

    fn failed(peer_id: &str) -> Self {
        // Failed sessions stay in the map until the caller removes or
        // re-invites them.
        Self {
            peer_id: peer_id.to_string(),
            remove_entry: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tie_break_is_lexical() {
        // "a" wins over "b": b defers to the remote offer, a keeps its own.
        assert!(remote_offer_wins("b", "a"));
        assert!(!remote_offer_wins("a", "b"));
        assert!(!remote_offer_wins("a", "a"));
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Connected.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Negotiating.to_string(), "negotiating");
        assert_eq!(SessionState::Connected.to_string(), "connected");
    }
}
