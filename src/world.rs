//! World connection: the top-level handle over a peer mesh
//!
//! A [`WorldConnection`] owns one session per remote peer, the shared
//! presence store, the tick scheduler, and the world-state capture job. It
//! pumps inbound signals to the right session, reconciles the peer roster
//! against presence sync, and tears everything down on leave. Errors local
//! to one peer are reflected in that session's state and surfaced as
//! [`WorldEvent`]s rather than returned to the caller.

use crate::audio::{AudioListener, SpatialAudioSync};
use crate::capture::{CaptureStats, FrameCapture, TimeAuthority};
use crate::config::WorldConfig;
use crate::peer::{PeerSession, RemovalNotice, SessionState};
use crate::presence::{PresenceRecord, PresenceStore};
use crate::scheduler::TickScheduler;
use crate::signaling::{Signal, SignalEnvelope, SignalingChannel};
use crate::transport::{IceCandidate, LocalMediaTrack, TransportFactory};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Event emitted by a world connection
#[derive(Debug, Clone)]
pub enum WorldEvent {
    /// A peer session changed lifecycle state
    PeerStateChanged {
        /// Remote peer
        peer_id: String,
        /// New state
        state: SessionState,
    },
    /// The number of active sessions changed
    PeerCountChanged(usize),
}

/// External capabilities a world is built on
///
/// The engine consumes these seams and never implements them itself; the
/// crate ships production implementations for signaling and transport, and
/// the embedding environment supplies the rest.
pub struct WorldCapabilities {
    /// Outbound signaling channel
    pub signaling: Arc<dyn SignalingChannel>,
    /// Inbound signals addressed to this peer
    pub signals: mpsc::UnboundedReceiver<SignalEnvelope>,
    /// Per-peer transport factory
    pub transport: Arc<dyn TransportFactory>,
    /// Local listener context; `None` disables positional audio
    pub audio: Option<Arc<dyn AudioListener>>,
    /// Server time/capture authority; `None` disables world-state capture
    pub time_authority: Option<Arc<dyn TimeAuthority>>,
    /// Locally captured media track shared by every session
    pub local_media: Option<Arc<dyn LocalMediaTrack>>,
}

/// Shared state every peer session of one world hangs off of
pub(crate) struct WorldContext {
    pub(crate) config: WorldConfig,
    pub(crate) local_peer_id: String,
    pub(crate) signaling: Arc<dyn SignalingChannel>,
    pub(crate) transport: Arc<dyn TransportFactory>,
    pub(crate) audio_sync: Option<SpatialAudioSync>,
    pub(crate) audio_listener: Option<Arc<dyn AudioListener>>,
    pub(crate) presence: Arc<PresenceStore>,
    pub(crate) scheduler: Arc<TickScheduler>,
    pub(crate) local_media: RwLock<Option<Arc<dyn LocalMediaTrack>>>,
    pub(crate) events: mpsc::UnboundedSender<WorldEvent>,
    pub(crate) removals: mpsc::UnboundedSender<RemovalNotice>,
}

impl WorldContext {
    pub(crate) fn emit(&self, event: WorldEvent) {
        // The receiver may have been dropped by a caller that does not
        // consume events.
        let _ = self.events.send(event);
    }
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<PeerSession>>>>;

/// Handle to a joined world
pub struct WorldConnection {
    ctx: Arc<WorldContext>,
    sessions: SessionMap,
    capture: Option<Arc<FrameCapture>>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<WorldEvent>>>,
    pump: tokio::task::JoinHandle<()>,
}

impl WorldConnection {
    /// Join a world: validate config, wire up capabilities, start the
    /// signal pump and the capture job
    ///
    /// No sessions exist yet; peers are added by
    /// [`invite_peer`](WorldConnection::invite_peer), by roster sync, or by
    /// a remote offer.
    pub async fn join(config: WorldConfig, capabilities: WorldCapabilities) -> Result<Self> {
        config.validate()?;

        let local_peer_id = config
            .peer_id
            .clone()
            .unwrap_or_else(|| format!("peer-{}", uuid::Uuid::new_v4()));

        let scheduler = TickScheduler::new();
        let presence = PresenceStore::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();

        let audio_sync = capabilities.audio.as_ref().map(|listener| {
            SpatialAudioSync::new(
                Arc::clone(listener),
                Arc::clone(&scheduler),
                Arc::clone(&presence),
                Duration::from_millis(config.audio_update_interval_ms),
            )
        });

        let capture_interval = config.capture_interval_ms;
        let ctx = Arc::new(WorldContext {
            config,
            local_peer_id,
            signaling: capabilities.signaling,
            transport: capabilities.transport,
            audio_sync,
            audio_listener: capabilities.audio,
            presence,
            scheduler: Arc::clone(&scheduler),
            local_media: RwLock::new(capabilities.local_media),
            events: event_tx,
            removals: removal_tx,
        });

        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let pump = spawn_pump(
            Arc::clone(&ctx),
            Arc::clone(&sessions),
            capabilities.signals,
            removal_rx,
        );

        let capture = match capabilities.time_authority {
            Some(authority) => {
                let capture = FrameCapture::new(authority, capture_interval);
                capture.initialize().await?;
                capture.start(&scheduler).await;
                Some(capture)
            }
            None => None,
        };

        info!(
            world_id = %ctx.config.world_id,
            peer_id = %ctx.local_peer_id,
            "Joined world"
        );

        Ok(Self {
            ctx,
            sessions,
            capture,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            pump,
        })
    }

    /// Local peer's identifier in this world
    pub fn local_peer_id(&self) -> &str {
        &self.ctx.local_peer_id
    }

    /// Take the world event receiver; returns `None` on a second call
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<WorldEvent>> {
        self.event_rx
            .lock()
            .expect("event receiver lock poisoned")
            .take()
    }

    /// Number of active peer sessions
    pub async fn peer_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Lifecycle state of a peer's session, if one exists
    pub async fn peer_state(&self, peer_id: &str) -> Option<SessionState> {
        let session = self.sessions.read().await.get(peer_id).cloned();
        match session {
            Some(session) => Some(session.state().await),
            None => None,
        }
    }

    /// Stats of the world-state capture job, if capture is enabled
    pub async fn capture_stats(&self) -> Option<CaptureStats> {
        match &self.capture {
            Some(capture) => Some(capture.stats().await),
            None => None,
        }
    }

    /// Start a connection to a remote peer
    ///
    /// A peer already holding a live session is rejected; a peer whose
    /// previous session failed is torn down and re-invited.
    pub async fn invite_peer(&self, peer_id: &str) -> Result<()> {
        if peer_id == self.ctx.local_peer_id {
            return Err(Error::invalid_state("cannot invite the local peer"));
        }

        // Bound separately so the read guard is released before teardown
        // takes the write lock.
        let existing = self.sessions.read().await.get(peer_id).cloned();
        if let Some(existing) = existing {
            if existing.state().await != SessionState::Failed {
                return Err(Error::invalid_state(format!(
                    "session for {peer_id} already exists"
                )));
            }
            info!(peer_id, "Re-inviting failed peer");
            existing.shutdown().await;
            self.sessions.write().await.remove(peer_id);
        }

        create_session(&self.ctx, &self.sessions, peer_id, true).await?;
        Ok(())
    }

    /// Remove a peer, awaiting full teardown of its session
    ///
    /// When this returns, the session's audio job, sink and transport are
    /// all released.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;

        session.shutdown().await;
        self.ctx.presence.remove(peer_id).await;
        let count = self.sessions.read().await.len();
        self.ctx.emit(WorldEvent::PeerCountChanged(count));

        info!(peer_id, "Removed peer");
        Ok(())
    }

    /// Leave the world, cascading teardown to every session
    pub async fn leave(self) -> Result<()> {
        if let Some(capture) = &self.capture {
            capture.stop(&self.ctx.scheduler);
        }

        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.shutdown().await;
        }

        self.pump.abort();

        if let Some(listener) = &self.ctx.audio_listener {
            if let Err(e) = listener.close().await {
                warn!("Failed to close audio listener: {e}");
            }
        }

        info!(world_id = %self.ctx.config.world_id, "Left world");
        Ok(())
    }

    /// Send an application message to a connected peer
    pub async fn send_to(&self, peer_id: &str, payload: &[u8]) -> Result<()> {
        let session = self
            .sessions
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        session.send_data(payload).await
    }

    /// Report the local peer's pose
    pub async fn set_local_pose(&self, record: PresenceRecord) {
        self.ctx.presence.set_local(record).await;
    }

    /// Apply a presence update for a remote peer
    ///
    /// Returns `false` when the update was stale and discarded.
    pub async fn apply_presence(&self, peer_id: &str, record: PresenceRecord) -> bool {
        if peer_id == self.ctx.local_peer_id {
            self.ctx.presence.set_local(record).await;
            return true;
        }
        self.ctx.presence.apply(peer_id, record).await
    }

    /// Reconcile sessions against an authoritative peer roster
    ///
    /// Creates sessions for new roster entries (simultaneous offers from the
    /// other side resolve by the lexical tie-break), applies their presence,
    /// and tears down sessions for peers no longer listed.
    pub async fn sync_roster(&self, roster: &[(String, PresenceRecord)]) {
        for (peer_id, record) in roster {
            if peer_id == &self.ctx.local_peer_id {
                continue;
            }
            self.ctx.presence.apply(peer_id, *record).await;

            let known = self.sessions.read().await.contains_key(peer_id);
            if !known {
                if let Err(e) = create_session(&self.ctx, &self.sessions, peer_id, true).await {
                    warn!(peer_id = %peer_id, "Skipping roster peer: {e}");
                }
            }
        }

        let departed: Vec<Arc<PeerSession>> = {
            let mut sessions = self.sessions.write().await;
            let gone: Vec<String> = sessions
                .keys()
                .filter(|id| !roster.iter().any(|(peer_id, _)| peer_id == *id))
                .cloned()
                .collect();
            gone.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let any_departed = !departed.is_empty();
        for session in departed {
            info!(peer_id = session.peer_id(), "Peer left roster");
            session.shutdown().await;
            self.ctx.presence.remove(session.peer_id()).await;
        }
        if any_departed {
            let count = self.sessions.read().await.len();
            self.ctx.emit(WorldEvent::PeerCountChanged(count));
        }
    }

    /// Swap the shared local media track on every session
    ///
    /// One sender failing does not roll back the others; per-peer failures
    /// are returned alongside the peers they belong to.
    pub async fn replace_local_track(
        &self,
        track: Arc<dyn LocalMediaTrack>,
    ) -> Vec<(String, Error)> {
        *self.ctx.local_media.write().await = Some(Arc::clone(&track));

        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.read().await.values().cloned().collect();

        let mut failures = Vec::new();
        for session in sessions {
            if let Err(e) = session.replace_local_track(Arc::clone(&track)).await {
                warn!(peer_id = session.peer_id(), "Track replacement failed: {e}");
                failures.push((session.peer_id().to_string(), e));
            }
        }
        failures
    }
}

/// Insert a new session, enforcing the mesh size limit
///
/// The write lock is held across creation so a concurrent invite and an
/// inbound offer for the same peer cannot both pass the checks and leave one
/// session silently displaced.
async fn create_session(
    ctx: &Arc<WorldContext>,
    sessions: &SessionMap,
    peer_id: &str,
    initiate: bool,
) -> Result<Arc<PeerSession>> {
    let mut map = sessions.write().await;
    if map.contains_key(peer_id) {
        return Err(Error::invalid_state(format!(
            "session for {peer_id} already exists"
        )));
    }
    if map.len() >= ctx.config.max_peers as usize {
        return Err(Error::MaxPeersReached(ctx.config.max_peers));
    }

    let session = PeerSession::create(Arc::clone(ctx), peer_id.to_string(), initiate).await?;
    map.insert(peer_id.to_string(), Arc::clone(&session));
    let count = map.len();
    drop(map);

    ctx.emit(WorldEvent::PeerCountChanged(count));
    Ok(session)
}

/// Pump inbound signals and session removal notices
fn spawn_pump(
    ctx: Arc<WorldContext>,
    sessions: SessionMap,
    mut signals: mpsc::UnboundedReceiver<SignalEnvelope>,
    mut removals: mpsc::UnboundedReceiver<RemovalNotice>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = signals.recv() => match maybe {
                    Some(envelope) => dispatch_signal(&ctx, &sessions, envelope).await,
                    None => break,
                },
                maybe = removals.recv() => match maybe {
                    Some(notice) => handle_removal(&ctx, &sessions, notice).await,
                    None => break,
                },
            }
        }
        debug!(world_id = %ctx.config.world_id, "Signal pump stopped");
    })
}

/// Route one inbound signal to its session
async fn dispatch_signal(ctx: &Arc<WorldContext>, sessions: &SessionMap, envelope: SignalEnvelope) {
    if envelope.to != ctx.local_peer_id {
        debug!(
            to = %envelope.to,
            kind = envelope.signal.kind(),
            "Dropping signal addressed to another peer"
        );
        return;
    }

    let from = envelope.from;
    let session = sessions.read().await.get(&from).cloned();

    match envelope.signal {
        Signal::Offer { sdp } => {
            let session = match session {
                Some(session) => session,
                None => {
                    // A remote offer is how an invited peer first appears
                    // on this side.
                    match create_session(ctx, sessions, &from, false).await {
                        Ok(session) => session,
                        Err(e) => {
                            warn!(peer_id = %from, "Rejecting inbound offer: {e}");
                            return;
                        }
                    }
                }
            };
            if let Err(e) = session.handle_offer(sdp).await {
                warn!(peer_id = %from, "Offer handling failed: {e}");
            }
        }
        Signal::Answer { sdp } => {
            let Some(session) = session else {
                warn!(peer_id = %from, "Dropping answer with no active session");
                return;
            };
            if let Err(e) = session.handle_answer(sdp).await {
                warn!(peer_id = %from, "Answer handling failed: {e}");
            }
        }
        Signal::IceCandidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        } => {
            let Some(session) = session else {
                // Candidates for a torn-down session keep trickling in for a
                // while; they are not an error.
                warn!(peer_id = %from, "Dropping candidate with no active session");
                return;
            };
            session
                .handle_candidate(IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                })
                .await;
        }
    }
}

/// Act on a session's terminal-state notice
async fn handle_removal(ctx: &Arc<WorldContext>, sessions: &SessionMap, notice: RemovalNotice) {
    if !notice.remove_entry {
        // Failed sessions stay visible until the caller removes or
        // re-invites them.
        return;
    }

    let removed = sessions.write().await.remove(&notice.peer_id);
    if removed.is_some() {
        ctx.presence.remove(&notice.peer_id).await;
        let count = sessions.read().await.len();
        ctx.emit(WorldEvent::PeerCountChanged(count));
        debug!(peer_id = %notice.peer_id, "Session entry removed");
    }
}
