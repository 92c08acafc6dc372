//! Spatial audio synchronization
//!
//! Binds each connected peer's inbound media stream to a positional sink and
//! keeps the sink's position/orientation equal to the peer's presence
//! relative to the local peer. The refresh runs as a recurring job on the
//! world's [`TickScheduler`]; sink and job are created and destroyed together
//! as one [`AudioBinding`], so a session can never hold one without the
//! other.

use crate::presence::{PresenceStore, Vec3};
use crate::scheduler::{JobId, TickFn, TickScheduler};
use crate::transport::RemoteAudioSource;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Panning algorithm of a positional sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanningModel {
    /// Head-related transfer function (default)
    Hrtf,
    /// Simple equal-power panning
    EqualPower,
}

/// Distance attenuation curve of a positional sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceModel {
    /// Inverse rolloff (default)
    Inverse,
    /// Linear rolloff
    Linear,
    /// Exponential rolloff
    Exponential,
}

/// Fixed rolloff/cone parameters for every positional sink
///
/// Configuration constants, not runtime-tunable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialSinkConfig {
    /// Panning algorithm
    pub panning_model: PanningModel,
    /// Distance attenuation curve
    pub distance_model: DistanceModel,
    /// Distance at which attenuation starts
    pub ref_distance: f32,
    /// Distance beyond which volume no longer drops
    pub max_distance: f32,
    /// Attenuation rate
    pub rolloff_factor: f32,
    /// Inner cone angle in degrees
    pub cone_inner_angle: f32,
    /// Outer cone angle in degrees
    pub cone_outer_angle: f32,
    /// Gain outside the outer cone
    pub cone_outer_gain: f32,
}

impl Default for SpatialSinkConfig {
    fn default() -> Self {
        Self {
            panning_model: PanningModel::Hrtf,
            distance_model: DistanceModel::Inverse,
            ref_distance: 1.0,
            max_distance: 10_000.0,
            rolloff_factor: 1.0,
            cone_inner_angle: 360.0,
            cone_outer_angle: 0.0,
            cone_outer_gain: 0.0,
        }
    }
}

/// Lifecycle state of the listener context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Context is processing audio
    Running,
    /// Context exists but is not processing; a resume may revive it
    Suspended,
    /// Context is gone for good
    Closed,
}

/// Local listener context capability
///
/// Implemented by the embedding environment; the engine only drives it.
#[async_trait]
pub trait AudioListener: Send + Sync {
    /// Current context state
    fn state(&self) -> ListenerState;

    /// Attempt to resume a suspended context
    async fn resume(&self) -> Result<()>;

    /// Close the context; called once when the world is left
    async fn close(&self) -> Result<()>;

    /// Create a positional sink fed by `source`
    async fn create_sink(
        &self,
        source: Arc<dyn RemoteAudioSource>,
        config: &SpatialSinkConfig,
    ) -> Result<Arc<dyn SpatialSink>>;
}

/// One positional audio sink
///
/// Parameter updates take effect immediately (no interpolation or ramping).
/// `disconnect` must be idempotent.
pub trait SpatialSink: Send + Sync {
    /// Set the sink's position relative to the listener
    fn set_position(&self, position: Vec3);

    /// Set the sink's orientation relative to the listener
    fn set_orientation(&self, orientation: Vec3);

    /// Release the sink and stop playback
    fn disconnect(&self);
}

/// A sink and the scheduler job that keeps it positioned
///
/// The two are created and destroyed together; holding a binding is exactly
/// holding both.
pub struct AudioBinding {
    pub(crate) sink: Arc<dyn SpatialSink>,
    pub(crate) job: JobId,
}

impl AudioBinding {
    /// Scheduler job backing this binding
    pub fn job_id(&self) -> JobId {
        self.job
    }
}

/// Keeps positional sinks synchronized to presence state
pub struct SpatialAudioSync {
    listener: Arc<dyn AudioListener>,
    scheduler: Arc<TickScheduler>,
    presence: Arc<PresenceStore>,
    interval: Duration,
    sink_config: SpatialSinkConfig,
}

impl SpatialAudioSync {
    /// Create a synchronizer over the world's listener, scheduler and store
    pub fn new(
        listener: Arc<dyn AudioListener>,
        scheduler: Arc<TickScheduler>,
        presence: Arc<PresenceStore>,
        interval: Duration,
    ) -> Self {
        Self {
            listener,
            scheduler,
            presence,
            interval,
            sink_config: SpatialSinkConfig::default(),
        }
    }

    /// Create a sink for a peer's inbound stream and start its refresh job
    ///
    /// # Errors
    ///
    /// [`Error::AudioContextUnavailable`] when the listener context is closed
    /// or cannot be resumed. Callers disable audio for that session rather
    /// than failing it.
    pub async fn attach(
        &self,
        peer_id: &str,
        source: Arc<dyn RemoteAudioSource>,
    ) -> Result<AudioBinding> {
        match self.listener.state() {
            ListenerState::Closed => {
                return Err(Error::AudioContextUnavailable(
                    "listener context is closed".to_string(),
                ));
            }
            ListenerState::Suspended => {
                self.listener.resume().await.map_err(|e| {
                    Error::AudioContextUnavailable(format!("resume failed: {e}"))
                })?;
            }
            ListenerState::Running => {}
        }

        let sink = self
            .listener
            .create_sink(Arc::clone(&source), &self.sink_config)
            .await?;

        let job = self.schedule_refresh(peer_id, Arc::clone(&sink));
        debug!(peer_id, stream = source.stream_id(), "Attached spatial sink");

        Ok(AudioBinding { sink, job })
    }

    /// Cancel a binding's refresh job and release its sink; idempotent
    pub fn detach(&self, binding: &AudioBinding) {
        self.scheduler.cancel(binding.job);
        binding.sink.disconnect();
    }

    fn schedule_refresh(&self, peer_id: &str, sink: Arc<dyn SpatialSink>) -> JobId {
        let listener = Arc::clone(&self.listener);
        let scheduler = Arc::clone(&self.scheduler);
        let presence = Arc::clone(&self.presence);
        let peer_id = peer_id.to_string();
        let job_cell: Arc<OnceLock<JobId>> = Arc::new(OnceLock::new());
        let resume_attempted = Arc::new(AtomicBool::new(false));

        let tick: TickFn = {
            let job_cell = Arc::clone(&job_cell);
            Arc::new(move || {
                let listener = Arc::clone(&listener);
                let scheduler = Arc::clone(&scheduler);
                let presence = Arc::clone(&presence);
                let sink = Arc::clone(&sink);
                let peer_id = peer_id.clone();
                let job_cell = Arc::clone(&job_cell);
                let resume_attempted = Arc::clone(&resume_attempted);
                Box::pin(async move {
                    refresh_tick(
                        &listener,
                        &scheduler,
                        &presence,
                        &sink,
                        &peer_id,
                        &job_cell,
                        &resume_attempted,
                    )
                    .await;
                })
            })
        };

        let job = self.scheduler.schedule(self.interval, tick);
        // The closure reads the id back to be able to cancel itself.
        let _ = job_cell.set(job);
        job
    }
}

/// One refresh: check the context, read both presence records, update the sink
async fn refresh_tick(
    listener: &Arc<dyn AudioListener>,
    scheduler: &Arc<TickScheduler>,
    presence: &Arc<PresenceStore>,
    sink: &Arc<dyn SpatialSink>,
    peer_id: &str,
    job_cell: &Arc<OnceLock<JobId>>,
    resume_attempted: &Arc<AtomicBool>,
) {
    let cancel_self = |reason: &str| {
        warn!(peer_id, reason, "Stopping audio refresh job");
        if let Some(id) = job_cell.get() {
            scheduler.cancel(*id);
        }
    };

    match listener.state() {
        ListenerState::Running => {}
        ListenerState::Closed => {
            cancel_self("listener context closed");
            return;
        }
        ListenerState::Suspended => {
            // One resume attempt per binding; after that the job stops
            // ticking against a dead context.
            if resume_attempted.swap(true, Ordering::SeqCst) {
                cancel_self("listener context still suspended");
                return;
            }
            if listener.resume().await.is_err() {
                cancel_self("listener resume failed");
                return;
            }
        }
    }

    let (Some(local), Some(remote)) = (presence.local().await, presence.peer(peer_id).await)
    else {
        // Presence has not arrived yet; leave the sink stale until it does.
        return;
    };

    sink.set_position(remote.position - local.position);
    sink.set_orientation(remote.orientation - local.orientation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceRecord;
    use std::sync::Mutex;

    struct FakeSink {
        positions: Mutex<Vec<Vec3>>,
        orientations: Mutex<Vec<Vec3>>,
        disconnected: AtomicBool,
    }

    impl FakeSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                positions: Mutex::new(Vec::new()),
                orientations: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            })
        }
    }

    impl SpatialSink for FakeSink {
        fn set_position(&self, position: Vec3) {
            self.positions.lock().unwrap().push(position);
        }

        fn set_orientation(&self, orientation: Vec3) {
            self.orientations.lock().unwrap().push(orientation);
        }

        fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    struct FakeListener {
        state: Mutex<ListenerState>,
        sink: Arc<FakeSink>,
        resume_ok: bool,
        resume_calls: AtomicBool,
    }

    impl FakeListener {
        fn new(state: ListenerState, sink: Arc<FakeSink>, resume_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
                sink,
                resume_ok,
                resume_calls: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl AudioListener for FakeListener {
        fn state(&self) -> ListenerState {
            *self.state.lock().unwrap()
        }

        async fn resume(&self) -> Result<()> {
            self.resume_calls.store(true, Ordering::SeqCst);
            if self.resume_ok {
                *self.state.lock().unwrap() = ListenerState::Running;
                Ok(())
            } else {
                Err(Error::AudioContextUnavailable("no user gesture".to_string()))
            }
        }

        async fn close(&self) -> Result<()> {
            *self.state.lock().unwrap() = ListenerState::Closed;
            Ok(())
        }

        async fn create_sink(
            &self,
            _source: Arc<dyn RemoteAudioSource>,
            _config: &SpatialSinkConfig,
        ) -> Result<Arc<dyn SpatialSink>> {
            Ok(Arc::clone(&self.sink) as Arc<dyn SpatialSink>)
        }
    }

    struct FakeSource;

    impl RemoteAudioSource for FakeSource {
        fn stream_id(&self) -> &str {
            "stream-1"
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn sync_with(listener: Arc<FakeListener>, presence: Arc<PresenceStore>) -> SpatialAudioSync {
        SpatialAudioSync::new(
            listener,
            TickScheduler::new(),
            presence,
            Duration::from_millis(100),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_writes_relative_pose() {
        let sink = FakeSink::new();
        let listener = FakeListener::new(ListenerState::Running, Arc::clone(&sink), true);
        let presence = PresenceStore::new();
        presence
            .set_local(PresenceRecord::new(
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                1,
            ))
            .await;
        presence
            .apply(
                "peer-b",
                PresenceRecord::new(Vec3::new(4.0, 2.0, 0.0), Vec3::new(0.0, 0.0, 1.0), 1),
            )
            .await;

        let sync = sync_with(listener, Arc::clone(&presence));
        let binding = sync.attach("peer-b", Arc::new(FakeSource)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let positions = sink.positions.lock().unwrap().clone();
        assert!(!positions.is_empty());
        assert_eq!(positions[0], Vec3::new(3.0, 2.0, 0.0));
        let orientations = sink.orientations.lock().unwrap().clone();
        assert_eq!(orientations[0], Vec3::new(0.0, -1.0, 1.0));

        sync.detach(&binding);
        assert!(sink.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skips_when_presence_missing() {
        let sink = FakeSink::new();
        let listener = FakeListener::new(ListenerState::Running, Arc::clone(&sink), true);
        let presence = PresenceStore::new();

        let sync = sync_with(listener, presence);
        let binding = sync.attach("peer-b", Arc::new(FakeSource)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(sink.positions.lock().unwrap().is_empty());

        sync.detach(&binding);
    }

    #[tokio::test]
    async fn test_attach_fails_on_closed_context() {
        let sink = FakeSink::new();
        let listener = FakeListener::new(ListenerState::Closed, Arc::clone(&sink), true);
        let sync = sync_with(listener, PresenceStore::new());

        let result = sync.attach("peer-b", Arc::new(FakeSource)).await;
        assert!(matches!(result, Err(Error::AudioContextUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_context_cancels_own_job_after_failed_resume() {
        let sink = FakeSink::new();
        let listener = FakeListener::new(ListenerState::Running, Arc::clone(&sink), false);
        let sync = sync_with(Arc::clone(&listener), PresenceStore::new());
        let scheduler = Arc::clone(&sync.scheduler);

        let binding = sync.attach("peer-b", Arc::new(FakeSource)).await.unwrap();
        assert!(scheduler.is_scheduled(binding.job_id()));

        // Context suspends after attach; the next tick tries one resume,
        // fails, and cancels the job itself.
        *listener.state.lock().unwrap() = ListenerState::Suspended;
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(!scheduler.is_scheduled(binding.job_id()));
        assert!(listener.resume_calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_context_recovers_after_resume() {
        let sink = FakeSink::new();
        let listener = FakeListener::new(ListenerState::Suspended, Arc::clone(&sink), true);
        let presence = PresenceStore::new();
        presence.set_local(PresenceRecord::default()).await;
        presence.apply("peer-b", PresenceRecord::default()).await;

        let sync = sync_with(Arc::clone(&listener), presence);
        let binding = sync.attach("peer-b", Arc::new(FakeSource)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(listener.state(), ListenerState::Running);
        assert!(!sink.positions.lock().unwrap().is_empty());

        sync.detach(&binding);
    }
}
