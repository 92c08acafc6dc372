//! World-state capture paced by the tick scheduler
//!
//! Periodically asks the external time authority for the current server time
//! and triggers a state capture, keeping running stats. The cadence comes
//! from the authority when it supplies one, otherwise from configuration;
//! the scheduler itself is agnostic to either.

use crate::scheduler::{JobId, TickFn, TickScheduler};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// External time/capture authority capability
#[async_trait]
pub trait TimeAuthority: Send + Sync {
    /// Current authoritative server time
    async fn server_time(&self) -> Result<SystemTime>;

    /// Trigger one world-state capture
    async fn capture_state(&self) -> Result<()>;

    /// Target capture interval in milliseconds, if the authority defines one
    async fn tick_interval_ms(&self) -> Result<Option<f64>>;
}

/// Running statistics of the capture job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureStats {
    /// Captures completed since the job started
    pub frame_count: u64,
    /// Server time observed at the most recent successful capture
    pub last_server_time: Option<SystemTime>,
    /// Target cadence in milliseconds
    pub target_interval_ms: f64,
}

struct CaptureState {
    frame_count: u64,
    last_server_time: Option<SystemTime>,
    target_interval_ms: f64,
}

/// Scheduler-driven world-state capture job
pub struct FrameCapture {
    authority: Arc<dyn TimeAuthority>,
    state: Arc<RwLock<CaptureState>>,
    job: std::sync::Mutex<Option<JobId>>,
}

impl FrameCapture {
    /// Create a capture job with a fallback cadence
    pub fn new(authority: Arc<dyn TimeAuthority>, fallback_interval_ms: f64) -> Arc<Self> {
        Arc::new(Self {
            authority,
            state: Arc::new(RwLock::new(CaptureState {
                frame_count: 0,
                last_server_time: None,
                target_interval_ms: fallback_interval_ms,
            })),
            job: std::sync::Mutex::new(None),
        })
    }

    /// Fetch the target interval and initial server time from the authority
    ///
    /// Keeps the fallback interval when the authority does not define one.
    pub async fn initialize(&self) -> Result<()> {
        let initial_time = self.authority.server_time().await?;
        let interval = self.authority.tick_interval_ms().await?;

        let mut state = self.state.write().await;
        state.last_server_time = Some(initial_time);
        if let Some(ms) = interval {
            state.target_interval_ms = ms;
        }

        debug!(
            target_interval_ms = state.target_interval_ms,
            "Initialized frame capture"
        );
        Ok(())
    }

    /// Register the recurring capture job with the scheduler
    ///
    /// A second call while the job is running is a no-op.
    pub async fn start(self: &Arc<Self>, scheduler: &Arc<TickScheduler>) {
        let interval_ms = self.state.read().await.target_interval_ms;

        let mut job = self.job.lock().expect("capture job lock poisoned");
        if job.is_some() {
            warn!("Frame capture already running");
            return;
        }

        let this = Arc::clone(self);
        let tick: TickFn = Arc::new(move || {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.capture_once().await;
            })
        });

        *job = Some(scheduler.schedule(Duration::from_secs_f64(interval_ms / 1000.0), tick));
        debug!(interval_ms, "Started frame capture job");
    }

    /// Cancel the recurring job; idempotent
    pub fn stop(&self, scheduler: &TickScheduler) {
        if let Some(id) = self
            .job
            .lock()
            .expect("capture job lock poisoned")
            .take()
        {
            scheduler.cancel(id);
            debug!("Stopped frame capture job");
        }
    }

    /// Current stats snapshot
    pub async fn stats(&self) -> CaptureStats {
        let state = self.state.read().await;
        CaptureStats {
            frame_count: state.frame_count,
            last_server_time: state.last_server_time,
            target_interval_ms: state.target_interval_ms,
        }
    }

    /// One capture: read server time, trigger capture, update stats
    ///
    /// Failures are logged and skipped; the job keeps its cadence.
    async fn capture_once(&self) {
        let started = tokio::time::Instant::now();

        let server_time = match self.authority.server_time().await {
            Ok(t) => t,
            Err(e) => {
                error!("Failed to get server time: {e}");
                return;
            }
        };

        if let Err(e) = self.authority.capture_state().await {
            error!("Frame capture failed: {e}");
            return;
        }

        let mut state = self.state.write().await;
        state.last_server_time = Some(server_time);
        state.frame_count += 1;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if elapsed_ms > state.target_interval_ms {
            warn!(
                elapsed_ms,
                target_ms = state.target_interval_ms,
                "Capture overran its target interval"
            );
        }
    }
}
