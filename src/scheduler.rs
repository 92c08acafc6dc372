//! Drift-corrected tick scheduler
//!
//! A single reusable timing primitive: fires a callback at a target cadence
//! while compensating for execution jitter. Each job runs on its own tokio
//! task, so a slow tick delays only that job's next fire. The same primitive
//! paces both the per-peer audio refresh and world-state capture; it is
//! agnostic to where the interval comes from and what the callback does.
//!
//! Accounting per fire: `drift += delta - interval` where `delta` is the time
//! since the previous fire (callback execution included), and the next fire
//! is delayed by `max(0, interval - drift)`. After the delay is computed,
//! drift is reset to zero whenever `|drift| > 2 * interval`: a long stall
//! such as a suspended process yields a single immediate catch-up fire, then
//! the cadence resumes without a burst.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::trace;

/// Handle to a scheduled recurring job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

/// Callback invoked on every tick of a job
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-world scheduler for drift-corrected recurring jobs
pub struct TickScheduler {
    jobs: Arc<Mutex<HashMap<JobId, watch::Sender<bool>>>>,
    next_id: AtomicU64,
}

impl TickScheduler {
    /// Create an empty scheduler
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// Begin firing `tick` approximately every `interval`
    ///
    /// The first fire happens one interval after this call. At most one
    /// invocation of `tick` is in flight at a time: the next fire is
    /// scheduled only after the previous invocation returns.
    pub fn schedule(&self, interval: Duration, tick: TickFn) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        self.jobs
            .lock()
            .expect("scheduler jobs lock poisoned")
            .insert(id, cancel_tx);

        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let interval_ms = interval.as_secs_f64() * 1000.0;
            let mut drift_ms = 0.0f64;
            let mut last_fire = Instant::now();
            let mut delay = interval;

            loop {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = cancel_rx.changed() => break,
                }

                let now = Instant::now();
                let delta_ms = now.duration_since(last_fire).as_secs_f64() * 1000.0;
                last_fire = now;

                tick().await;

                // The callback may have cancelled its own job.
                if *cancel_rx.borrow() {
                    break;
                }

                drift_ms += delta_ms - interval_ms;
                delay = Duration::from_secs_f64((interval_ms - drift_ms).max(0.0) / 1000.0);

                // Reset after the delay: one immediate catch-up fire after a
                // stall, then back on cadence instead of bursting.
                if drift_ms.abs() > 2.0 * interval_ms {
                    trace!(job = id.0, drift_ms, "Resetting accumulated drift");
                    drift_ms = 0.0;
                }
            }

            jobs.lock().expect("scheduler jobs lock poisoned").remove(&id);
            trace!(job = id.0, "Tick job stopped");
        });

        id
    }

    /// Stop future firings of a job
    ///
    /// Idempotent, and safe to call from within the job's own callback: the
    /// current invocation runs to completion and no further fire is
    /// scheduled.
    pub fn cancel(&self, id: JobId) {
        if let Some(tx) = self
            .jobs
            .lock()
            .expect("scheduler jobs lock poisoned")
            .remove(&id)
        {
            // The task may already have exited on its own; ignore send errors.
            let _ = tx.send(true);
        }
    }

    /// Whether a job is still registered
    pub fn is_scheduled(&self, id: JobId) -> bool {
        self.jobs
            .lock()
            .expect("scheduler jobs lock poisoned")
            .contains_key(&id)
    }

    /// Number of registered jobs
    pub fn job_count(&self) -> usize {
        self.jobs.lock().expect("scheduler jobs lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    fn counting_tick(counter: Arc<AtomicUsize>) -> TickFn {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_target_cadence() {
        let scheduler = TickScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let id = scheduler.schedule(Duration::from_millis(100), counting_tick(Arc::clone(&count)));

        tokio::time::sleep(Duration::from_millis(1050)).await;
        scheduler.cancel(id);

        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_firing() {
        let scheduler = TickScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        let id = scheduler.schedule(Duration::from_millis(100), counting_tick(Arc::clone(&count)));
        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.cancel(id);
        let at_cancel = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), at_cancel);
        assert!(!scheduler.is_scheduled(id));

        // Cancelling again is a no-op.
        scheduler.cancel(id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_from_within_callback() {
        let scheduler = TickScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let job_cell: Arc<std::sync::OnceLock<JobId>> = Arc::new(std::sync::OnceLock::new());

        let tick: TickFn = {
            let scheduler = Arc::clone(&scheduler);
            let count = Arc::clone(&count);
            let job_cell = Arc::clone(&job_cell);
            Arc::new(move || {
                let scheduler = Arc::clone(&scheduler);
                let count = Arc::clone(&count);
                let job_cell = Arc::clone(&job_cell);
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    if let Some(id) = job_cell.get() {
                        scheduler.cancel(*id);
                    }
                })
            })
        };

        let id = scheduler.schedule(Duration::from_millis(50), tick);
        job_cell.set(id).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_reset_after_stall() {
        let scheduler = TickScheduler::new();
        let fire_times: Arc<AsyncMutex<Vec<Instant>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let stalled = Arc::new(AtomicUsize::new(0));

        // The second tick stalls for 5000ms; the scheduler must not follow it
        // with a rapid-fire catch-up burst.
        let tick: TickFn = {
            let fire_times = Arc::clone(&fire_times);
            let stalled = Arc::clone(&stalled);
            Arc::new(move || {
                let fire_times = Arc::clone(&fire_times);
                let stalled = Arc::clone(&stalled);
                Box::pin(async move {
                    fire_times.lock().await.push(Instant::now());
                    if stalled.fetch_add(1, Ordering::SeqCst) == 1 {
                        tokio::time::sleep(Duration::from_millis(5000)).await;
                    }
                })
            })
        };

        let id = scheduler.schedule(Duration::from_millis(100), tick);
        tokio::time::sleep(Duration::from_millis(5600)).await;
        scheduler.cancel(id);

        let times = fire_times.lock().await;
        assert!(times.len() >= 5, "expected recovery fires, got {}", times.len());

        // The stall drives the delay to zero exactly once (the catch-up
        // fire); after that drift is reset and the cadence holds, with no
        // further rapid fires.
        let catch_up = times[3].duration_since(times[2]);
        assert!(
            catch_up <= Duration::from_millis(5),
            "catch-up fire was delayed by {:?}",
            catch_up
        );
        let gap_after_reset = times[4].duration_since(times[3]);
        assert!(
            gap_after_reset >= Duration::from_millis(95),
            "gap after drift reset was {:?}",
            gap_after_reset
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_does_not_accumulate() {
        let scheduler = TickScheduler::new();
        let fire_times: Arc<AsyncMutex<Vec<Instant>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let jitter = [5u64, 3, 0, 4, 2, 5, 1, 0, 3, 2];
        let index = Arc::new(AtomicUsize::new(0));

        let tick: TickFn = {
            let fire_times = Arc::clone(&fire_times);
            let index = Arc::clone(&index);
            Arc::new(move || {
                let fire_times = Arc::clone(&fire_times);
                let index = Arc::clone(&index);
                Box::pin(async move {
                    fire_times.lock().await.push(Instant::now());
                    let i = index.fetch_add(1, Ordering::SeqCst);
                    let ms = jitter[i % jitter.len()];
                    if ms > 0 {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                })
            })
        };

        let interval = Duration::from_secs_f64(16.67 / 1000.0);
        let start = Instant::now();
        let id = scheduler.schedule(interval, tick);
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.cancel(id);

        let times = fire_times.lock().await;
        assert!(times.len() >= 10);

        // Cumulative schedule of the 10th fire stays within one interval of
        // the ideal 10 * 16.67ms.
        let ideal = interval * 10;
        let actual = times[9].duration_since(start);
        let divergence = if actual > ideal { actual - ideal } else { ideal - actual };
        assert!(
            divergence <= interval,
            "cumulative divergence {:?} exceeds one interval",
            divergence
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_are_independent() {
        let scheduler = TickScheduler::new();
        let fast = Arc::new(AtomicUsize::new(0));
        let slow_fires = Arc::new(AtomicUsize::new(0));

        // Slow job: every fire takes 300ms.
        let slow_tick: TickFn = {
            let slow_fires = Arc::clone(&slow_fires);
            Arc::new(move || {
                let slow_fires = Arc::clone(&slow_fires);
                Box::pin(async move {
                    slow_fires.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                })
            })
        };

        let slow_id = scheduler.schedule(Duration::from_millis(100), slow_tick);
        let fast_id =
            scheduler.schedule(Duration::from_millis(100), counting_tick(Arc::clone(&fast)));

        tokio::time::sleep(Duration::from_millis(1050)).await;
        scheduler.cancel(slow_id);
        scheduler.cancel(fast_id);

        // The stalling job must not slow down its sibling.
        assert_eq!(fast.load(Ordering::SeqCst), 10);
        assert!(slow_fires.load(Ordering::SeqCst) < 10);
    }
}
