//! Background warm and tune cycles.
//!
//! `CacheMaintenance` owns the two periodic jobs. Each cycle holds a guard so a
//! manual trigger returns `Skipped` while the same cycle is already running,
//! and the loops stop on an explicit shutdown signal.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::middleware::ResponseCache;
use super::tracker::WarmReport;
use super::ttl::{TtlWeights, TuneOutcome};

/// Result of a cycle that may have been skipped because another was in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum CycleOutcome<T> {
    Completed(T),
    Skipped,
}

impl<T> CycleOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleIntervals {
    pub warm: Duration,
    pub tune: Duration,
}

/// Warm and tune cycles over one `ResponseCache`.
pub struct CacheMaintenance {
    cache: Arc<ResponseCache>,
    warming: AtomicBool,
    tuning: AtomicBool,
}

impl CacheMaintenance {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self {
            cache,
            warming: AtomicBool::new(false),
            tuning: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Warm the hottest entries, then decay hit counts.
    ///
    /// `Completed(None)` means warming is disabled.
    pub async fn warm_once(&self) -> CycleOutcome<Option<WarmReport>> {
        let Some(_guard) = CycleGuard::acquire(&self.warming) else {
            debug!("warm cycle already running, skipping");
            return CycleOutcome::Skipped;
        };

        let tracker = self.cache.tracker();
        let report = tracker.warm_cache(self.cache.store().as_ref()).await;

        let factor = self.cache.config().decay_factor;
        if report.is_some() && factor < 1.0 {
            let dropped = tracker.decay(factor);
            debug!(factor, dropped, "access counts decayed");
        }
        CycleOutcome::Completed(report)
    }

    /// Generate an efficiency report and run one auto-tune step.
    pub async fn tune_once(&self) -> CycleOutcome<TuneOutcome> {
        let Some(_guard) = CycleGuard::acquire(&self.tuning) else {
            debug!("tune cycle already running, skipping");
            return CycleOutcome::Skipped;
        };

        let report = self.cache.monitor().generate_report().await;
        let outcome = self.cache.ttl().auto_tune_weights(&report);
        if outcome.success {
            self.persist_weights();
        } else {
            debug!(reason = outcome.reason.as_deref().unwrap_or_default(), "ttl tuning skipped");
        }
        CycleOutcome::Completed(outcome)
    }

    pub fn reset_weights(&self) -> TtlWeights {
        let weights = self.cache.ttl().reset_weights();
        self.persist_weights();
        weights
    }

    /// Load persisted weights when a path is configured. Failures keep the defaults.
    pub fn load_weights(&self) {
        let Some(path) = self.weights_path() else {
            return;
        };
        if let Err(err) = self.cache.ttl().load_weights(path) {
            warn!(path = %path.display(), error = %err, "failed to load ttl weights, using defaults");
        }
    }

    fn persist_weights(&self) {
        let Some(path) = self.weights_path() else {
            return;
        };
        if let Err(err) = self.cache.ttl().persist_weights(path) {
            warn!(path = %path.display(), error = %err, "failed to persist ttl weights");
        }
    }

    fn weights_path(&self) -> Option<&Path> {
        self.cache.config().ttl.weights_path.as_deref()
    }

    /// Start both loops. The first run happens one interval after startup.
    pub fn spawn(self: &Arc<Self>, intervals: CycleIntervals) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(2);

        if self.cache.config().enable_warming {
            let maintenance = Arc::clone(self);
            tasks.push(spawn_loop("warm", intervals.warm, shutdown_rx.clone(), move || {
                let maintenance = Arc::clone(&maintenance);
                async move {
                    maintenance.warm_once().await;
                }
            }));
        }

        if self.cache.config().enable_adaptive_ttl && self.cache.config().enable_monitoring {
            let maintenance = Arc::clone(self);
            tasks.push(spawn_loop("tune", intervals.tune, shutdown_rx, move || {
                let maintenance = Arc::clone(&maintenance);
                async move {
                    maintenance.tune_once().await;
                }
            }));
        }

        info!(
            warm_interval_secs = intervals.warm.as_secs(),
            tune_interval_secs = intervals.tune.as_secs(),
            tasks = tasks.len(),
            "cache maintenance started"
        );
        SchedulerHandle { shutdown_tx, tasks }
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut cycle: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                () = cycle() => {}
            }
        }
        debug!(cycle = name, "cache maintenance loop stopped");
    })
}

/// Stops the maintenance loops.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait up to `grace` for the loops, aborting stragglers.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("cache maintenance task did not stop in time, aborting");
                abort.abort();
            }
        }
        info!("cache maintenance stopped");
    }
}
