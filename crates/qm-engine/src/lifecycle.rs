//! Lifecycle Manager
//!
//! Periodic sweep that reclaims expired leases, times out queued requests,
//! forgets idle requesters and, optionally, applies sizing advice every few
//! sweeps.

use crate::advisor::{apply_advice, SizingAdvisor};
use crate::engine::AllocationEngine;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_grants: usize,
    pub timed_out: usize,
    pub pruned_requesters: usize,
    pub resized: usize,
}

pub struct LifecycleManager {
    engine: Arc<AllocationEngine>,
    interval: Duration,
    advisor: Option<Arc<dyn SizingAdvisor>>,
    advise_every: u64,
    sweeps: AtomicU64,
}

impl LifecycleManager {
    pub fn new(engine: Arc<AllocationEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            advisor: None,
            advise_every: 1,
            sweeps: AtomicU64::new(0),
        }
    }

    /// Consult `advisor` on every `every`-th sweep
    pub fn with_advisor(mut self, advisor: Arc<dyn SizingAdvisor>, every: u64) -> Self {
        self.advisor = Some(advisor);
        self.advise_every = every.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> SweepReport {
        let expired_grants = self.engine.expire_grants_at(now);
        let timed_out = self.engine.expire_waiters_at(now);
        let pruned_requesters = self.engine.prune_requesters_at(now);

        let sweep = self.sweeps.fetch_add(1, Ordering::Relaxed) + 1;
        let resized = match &self.advisor {
            Some(advisor) if sweep % self.advise_every == 0 => {
                apply_advice(&self.engine, advisor.as_ref())
                    .iter()
                    .filter(|o| o.result.is_ok())
                    .count()
            }
            _ => 0,
        };

        let report = SweepReport {
            expired_grants,
            timed_out,
            pruned_requesters,
            resized,
        };
        if report != SweepReport::default() {
            tracing::debug!(expired_grants, timed_out, pruned_requesters, resized, "lifecycle sweep");
        }
        report
    }

    /// Sweep on a fixed interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "starting lifecycle sweeper");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("lifecycle sweeper stopped");
    }

    pub fn spawn(self: &Arc<Self>) -> LifecycleHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(self).run(rx));
        LifecycleHandle { shutdown, task }
    }
}

/// Running sweeper task
pub struct LifecycleHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LifecycleHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "lifecycle task failed");
        }
    }
}
