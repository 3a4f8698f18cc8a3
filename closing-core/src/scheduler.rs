//! Periodic sweep scheduler
//!
//! Lock expiry, active-registry eviction and history retention are
//! [`PeriodicTask`]s. In production [`SweepScheduler::start`] runs each task on
//! its own interval; tests call [`SweepScheduler::tick_all`] after advancing a
//! [`ManualClock`](crate::clock::ManualClock) instead of sleeping.

use crate::lock::LockManager;
use crate::orchestrator::Orchestrator;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Work repeated on a fixed interval
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Task name for logs
    fn name(&self) -> &'static str;

    /// Time between runs
    fn interval(&self) -> Duration;

    /// One pass; returns the number of items reclaimed
    async fn run(&self) -> Result<usize>;
}

/// Reclaims expired locks and purges expired store entries
pub struct LockSweepTask {
    locks: Arc<LockManager>,
    interval: Duration,
}

impl LockSweepTask {
    /// Create task
    pub fn new(locks: Arc<LockManager>, interval: Duration) -> Self {
        Self { locks, interval }
    }
}

#[async_trait]
impl PeriodicTask for LockSweepTask {
    fn name(&self) -> &'static str {
        "lock_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        self.locks.sweep_expired().await
    }
}

/// Removes active operations past their grace period
pub struct EvictionTask {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl EvictionTask {
    /// Create task
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }
}

#[async_trait]
impl PeriodicTask for EvictionTask {
    fn name(&self) -> &'static str {
        "operation_eviction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        Ok(self.orchestrator.evict_stale())
    }
}

/// Purges history entries past the retention window
pub struct HistoryRetentionTask {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl HistoryRetentionTask {
    /// Create task
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }
}

#[async_trait]
impl PeriodicTask for HistoryRetentionTask {
    fn name(&self) -> &'static str {
        "history_retention"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<usize> {
        Ok(self.orchestrator.purge_history())
    }
}

/// Set of periodic tasks
#[derive(Default)]
pub struct SweepScheduler {
    tasks: Vec<Arc<dyn PeriodicTask>>,
}

impl SweepScheduler {
    /// Create empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task
    pub fn register(&mut self, task: Arc<dyn PeriodicTask>) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Registered task names
    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }

    /// Run every task once, in registration order.
    /// Failures are logged and skipped; returns the total reclaimed.
    pub async fn tick_all(&self) -> usize {
        let mut total = 0;
        for task in &self.tasks {
            total += run_once(task.as_ref()).await;
        }
        total
    }

    /// Spawn one loop per task
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = self
            .tasks
            .into_iter()
            .map(|task| {
                let mut shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    info!(task = task.name(), interval = ?task.interval(), "Starting periodic task");

                    let mut interval = tokio::time::interval(task.interval());
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                run_once(task.as_ref()).await;
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }

                    debug!(task = task.name(), "Periodic task stopped");
                })
            })
            .collect();

        SchedulerHandle {
            shutdown: shutdown_tx,
            handles,
        }
    }
}

async fn run_once(task: &dyn PeriodicTask) -> usize {
    match task.run().await {
        Ok(reclaimed) => {
            if reclaimed > 0 {
                debug!(task = task.name(), reclaimed, "Periodic task run");
            }
            reclaimed
        }
        Err(e) => {
            warn!(task = task.name(), "Periodic task failed: {}", e);
            0
        }
    }
}

/// Running scheduler
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop every task and wait for the loops to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("Periodic task panicked: {}", e);
            }
        }
        info!("Sweep scheduler stopped");
    }
}
