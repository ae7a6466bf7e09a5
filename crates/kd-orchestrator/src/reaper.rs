//! Age-based garbage collection
//!
//! One background task wakes up every minute and, in order:
//! - drops exec records older than [`EXEC_MAX_AGE`]
//! - deletes containers older than the configured age, workload first
//! - sweeps the cluster for labelled objects older than twice that age,
//!   whether or not the store still knows about them
//!
//! Cluster failures are logged; the next tick tries again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kd_core::traits::MetadataStore;

use crate::deploy::Orchestrator;

/// Interval between sweeps
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Exec records older than this are dropped
pub const EXEC_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub execs: usize,
    pub containers: usize,
    pub objects: usize,
}

/// The single background reaper of the process
pub struct Reaper {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn MetadataStore>,
    max_age: Duration,
    interval: Duration,
    running: Mutex<Option<CancellationToken>>,
}

impl Reaper {
    pub fn new(orchestrator: Arc<Orchestrator>, store: Arc<dyn MetadataStore>, max_age: Duration) -> Self {
        Self {
            orchestrator,
            store,
            max_age,
            interval: REAP_INTERVAL,
            running: Mutex::new(None),
        }
    }

    /// Override the sweep interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the background loop; returns false if it is already running
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.lock();
        if running.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        *running = Some(cancel.clone());

        let reaper = Arc::clone(self);
        tokio::spawn(async move { reaper.run(cancel).await });
        true
    }

    /// Stop the background loop; returns false if it was not running
    pub fn stop(&self) -> bool {
        match self.lock().take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        tracing::info!(
            max_age = ?self.max_age,
            interval = ?self.interval,
            "reaper started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("reaper shutting down");
                    break;
                }
            }
        }
    }

    /// Run one sweep
    pub async fn run_once(&self) -> ReapReport {
        let mut report = ReapReport::default();

        for exec in self.store.execs_older_than(EXEC_MAX_AGE) {
            if self.store.delete_exec(&exec.id).is_ok() {
                report.execs += 1;
            }
        }

        for mut container in self.store.containers_older_than(self.max_age) {
            self.orchestrator.evict(&mut container).await;
            if self.store.delete_container(&container.id).is_ok() {
                tracing::info!(id = %container.short_id(), "reaped container");
                report.containers += 1;
            }
        }

        match self.orchestrator.delete_older_than(self.max_age * 2).await {
            Ok(objects) => report.objects = objects,
            Err(error) => tracing::error!(%error, "reaper cluster sweep failed"),
        }

        if report != ReapReport::default() {
            tracing::info!(
                execs = report.execs,
                containers = report.containers,
                objects = report.objects,
                "reaper sweep done"
            );
        }
        report
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
