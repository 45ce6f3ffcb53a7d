//! Periodic removal of expired tickets.
//!
//! [`RegistryCleaner::clean`] walks every ticket kind, deletes up to
//! `batch_size` policy-expired tickets per kind through the registry (so
//! descendant removal applies), then asks the backend to reclaim records
//! whose storage TTL elapsed. A sweep only runs on the node holding the
//! cluster-wide `cleaner` lock, and is skipped entirely when the backend
//! evicts expired records by itself.
//!
//! A failure on one ticket is logged and counted; the sweep moves on.
//! Sweeps are idempotent: a second sweep over the same state removes
//! nothing.

use std::{fmt, sync::Arc};

use fail::fail_point;
use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};

use crate::{
    catalog::TicketKind,
    config::CleanerConfig,
    error::TicketResult,
    locking::LockingStrategy,
    metrics::RegistryMetrics,
    registry::TicketRegistry,
    ticket::redact_id,
};

/// Name of the lock serializing sweeps across nodes.
pub const CLEANER_LOCK: &str = "cleaner";

/// What one call to [`RegistryCleaner::clean`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// The sweep did not run: disabled, native eviction, or another node
    /// holds the lock.
    pub skipped: bool,
    /// Expired tickets found.
    pub examined: usize,
    /// Records removed, including cascaded descendants.
    pub removed: usize,
    /// Tickets that could not be removed.
    pub failures: usize,
    /// Records reclaimed by the backend after their storage TTL.
    pub purged: usize,
}

impl CleanReport {
    fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

/// Sweeps expired tickets out of a registry.
pub struct RegistryCleaner {
    registry: Arc<dyn TicketRegistry>,
    lock: Arc<dyn LockingStrategy>,
    config: CleanerConfig,
    metrics: RegistryMetrics,
}

impl fmt::Debug for RegistryCleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCleaner")
            .field("lock", &self.lock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RegistryCleaner {
    /// Creates a cleaner for `registry`, coordinating through `lock`.
    #[must_use]
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        lock: Arc<dyn LockingStrategy>,
        config: CleanerConfig,
        metrics: RegistryMetrics,
    ) -> Self {
        Self { registry, lock, config, metrics }
    }

    /// The schedule and bound this cleaner runs with.
    #[must_use]
    pub fn config(&self) -> &CleanerConfig {
        &self.config
    }

    /// Runs one sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be consulted or the registry
    /// cannot be enumerated. Per-ticket failures are reported in the
    /// [`CleanReport`] instead.
    #[tracing::instrument(skip_all)]
    pub async fn clean(&self) -> TicketResult<CleanReport> {
        if !self.config.enabled() {
            tracing::debug!("cleaner disabled");
            return Ok(CleanReport::skipped());
        }
        if self.registry.expires_natively() {
            tracing::debug!("backend evicts expired tickets natively");
            return Ok(CleanReport::skipped());
        }
        if !self.lock.try_lock(CLEANER_LOCK).await? {
            tracing::debug!("another node is sweeping");
            return Ok(CleanReport::skipped());
        }

        let result = self.sweep().await;
        if let Err(err) = self.lock.unlock(CLEANER_LOCK).await {
            tracing::warn!(error = %err, "failed to release cleaner lock");
        }
        let report = result?;

        if report.removed > 0 || report.purged > 0 || report.failures > 0 {
            tracing::info!(
                removed = report.removed,
                purged = report.purged,
                failures = report.failures,
                "registry sweep finished",
            );
        }
        Ok(report)
    }

    async fn sweep(&self) -> TicketResult<CleanReport> {
        let mut report = CleanReport::default();
        let batch = self.config.batch_size();

        for kind in TicketKind::ALL {
            let expired = self.registry.expired_tickets(kind, batch).await?;
            tracing::debug!(kind = %kind, expired = expired.len(), "sweeping kind");
            report.examined += expired.len();

            for ticket in expired {
                match self.remove(ticket.id()).await {
                    Ok(removed) => {
                        report.removed += removed;
                        self.metrics.record_swept(removed);
                    },
                    Err(err) => {
                        tracing::warn!(ticket = %redact_id(ticket.id()), error = %err, "failed to remove expired ticket");
                        report.failures += 1;
                        self.metrics.record_sweep_failure();
                    },
                }
            }
        }

        report.purged = self.registry.purge_expired().await?;
        Ok(report)
    }

    async fn remove(&self, id: &str) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        before_delete()?;
        Ok(self.registry.delete_ticket(id).await?)
    }

    /// Runs sweeps on the configured schedule until the returned handle is
    /// shut down or dropped.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use = "dropping the handle stops the cleaner"]
    pub fn spawn(self: Arc<Self>) -> CleanerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let task = tokio::spawn(run(self, shutdown_rx));
        CleanerHandle { shutdown_tx, task: Some(task) }
    }
}

fn before_delete() -> Result<(), String> {
    fail_point!("cleaner-before-delete", |_| Err("injected failure before delete".to_owned()));
    Ok(())
}

async fn run(cleaner: Arc<RegistryCleaner>, mut shutdown_rx: watch::Receiver<()>) {
    let config = cleaner.config().clone();
    tracing::info!(
        start_delay_ms = config.start_delay().as_millis() as u64,
        repeat_interval_ms = config.repeat_interval().as_millis() as u64,
        "registry cleaner started",
    );

    select! {
        _ = sleep(config.start_delay()) => {}
        _ = shutdown_rx.changed() => {
            tracing::info!("registry cleaner stopped");
            return;
        }
    }

    let mut ticker = interval(config.repeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }
        if let Err(err) = cleaner.clean().await {
            tracing::error!(error = %err, "registry sweep failed");
        }
    }
    tracing::info!("registry cleaner stopped");
}

/// Controls a running cleaner. Dropping it stops the schedule.
#[derive(Debug)]
pub struct CleanerHandle {
    shutdown_tx: watch::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl CleanerHandle {
    /// Stops the schedule and waits for an in-flight sweep to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "cleaner task ended abnormally");
            }
        }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
