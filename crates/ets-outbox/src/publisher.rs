//! Outbox Publisher
//!
//! Single-flight drain of the outbox backlog into the event bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use crate::repository::{OutboxRepository, RelayOutcome};
use crate::EventBus;

/// Relays staged entries to the bus.
///
/// At most one drain loop runs per process; concurrent callers return
/// immediately. Across processes, the repository's lock-skipping row
/// selection keeps drainers from relaying the same entry twice.
pub struct OutboxPublisher {
    repository: Arc<dyn OutboxRepository>,
    draining: AtomicBool,
    wake: Notify,
}

/// Clears the draining flag even if the drain future is dropped mid-way
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OutboxPublisher {
    pub fn new(repository: Arc<dyn OutboxRepository>) -> Self {
        Self {
            repository,
            draining: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn repository(&self) -> &Arc<dyn OutboxRepository> {
        &self.repository
    }

    /// Signal that a transaction staging entries has committed.
    ///
    /// Never blocks: the running relay loop picks the signal up and drains.
    pub fn notify_committed(&self) {
        self.wake.notify_one();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Relay entries until the backlog is empty or the bus fails.
    ///
    /// Returns the number of entries relayed by this call; 0 when another
    /// drain already holds the flag.
    pub async fn drain(&self, bus: &dyn EventBus) -> Result<usize> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Outbox drain already running, skipping");
            return Ok(0);
        }
        let _guard = DrainGuard(&self.draining);

        let mut relayed = 0usize;
        loop {
            match self.repository.relay_oldest(bus).await {
                Ok(RelayOutcome::Empty) => break,
                Ok(RelayOutcome::Relayed(id)) => {
                    debug!(entry_id = %id, "Relayed outbox entry");
                    counter!("ets_outbox_published_total").increment(1);
                    relayed += 1;
                }
                Err(e) => {
                    // Entry stays staged; the sweep retries it
                    warn!(error = %e, relayed, "Outbox relay failed, deferring to next sweep");
                    counter!("ets_outbox_publish_failures_total").increment(1);
                    return Err(e);
                }
            }
        }

        if relayed > 0 {
            debug!(relayed, "Outbox drain finished");
        }
        Ok(relayed)
    }

    /// Drain only if the backlog is non-empty
    pub async fn sweep(&self, bus: &dyn EventBus) -> Result<usize> {
        let backlog = self.repository.backlog().await?;
        if backlog == 0 {
            return Ok(0);
        }
        debug!(backlog, "Outbox backlog found by sweep");
        self.drain(bus).await
    }

    /// Run the relay loop until shutdown: drains on every commit signal and
    /// sweeps on every interval tick.
    pub async fn run(
        &self,
        bus: Arc<dyn EventBus>,
        sweep_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(interval_secs = sweep_interval.as_secs(), "Starting outbox publisher");
        let mut ticker = tokio::time::interval(sweep_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(bus.as_ref()).await {
                        warn!(error = %e, "Outbox sweep failed");
                    }
                }
                _ = self.wake.notified() => {
                    // Errors were logged by drain; the sweep retries
                    let _ = self.drain(bus.as_ref()).await;
                }
                _ = shutdown.recv() => {
                    info!("Outbox publisher shutting down");
                    break;
                }
            }
        }
    }
}
