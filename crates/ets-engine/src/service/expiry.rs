//! Invocation Expiry
//!
//! Reclaims request/response invocations whose deadline passed. Runs
//! alongside completion; whichever deletes the row first wins. A reclaimed
//! invocation counts as a failure for its (tenant, trigger) breaker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ets_outbox::OutboxPublisher;
use metrics::{counter, histogram};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitBreakerRegistry;
use super::completion::failed_event;
use crate::domain::DomainEvent;
use crate::error::Result;
use crate::repository::{Change, CommitOutcome, InvocationRepository, UnitOfWork};

pub const TIMEOUT_REASON: &str = "invocation timed out";

pub struct ExpiryService {
    invocations: Arc<dyn InvocationRepository>,
    unit_of_work: Arc<dyn UnitOfWork>,
    breakers: Arc<CircuitBreakerRegistry>,
    publisher: Arc<OutboxPublisher>,
}

impl ExpiryService {
    pub fn new(
        invocations: Arc<dyn InvocationRepository>,
        unit_of_work: Arc<dyn UnitOfWork>,
        breakers: Arc<CircuitBreakerRegistry>,
        publisher: Arc<OutboxPublisher>,
    ) -> Self {
        Self {
            invocations,
            unit_of_work,
            breakers,
            publisher,
        }
    }

    /// Fail up to `max_invocations` overdue invocations, soonest deadline
    /// first. Returns how many this call reclaimed.
    pub async fn reclaim_expired(&self, max_invocations: usize) -> Result<usize> {
        let now = Utc::now();
        let expired = self
            .invocations
            .find_by_deadline_before(now, max_invocations)
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut reclaimed = 0usize;
        for invocation in expired {
            let entry = failed_event(&invocation, TIMEOUT_REASON).to_outbox_entry()?;
            let changes = vec![
                Change::DeleteInvocation(invocation.id.clone()),
                Change::Stage(entry),
            ];
            let outcome = self.unit_of_work.commit(changes).await;

            match outcome {
                Ok(CommitOutcome::Committed) => {
                    reclaimed += 1;
                    let elapsed = invocation.elapsed(now);
                    histogram!("ets_invocation_duration_seconds").record(elapsed.as_secs_f64());
                    self.breakers
                        .get(&invocation.tenant_id, &invocation.trigger_id)
                        .on_error(elapsed, TIMEOUT_REASON);
                    counter!("ets_invocations_failed_total", "reason" => "timeout").increment(1);
                    debug!(
                        invocation_id = %invocation.id,
                        tenant_id = %invocation.tenant_id,
                        "Invocation expired"
                    );
                }
                Ok(CommitOutcome::AlreadyGone) => {
                    debug!(invocation_id = %invocation.id, "Invocation completed before expiry");
                }
                Err(e) => {
                    warn!(
                        invocation_id = %invocation.id,
                        error = %e,
                        "Failed to expire invocation"
                    );
                }
            }
        }

        if reclaimed > 0 {
            self.publisher.notify_committed();
            info!(reclaimed, "Expired invocations reclaimed");
        }
        Ok(reclaimed)
    }

    /// Sweep on a fixed interval until shutdown
    pub async fn run(
        &self,
        interval: Duration,
        batch_size: usize,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            interval_secs = interval.as_secs(),
            batch_size,
            "Starting expiry sweeper"
        );
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reclaim_expired(batch_size).await {
                        warn!(error = %e, "Expiry sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Expiry sweeper shutting down");
                    break;
                }
            }
        }
    }
}
