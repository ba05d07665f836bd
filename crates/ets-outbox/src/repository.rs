use anyhow::Result;
use async_trait::async_trait;
use ets_common::OutboxEntry;

use crate::EventBus;

/// Result of one relay attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Nothing was eligible for relay
    Empty,
    /// The entry with this id was published and removed
    Relayed(String),
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Stage an entry outside of any caller transaction
    async fn insert(&self, entry: &OutboxEntry) -> Result<()>;

    /// Number of entries waiting to be relayed
    async fn backlog(&self) -> Result<u64>;

    /// Remove the oldest eligible entry and publish it to the bus.
    ///
    /// Removal and publish share one transaction: when the bus rejects the
    /// entry the removal is rolled back and the error returned, leaving the
    /// entry in place for the next sweep.
    async fn relay_oldest(&self, bus: &dyn EventBus) -> Result<RelayOutcome>;
}
