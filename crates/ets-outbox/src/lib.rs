//! Transactional Outbox
//!
//! Domain events are staged as rows in the same database transaction as the
//! state change that produced them, then relayed to the event bus by a drain
//! loop. Two callers converge on the same drain routine:
//! - a post-commit wake-up, so events normally leave immediately
//! - a fixed-interval sweep, which retries anything a failed drain left behind
//!
//! Delivery is at-least-once: an entry is only removed once the bus accepted it.

pub mod repository;
pub mod memory;
pub mod publisher;

#[cfg(feature = "postgres")]
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use ets_common::OutboxEntry;

pub use memory::InMemoryOutboxRepository;
pub use publisher::OutboxPublisher;
pub use repository::{OutboxRepository, RelayOutcome};

/// Destination of relayed outbox entries
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry) -> Result<()>;
}
