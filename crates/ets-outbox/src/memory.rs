//! In-memory outbox for tests and single-process embedding.

use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;
use ets_common::OutboxEntry;
use parking_lot::Mutex;

use crate::repository::{OutboxRepository, RelayOutcome};
use crate::EventBus;

#[derive(Default)]
pub struct InMemoryOutboxRepository {
    entries: Mutex<VecDeque<OutboxEntry>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage several entries at once (used by in-memory units of work)
    pub fn stage_all(&self, entries: impl IntoIterator<Item = OutboxEntry>) {
        self.entries.lock().extend(entries);
    }

    /// Copy of the current backlog, oldest first
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn insert(&self, entry: &OutboxEntry) -> Result<()> {
        self.entries.lock().push_back(entry.clone());
        Ok(())
    }

    async fn backlog(&self) -> Result<u64> {
        Ok(self.entries.lock().len() as u64)
    }

    async fn relay_oldest(&self, bus: &dyn EventBus) -> Result<RelayOutcome> {
        // The lock is not held across the publish: the bus may stage follow-up
        // entries into this same outbox.
        let entry = match self.entries.lock().pop_front() {
            Some(entry) => entry,
            None => return Ok(RelayOutcome::Empty),
        };

        match bus.publish(&entry).await {
            Ok(()) => Ok(RelayOutcome::Relayed(entry.id)),
            Err(e) => {
                self.entries.lock().push_front(entry);
                Err(e)
            }
        }
    }
}
