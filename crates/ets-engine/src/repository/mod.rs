//! Repositories
//!
//! Subscription and invocation storage plus the unit of work that commits
//! invocation changes together with the outbox entries describing them.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ets_common::OutboxEntry;

use crate::domain::{Invocation, Subscription, SubscriptionType};
use crate::error::Result;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn insert(&self, subscription: &Subscription) -> Result<()>;

    async fn update(&self, subscription: &Subscription) -> Result<()>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>>;

    /// Returns false when nothing was deleted
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn find_all_by_tenant_and_trigger(
        &self,
        tenant_id: &str,
        trigger_id: &str,
    ) -> Result<Vec<Subscription>>;

    async fn find_all_by_tenant_and_type(
        &self,
        tenant_id: &str,
        subscription_type: SubscriptionType,
    ) -> Result<Vec<Subscription>>;
}

#[async_trait]
pub trait InvocationRepository: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Invocation>>;

    /// Invocations with a deadline before `before`, soonest deadline first
    async fn find_by_deadline_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Invocation>>;
}

/// One change applied by [`UnitOfWork::commit`]
#[derive(Debug, Clone)]
pub enum Change {
    SaveInvocation(Invocation),
    /// Aborts the whole unit when the invocation no longer exists
    DeleteInvocation(String),
    Stage(OutboxEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// An invocation to delete was already gone; nothing was applied
    AlreadyGone,
}

/// Applies a set of changes atomically
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    async fn commit(&self, changes: Vec<Change>) -> Result<CommitOutcome>;
}
