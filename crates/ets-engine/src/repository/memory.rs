//! In-memory store used by tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ets_outbox::InMemoryOutboxRepository;
use parking_lot::{Mutex, RwLock};

use super::{Change, CommitOutcome, InvocationRepository, SubscriptionRepository, UnitOfWork};
use crate::domain::{Invocation, Subscription, SubscriptionType};
use crate::error::{EtsError, Result};

/// Subscriptions, invocations and the outbox they commit into
pub struct InMemoryStore {
    subscriptions: RwLock<HashMap<String, Subscription>>,
    invocations: Mutex<HashMap<String, Invocation>>,
    outbox: Arc<InMemoryOutboxRepository>,
}

impl InMemoryStore {
    pub fn new(outbox: Arc<InMemoryOutboxRepository>) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            invocations: Mutex::new(HashMap::new()),
            outbox,
        }
    }

    pub fn outbox(&self) -> &Arc<InMemoryOutboxRepository> {
        &self.outbox
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

fn sorted_by_creation(mut subscriptions: Vec<Subscription>) -> Vec<Subscription> {
    subscriptions.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    subscriptions
}

#[async_trait]
impl SubscriptionRepository for InMemoryStore {
    async fn insert(&self, subscription: &Subscription) -> Result<()> {
        let mut subscriptions = self.subscriptions.write();
        if subscriptions.contains_key(&subscription.id) {
            return Err(EtsError::storage(format!(
                "subscription {} already exists",
                subscription.id
            )));
        }
        subscriptions.insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn update(&self, subscription: &Subscription) -> Result<()> {
        let mut subscriptions = self.subscriptions.write();
        match subscriptions.get_mut(&subscription.id) {
            Some(existing) => {
                *existing = subscription.clone();
                Ok(())
            }
            None => Err(EtsError::not_found("Subscription", &subscription.id)),
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.subscriptions.write().remove(id).is_some())
    }

    async fn find_all_by_tenant_and_trigger(
        &self,
        tenant_id: &str,
        trigger_id: &str,
    ) -> Result<Vec<Subscription>> {
        let found = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.trigger_id == trigger_id)
            .cloned()
            .collect();
        Ok(sorted_by_creation(found))
    }

    async fn find_all_by_tenant_and_type(
        &self,
        tenant_id: &str,
        subscription_type: SubscriptionType,
    ) -> Result<Vec<Subscription>> {
        let found = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.subscription_type() == subscription_type)
            .cloned()
            .collect();
        Ok(sorted_by_creation(found))
    }
}

#[async_trait]
impl InvocationRepository for InMemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Invocation>> {
        Ok(self.invocations.lock().get(id).cloned())
    }

    async fn find_by_deadline_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Invocation>> {
        let mut expired: Vec<Invocation> = self
            .invocations
            .lock()
            .values()
            .filter(|i| i.is_expired_at(before))
            .cloned()
            .collect();
        expired.sort_by_key(|i| i.deadline);
        expired.truncate(limit);
        Ok(expired)
    }
}

#[async_trait]
impl UnitOfWork for InMemoryStore {
    async fn commit(&self, changes: Vec<Change>) -> Result<CommitOutcome> {
        // Invocation lock is held across the whole unit, outbox staging included
        let mut invocations = self.invocations.lock();

        let all_present = changes.iter().all(|change| match change {
            Change::DeleteInvocation(id) => invocations.contains_key(id),
            _ => true,
        });
        if !all_present {
            return Ok(CommitOutcome::AlreadyGone);
        }

        let mut staged = Vec::new();
        for change in changes {
            match change {
                Change::SaveInvocation(invocation) => {
                    invocations.insert(invocation.id.clone(), invocation);
                }
                Change::DeleteInvocation(id) => {
                    invocations.remove(&id);
                }
                Change::Stage(entry) => staged.push(entry),
            }
        }
        self.outbox.stage_all(staged);
        Ok(CommitOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InlineConfig, SubscriptionConfig};
    use chrono::Duration;
    use ets_common::OutboxEntry;

    fn store() -> InMemoryStore {
        InMemoryStore::new(Arc::new(InMemoryOutboxRepository::new()))
    }

    fn inline_subscription(tenant: &str, trigger: &str) -> Subscription {
        Subscription::new(
            tenant,
            trigger,
            "inline",
            SubscriptionConfig::Inline(InlineConfig {
                output: Some(serde_json::json!({ "ok": true })),
                error: None,
            }),
        )
    }

    #[tokio::test]
    async fn test_subscription_queries() {
        let store = store();
        store.insert(&inline_subscription("acme", "t1")).await.unwrap();
        store.insert(&inline_subscription("acme", "t2")).await.unwrap();
        store.insert(&inline_subscription("globex", "t1")).await.unwrap();

        assert_eq!(store.find_all_by_tenant_and_trigger("acme", "t1").await.unwrap().len(), 1);
        assert_eq!(
            store
                .find_all_by_tenant_and_type("acme", SubscriptionType::Inline)
                .await
                .unwrap()
                .len(),
            2
        );
        assert!(store
            .find_all_by_tenant_and_type("acme", SubscriptionType::Script)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_subscription() {
        let store = store();
        let result = store.update(&inline_subscription("acme", "t1")).await;
        assert!(matches!(result, Err(EtsError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_commit_saves_and_stages_together() {
        let store = store();
        let (invocation, _) = Invocation::request_response("acme", "t1", "sub-1", 5);
        let entry = OutboxEntry::new("topic", "acme:1", serde_json::json!({}));

        let outcome = store
            .commit(vec![Change::SaveInvocation(invocation.clone()), Change::Stage(entry)])
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(store.invocation_count(), 1);
        assert_eq!(store.outbox().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_aborts_when_delete_target_is_gone() {
        let store = store();
        let entry = OutboxEntry::new("topic", "acme:1", serde_json::json!({}));

        let outcome = store
            .commit(vec![Change::DeleteInvocation("missing".to_string()), Change::Stage(entry)])
            .await
            .unwrap();

        assert_eq!(outcome, CommitOutcome::AlreadyGone);
        assert!(store.outbox().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_query_orders_soonest_first() {
        let store = store();
        let now = Utc::now();
        let mut ids = Vec::new();
        for minutes_ago in [3, 10, 1] {
            let (mut invocation, _) = Invocation::request_response("acme", "t1", "sub-1", 5);
            invocation.deadline = Some(now - Duration::minutes(minutes_ago));
            ids.push((minutes_ago, invocation.id.clone()));
            store.commit(vec![Change::SaveInvocation(invocation)]).await.unwrap();
        }
        let (future, _) = Invocation::request_response("acme", "t1", "sub-1", 5);
        store.commit(vec![Change::SaveInvocation(future)]).await.unwrap();

        let expired = store.find_by_deadline_before(now, 2).await.unwrap();
        let expired_ids: Vec<&str> = expired.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(expired_ids, vec![ids[1].1.as_str(), ids[0].1.as_str()]);
    }
}
