//! Invocation Orchestrator
//!
//! Turns one trigger firing into zero or more invocations, one per enabled
//! subscription whose filter lets the input through. Each invocation is
//! staged as a [`TriggerInvokedEvent`] in the same unit of work that
//! persists it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use ets_config::DispatchConfig;
use ets_outbox::OutboxPublisher;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::{FeatureStore, TriggerCatalog};
use crate::domain::{
    DomainEvent, Invocation, InvocationType, Subscription, Trigger, TriggerInvokedEvent,
    TriggerType,
};
use crate::error::{EtsError, Result};
use crate::filter::{self, FilterVerdict};
use crate::repository::{Change, SubscriptionRepository, UnitOfWork};

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub tenant_id: String,
    pub trigger_id: String,
    pub input: Value,
    pub context: Value,
    pub headers: BTreeMap<String, String>,
}

impl InvokeRequest {
    pub fn new(tenant_id: impl Into<String>, trigger_id: impl Into<String>, input: Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            trigger_id: trigger_id.into(),
            input,
            context: Value::Object(Default::default()),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Test firing: input defaults to the trigger's example input, and the
/// subscriptions can be narrowed to an allowlist
#[derive(Debug, Clone)]
pub struct InvokeTestRequest {
    pub tenant_id: String,
    pub trigger_id: String,
    pub input: Option<Value>,
    pub context: Value,
    pub headers: BTreeMap<String, String>,
    pub subscription_ids: Option<Vec<String>>,
}

impl InvokeTestRequest {
    pub fn new(tenant_id: impl Into<String>, trigger_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            trigger_id: trigger_id.into(),
            input: None,
            context: Value::Object(Default::default()),
            headers: BTreeMap::new(),
            subscription_ids: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_subscriptions(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subscription_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }
}

pub struct InvocationOrchestrator {
    catalog: Arc<dyn TriggerCatalog>,
    features: Arc<dyn FeatureStore>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    unit_of_work: Arc<dyn UnitOfWork>,
    publisher: Arc<OutboxPublisher>,
    default_deadline_minutes: u32,
}

struct Firing<'a> {
    tenant_id: &'a str,
    input: &'a Value,
    context: &'a Value,
    headers: &'a BTreeMap<String, String>,
    invocation_type: InvocationType,
    allowlist: Option<HashSet<&'a str>>,
}

impl InvocationOrchestrator {
    pub fn new(
        catalog: Arc<dyn TriggerCatalog>,
        features: Arc<dyn FeatureStore>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        unit_of_work: Arc<dyn UnitOfWork>,
        publisher: Arc<OutboxPublisher>,
        dispatch: &DispatchConfig,
    ) -> Self {
        Self {
            catalog,
            features,
            subscriptions,
            unit_of_work,
            publisher,
            default_deadline_minutes: dispatch.default_response_deadline_minutes,
        }
    }

    pub async fn invoke(&self, request: InvokeRequest) -> Result<Vec<Invocation>> {
        let trigger = self
            .resolve_trigger(&request.tenant_id, &request.trigger_id)
            .await?;
        let Some(trigger) = trigger else {
            return Ok(Vec::new());
        };
        self.fire(
            &trigger,
            Firing {
                tenant_id: &request.tenant_id,
                input: &request.input,
                context: &request.context,
                headers: &request.headers,
                invocation_type: InvocationType::RealTime,
                allowlist: None,
            },
        )
        .await
    }

    pub async fn invoke_test(&self, request: InvokeTestRequest) -> Result<Vec<Invocation>> {
        let trigger = self
            .resolve_trigger(&request.tenant_id, &request.trigger_id)
            .await?;
        let Some(trigger) = trigger else {
            return Ok(Vec::new());
        };
        let input = match request.input.as_ref().or(trigger.example_input.as_ref()) {
            Some(input) => input.clone(),
            None => {
                return Err(EtsError::validation(
                    "input",
                    "no input given and the trigger has no example input",
                ))
            }
        };
        self.fire(
            &trigger,
            Firing {
                tenant_id: &request.tenant_id,
                input: &input,
                context: &request.context,
                headers: &request.headers,
                invocation_type: InvocationType::Test,
                allowlist: request
                    .subscription_ids
                    .as_ref()
                    .map(|ids| ids.iter().map(String::as_str).collect()),
            },
        )
        .await
    }

    /// The trigger, or `None` when it is disabled for the tenant
    async fn resolve_trigger(&self, tenant_id: &str, trigger_id: &str) -> Result<Option<Trigger>> {
        let trigger = self
            .catalog
            .find_by_id(trigger_id)
            .await?
            .ok_or_else(|| EtsError::not_found("Trigger", trigger_id))?;

        if !trigger.is_enabled_for_tenant(self.features.as_ref(), tenant_id) {
            info!(tenant_id, trigger_id, "Trigger disabled for tenant, nothing to invoke");
            return Ok(None);
        }
        Ok(Some(trigger))
    }

    async fn fire(&self, trigger: &Trigger, firing: Firing<'_>) -> Result<Vec<Invocation>> {
        trigger
            .validate_input(firing.input)
            .map_err(|message| EtsError::validation("input", message))?;

        let subscriptions = self
            .subscriptions
            .find_all_by_tenant_and_trigger(firing.tenant_id, &trigger.id)
            .await?;

        let mut invocations = Vec::new();
        let mut changes = Vec::new();

        for subscription in subscriptions.iter().filter(|s| s.enabled) {
            if let Some(allowlist) = &firing.allowlist {
                if !allowlist.contains(subscription.id.as_str()) {
                    continue;
                }
            }

            match filter::evaluate(subscription.filter.as_deref(), firing.input) {
                FilterVerdict::Pass => {}
                FilterVerdict::NoMatch => {
                    debug!(
                        subscription_id = %subscription.id,
                        trigger_id = %trigger.id,
                        "Filter did not match input, skipping subscription"
                    );
                    continue;
                }
                FilterVerdict::Invalid(error) => {
                    warn!(
                        subscription_id = %subscription.id,
                        trigger_id = %trigger.id,
                        error = %error,
                        "Filter could not be evaluated, skipping subscription"
                    );
                    continue;
                }
            }

            let (invocation, secret) = self.new_invocation(trigger, subscription);
            let event = TriggerInvokedEvent {
                invocation_id: invocation.id.clone(),
                tenant_id: invocation.tenant_id.clone(),
                trigger_id: trigger.id.clone(),
                trigger_type: trigger.trigger_type,
                invocation_type: firing.invocation_type,
                subscription_id: subscription.id.clone(),
                subscription_name: subscription.name.clone(),
                subscription_type: subscription.subscription_type(),
                subscription_config: subscription.config.clone(),
                filter: subscription.filter.clone(),
                script_source: subscription.script_source.clone(),
                secret,
                deadline: invocation.deadline,
                input: firing.input.clone(),
                context: firing.context.clone(),
                headers: firing.headers.clone(),
                invoked_at: Utc::now(),
            };

            if invocation.is_persistent() {
                changes.push(Change::SaveInvocation(invocation.clone()));
            }
            changes.push(Change::Stage(event.to_outbox_entry()?));
            invocations.push(invocation);
        }

        if invocations.is_empty() {
            debug!(
                tenant_id = firing.tenant_id,
                trigger_id = %trigger.id,
                "No subscription to invoke"
            );
            return Ok(invocations);
        }

        // One firing is one business transaction
        self.unit_of_work.commit(changes).await?;
        self.publisher.notify_committed();

        counter!("ets_invocations_created_total", "trigger_type" => trigger.trigger_type.as_str())
            .increment(invocations.len() as u64);
        info!(
            tenant_id = firing.tenant_id,
            trigger_id = %trigger.id,
            invocations = invocations.len(),
            invocation_type = ?firing.invocation_type,
            "Trigger invoked"
        );
        Ok(invocations)
    }

    fn new_invocation(
        &self,
        trigger: &Trigger,
        subscription: &Subscription,
    ) -> (Invocation, Option<String>) {
        match trigger.trigger_type {
            TriggerType::RequestResponse => {
                let minutes = subscription
                    .response_deadline_minutes
                    .or(trigger.response_deadline_minutes)
                    .unwrap_or(self.default_deadline_minutes);
                let (invocation, secret) = Invocation::request_response(
                    &subscription.tenant_id,
                    &trigger.id,
                    &subscription.id,
                    minutes,
                );
                (invocation, Some(secret))
            }
            TriggerType::FireAndForget => (
                Invocation::fire_and_forget(&subscription.tenant_id, &trigger.id, &subscription.id),
                None,
            ),
        }
    }
}
