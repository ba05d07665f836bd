//! Domain Events
//!
//! Events produced by the engine and staged through the outbox. Every event
//! of one invocation shares a message group, so the bus delivers them in
//! order: invoked before completed/failed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ets_common::{topics, OutboxEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::subscription::{SubscriptionConfig, SubscriptionType};
use super::trigger::TriggerType;

/// Base trait for events staged through the outbox.
///
/// # Message Group
///
/// Format: `{tenantId}:{invocationId}`
pub trait DomainEvent: Serialize + Sized {
    /// Topic the event is published on
    fn topic(&self) -> &'static str;

    fn message_group(&self) -> String;

    fn to_outbox_entry(&self) -> serde_json::Result<OutboxEntry> {
        OutboxEntry::from_event(self.topic(), self.message_group(), self)
    }
}

/// Implements [`DomainEvent`] for an event carrying `tenant_id` and
/// `invocation_id` fields.
#[macro_export]
macro_rules! impl_domain_event {
    ($event_type:ty, $topic:expr) => {
        impl $crate::domain::DomainEvent for $event_type {
            fn topic(&self) -> &'static str {
                $topic
            }

            fn message_group(&self) -> String {
                format!("{}:{}", self.tenant_id, self.invocation_id)
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationType {
    Test,
    RealTime,
}

/// Dispatch instruction: a full snapshot of everything the dispatch adapter
/// needs, so dispatch never re-reads the subscription store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInvokedEvent {
    pub invocation_id: String,
    pub tenant_id: String,
    pub trigger_id: String,
    pub trigger_type: TriggerType,
    pub invocation_type: InvocationType,
    pub subscription_id: String,
    pub subscription_name: String,
    pub subscription_type: SubscriptionType,
    pub subscription_config: SubscriptionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Encrypted script source, as stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_source: Option<String>,
    /// Plaintext completion secret (request/response only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub input: Value,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub invoked_at: DateTime<Utc>,
}

impl TriggerInvokedEvent {
    pub fn is_request_response(&self) -> bool {
        self.trigger_type == TriggerType::RequestResponse
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationCompletedEvent {
    pub invocation_id: String,
    pub tenant_id: String,
    pub trigger_id: String,
    pub output: Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationFailedEvent {
    pub invocation_id: String,
    pub tenant_id: String,
    pub trigger_id: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Request to the workflow engine to start a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunEvent {
    pub invocation_id: String,
    pub tenant_id: String,
    pub workflow_id: String,
    pub subscription_id: String,
    /// Invocation input with the run metadata merged in
    pub input: Value,
    pub requested_at: DateTime<Utc>,
}

impl_domain_event!(TriggerInvokedEvent, topics::TRIGGER_INVOKED);
impl_domain_event!(InvocationCompletedEvent, topics::INVOCATION_COMPLETED);
impl_domain_event!(InvocationFailedEvent, topics::INVOCATION_FAILED);
impl_domain_event!(WorkflowRunEvent, topics::WORKFLOW_RUN);
