//! External Collaborators
//!
//! Outbound calls made by the engine. The worker binds these to AWS Lambda
//! and EventBridge; tests bind them to recording mocks.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Invoker: Send + Sync {
    /// Asynchronously invoke a function with a JSON payload
    async fn invoke_lambda(&self, function_name: &str, payload: &Value) -> anyhow::Result<()>;

    /// Put one event on a partner event source
    async fn send_partner_event(
        &self,
        region: &str,
        source_name: &str,
        trigger_id: &str,
        detail: &Value,
    ) -> anyhow::Result<()>;
}

/// A provisioned partner event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerEventSource {
    pub name: String,
    pub arn: String,
}

/// Creates and releases the partner event sources backing EVENTBRIDGE
/// subscriptions
#[async_trait]
pub trait PartnerEventSources: Send + Sync {
    async fn create(
        &self,
        aws_account: &str,
        aws_region: &str,
        name: &str,
    ) -> anyhow::Result<PartnerEventSource>;

    async fn delete(&self, aws_account: &str, aws_region: &str, name: &str) -> anyhow::Result<()>;
}
