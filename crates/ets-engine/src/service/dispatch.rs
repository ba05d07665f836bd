//! Dispatch Adapter
//!
//! Turns a staged [`TriggerInvokedEvent`] into the outbound call for its
//! subscription type. The breaker for (tenant, trigger) is consulted first;
//! a refused dispatch never reaches the target.
//!
//! Target failures are not raised to the event pipeline. For request/response
//! invocations they are routed through completion as an error, producing an
//! [`InvocationFailedEvent`](crate::domain::InvocationFailedEvent).
//!
//! Fire-and-forget invocations are never completed, so their outcome is
//! reported to the breaker here, as soon as the outbound call returns.

use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use ets_config::DispatchConfig;
use ets_outbox::OutboxPublisher;
use metrics::counter;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitBreakerRegistry;
use super::completion::{CompleteInvocationCommand, CompletionService};
use crate::crypto::ScriptCipher;
use crate::domain::{
    DomainEvent, EventBridgeConfig, HttpAuth, HttpConfig, ResponseMode, ScriptConfig,
    ScriptLanguage, SubscriptionConfig, TriggerInvokedEvent, WorkflowConfig, WorkflowRunEvent,
};
use crate::error::{EtsError, Result};
use crate::invoker::Invoker;
use crate::repository::{Change, UnitOfWork};

/// Reserved input key carrying invocation metadata to targets
pub const METADATA_KEY: &str = "_metadata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// The target could not be reached; the reason was routed to completion
    Failed(String),
}

pub struct DispatchAdapter {
    breakers: Arc<CircuitBreakerRegistry>,
    invoker: Arc<dyn Invoker>,
    cipher: Arc<ScriptCipher>,
    completion: Arc<CompletionService>,
    unit_of_work: Arc<dyn UnitOfWork>,
    publisher: Arc<OutboxPublisher>,
    config: DispatchConfig,
}

impl DispatchAdapter {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        invoker: Arc<dyn Invoker>,
        cipher: Arc<ScriptCipher>,
        completion: Arc<CompletionService>,
        unit_of_work: Arc<dyn UnitOfWork>,
        publisher: Arc<OutboxPublisher>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            breakers,
            invoker,
            cipher,
            completion,
            unit_of_work,
            publisher,
            config,
        }
    }

    pub async fn dispatch(&self, event: &TriggerInvokedEvent) -> Result<DispatchOutcome> {
        let breaker = self.breakers.get(&event.tenant_id, &event.trigger_id);
        if !breaker.is_call_permitted() {
            counter!(
                "ets_dispatch_rejected_total",
                "trigger_type" => event.trigger_type.as_str()
            )
            .increment(1);
            warn!(
                invocation_id = %event.invocation_id,
                tenant_id = %event.tenant_id,
                trigger_id = %event.trigger_id,
                state = %breaker.state(),
                "Circuit open, invocation dropped"
            );
            return Err(EtsError::CircuitOpen {
                tenant_id: event.tenant_id.clone(),
                trigger_id: event.trigger_id.clone(),
            });
        }

        let response_mode = match &event.subscription_config {
            SubscriptionConfig::Http(http) if event.is_request_response() => {
                http.response_mode.as_str()
            }
            _ => "NONE",
        };
        counter!(
            "ets_dispatch_total",
            "subscription_type" => event.subscription_type.as_str(),
            "trigger_type" => event.trigger_type.as_str(),
            "response_mode" => response_mode
        )
        .increment(1);

        let started = Instant::now();
        let result = match &event.subscription_config {
            SubscriptionConfig::Http(http) => self.dispatch_http(event, http).await,
            SubscriptionConfig::Script(script) => self.dispatch_script(event, script).await,
            SubscriptionConfig::EventBridge(eb) => self.dispatch_eventbridge(event, eb).await,
            SubscriptionConfig::Workflow(wf) => self.dispatch_workflow(event, wf).await,
            SubscriptionConfig::Inline(_) => self.dispatch_inline(event).await,
        };
        // Request/response outcomes reach the breaker through completion
        let reports_outcome = !event.is_request_response();

        match result {
            Ok(()) => {
                if reports_outcome {
                    breaker.on_success(started.elapsed());
                }
                debug!(
                    invocation_id = %event.invocation_id,
                    subscription_type = %event.subscription_type,
                    "Invocation dispatched"
                );
                Ok(DispatchOutcome::Delivered)
            }
            // Staging failures are retried with the invoked event itself
            Err(e @ EtsError::Storage { .. }) => Err(e),
            Err(e) => {
                let reason = e.to_string();
                if reports_outcome {
                    breaker.on_error(started.elapsed(), &reason);
                }
                self.report_failure(event, &reason).await;
                Ok(DispatchOutcome::Failed(reason))
            }
        }
    }

    /// Request id forwarded to targets: the caller's, or the invocation id
    fn request_id(&self, event: &TriggerInvokedEvent) -> String {
        event
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.config.request_id_header))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| event.invocation_id.clone())
    }

    fn add_callback(&self, event: &TriggerInvokedEvent, metadata: &mut Map<String, Value>) {
        if let Some(secret) = &event.secret {
            metadata.insert("callbackURL".to_string(), json!(self.config.callback_url));
            metadata.insert("secret".to_string(), json!(secret));
        }
    }

    /// Metadata block of an HTTP delivery
    fn http_metadata(
        &self,
        event: &TriggerInvokedEvent,
        response_mode: ResponseMode,
    ) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("triggerId".to_string(), json!(event.trigger_id));
        metadata.insert("triggerType".to_string(), json!(event.trigger_type.camel_case()));
        if event.is_request_response() {
            metadata.insert("responseMode".to_string(), json!(response_mode.as_str()));
            if response_mode != ResponseMode::Sync {
                self.add_callback(event, &mut metadata);
            }
        } else {
            metadata.insert("invocationId".to_string(), json!(event.invocation_id));
        }
        metadata
    }

    async fn dispatch_http(&self, event: &TriggerInvokedEvent, http: &HttpConfig) -> Result<()> {
        let mut headers = Map::new();
        headers.insert(self.config.request_id_header.clone(), json!(self.request_id(event)));
        match &http.auth {
            Some(HttpAuth::BasicAuth { username, password }) => {
                let credentials = BASE64.encode(format!("{}:{}", username, password));
                headers.insert(
                    "Authorization".to_string(),
                    json!(format!("Basic {}", credentials)),
                );
            }
            Some(HttpAuth::BearerToken { token }) => {
                headers.insert("Authorization".to_string(), json!(format!("Bearer {}", token)));
            }
            None => {}
        }

        let metadata = self.http_metadata(event, http.response_mode);
        let mut payload = json!({
            "url": http.url,
            "headers": headers,
            "body": merge_metadata(&event.input, metadata),
            "invocationId": event.invocation_id,
            "tenantId": event.tenant_id,
            "triggerId": event.trigger_id,
            "responseMode": http.response_mode.as_str(),
        });

        // A synchronous target never sees the secret; the dispatcher completes
        // the invocation with the target's response.
        if event.is_request_response() && http.response_mode == ResponseMode::Sync {
            if let Some(secret) = &event.secret {
                payload["completion"] = json!({
                    "callbackURL": self.config.callback_url,
                    "secret": secret,
                });
            }
        }

        self.invoker
            .invoke_lambda(&self.config.http_function, &payload)
            .await
            .map_err(EtsError::collaborator)
    }

    async fn dispatch_script(
        &self,
        event: &TriggerInvokedEvent,
        script: &ScriptConfig,
    ) -> Result<()> {
        if script.language != ScriptLanguage::Javascript {
            return Err(EtsError::unsupported(format!(
                "{:?} scripts cannot be executed",
                script.language
            )));
        }
        let encrypted = event.script_source.as_deref().ok_or_else(|| {
            EtsError::validation("scriptSource", "subscription has no script source")
        })?;
        let source = self.cipher.decrypt(encrypted)?;

        let mut payload = json!({
            "language": "JAVASCRIPT",
            "source": BASE64.encode(source),
            "headers": { self.config.request_id_header.clone(): self.request_id(event) },
            "input": event.input,
            "context": event.context,
            "invocationId": event.invocation_id,
            "tenantId": event.tenant_id,
            "triggerId": event.trigger_id,
            "triggerType": event.trigger_type.camel_case(),
        });
        if let (Some(secret), Value::Object(fields)) = (&event.secret, &mut payload) {
            fields.insert("callbackURL".to_string(), json!(self.config.callback_url));
            fields.insert("secret".to_string(), json!(secret));
        }

        self.invoker
            .invoke_lambda(&self.config.script_function, &payload)
            .await
            .map_err(EtsError::collaborator)
    }

    async fn dispatch_eventbridge(
        &self,
        event: &TriggerInvokedEvent,
        eb: &EventBridgeConfig,
    ) -> Result<()> {
        let source_name = eb.partner_event_source_name.as_deref().ok_or_else(|| {
            EtsError::validation("partnerEventSourceName", "partner event source not provisioned")
        })?;

        let mut metadata = Map::new();
        metadata.insert("invocationId".to_string(), json!(event.invocation_id));
        metadata.insert("triggerId".to_string(), json!(event.trigger_id));
        metadata.insert("triggerType".to_string(), json!(event.trigger_type.camel_case()));
        self.add_callback(event, &mut metadata);

        let detail = merge_metadata(&event.input, metadata);
        self.invoker
            .send_partner_event(&eb.aws_region, source_name, &event.trigger_id, &detail)
            .await
            .map_err(EtsError::collaborator)
    }

    async fn dispatch_workflow(
        &self,
        event: &TriggerInvokedEvent,
        workflow: &WorkflowConfig,
    ) -> Result<()> {
        let mut metadata = Map::new();
        metadata.insert("invocationId".to_string(), json!(event.invocation_id));
        metadata.insert("subscriptionId".to_string(), json!(event.subscription_id));
        metadata.insert("triggerType".to_string(), json!(event.trigger_type.camel_case()));
        self.add_callback(event, &mut metadata);

        let run = WorkflowRunEvent {
            invocation_id: event.invocation_id.clone(),
            tenant_id: event.tenant_id.clone(),
            workflow_id: workflow.workflow_id.clone(),
            subscription_id: event.subscription_id.clone(),
            input: merge_metadata(&event.input, metadata),
            requested_at: Utc::now(),
        };
        self.unit_of_work
            .commit(vec![Change::Stage(run.to_outbox_entry()?)])
            .await?;
        self.publisher.notify_committed();
        Ok(())
    }

    /// INLINE results are static, so a request/response invocation is
    /// completed right away from the subscription's configuration
    async fn dispatch_inline(&self, event: &TriggerInvokedEvent) -> Result<()> {
        let Some(secret) = &event.secret else {
            return Ok(());
        };
        let command = CompleteInvocationCommand {
            tenant_id: event.tenant_id.clone(),
            invocation_id: event.invocation_id.clone(),
            subscription_id: Some(event.subscription_id.clone()),
            secret: secret.clone(),
            output: None,
            error: None,
        };
        match self.completion.complete(command).await {
            Ok(_) | Err(EtsError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn report_failure(&self, event: &TriggerInvokedEvent, reason: &str) {
        let Some(secret) = &event.secret else {
            warn!(
                invocation_id = %event.invocation_id,
                tenant_id = %event.tenant_id,
                trigger_id = %event.trigger_id,
                reason,
                "Fire-and-forget dispatch failed"
            );
            return;
        };

        let command = CompleteInvocationCommand::failure(
            &event.tenant_id,
            &event.invocation_id,
            secret,
            reason,
        );
        match self.completion.complete(command).await {
            Ok(_) => info!(
                invocation_id = %event.invocation_id,
                reason,
                "Dispatch failure recorded as failed invocation"
            ),
            Err(EtsError::NotFound { .. }) => {
                debug!(invocation_id = %event.invocation_id, "Invocation already finalized")
            }
            Err(e) => warn!(
                invocation_id = %event.invocation_id,
                error = %e,
                "Failed to record dispatch failure; expiry will reclaim the invocation"
            ),
        }
    }
}

/// Merge metadata into an object input under [`METADATA_KEY`]; other
/// inputs are wrapped as `{"input": ..., "_metadata": ...}`
pub fn merge_metadata(input: &Value, metadata: Map<String, Value>) -> Value {
    match input {
        Value::Object(fields) => {
            let mut merged = fields.clone();
            merged.insert(METADATA_KEY.to_string(), Value::Object(metadata));
            Value::Object(merged)
        }
        other => json!({ "input": other, METADATA_KEY: metadata }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_metadata_into_object() {
        let mut metadata = Map::new();
        metadata.insert("triggerId".to_string(), json!("t1"));

        let merged = merge_metadata(&json!({ "x": 1 }), metadata.clone());
        assert_eq!(merged, json!({ "x": 1, "_metadata": { "triggerId": "t1" } }));

        let wrapped = merge_metadata(&json!([1, 2]), metadata);
        assert_eq!(
            wrapped,
            json!({ "input": [1, 2], "_metadata": { "triggerId": "t1" } })
        );
    }
}
