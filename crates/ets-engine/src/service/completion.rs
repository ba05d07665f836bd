//! Invocation Completion
//!
//! Finalizes a request/response invocation from the target's callback. The
//! invocation row is deleted in the same unit of work that stages the
//! terminal event; if the row is already gone (completed or expired
//! concurrently) nothing is applied and the caller gets NotFound.

use std::sync::Arc;

use chrono::Utc;
use ets_outbox::OutboxPublisher;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, info};

use super::circuit_breaker::CircuitBreakerRegistry;
use crate::catalog::TriggerCatalog;
use crate::domain::{
    DomainEvent, Invocation, InvocationCompletedEvent, InvocationFailedEvent, InvocationStatus,
    SubscriptionConfig,
};
use crate::error::{EtsError, Result};
use crate::repository::{
    Change, CommitOutcome, InvocationRepository, SubscriptionRepository, UnitOfWork,
};

pub const NO_OUTPUT_ERROR: &str = "no output was provided";

#[derive(Debug, Clone)]
pub struct CompleteInvocationCommand {
    pub tenant_id: String,
    pub invocation_id: String,
    /// INLINE subscription whose static result replaces `output`/`error`
    pub subscription_id: Option<String>,
    pub secret: String,
    pub output: Option<Value>,
    /// A blank error counts as no error
    pub error: Option<String>,
}

impl CompleteInvocationCommand {
    pub fn success(
        tenant_id: impl Into<String>,
        invocation_id: impl Into<String>,
        secret: impl Into<String>,
        output: Value,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            invocation_id: invocation_id.into(),
            subscription_id: None,
            secret: secret.into(),
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(
        tenant_id: impl Into<String>,
        invocation_id: impl Into<String>,
        secret: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            invocation_id: invocation_id.into(),
            subscription_id: None,
            secret: secret.into(),
            output: None,
            error: Some(error.into()),
        }
    }
}

pub(crate) fn failed_event(
    invocation: &Invocation,
    reason: impl Into<String>,
) -> InvocationFailedEvent {
    InvocationFailedEvent {
        invocation_id: invocation.id.clone(),
        tenant_id: invocation.tenant_id.clone(),
        trigger_id: invocation.trigger_id.clone(),
        reason: reason.into(),
        failed_at: Utc::now(),
    }
}

pub struct CompletionService {
    invocations: Arc<dyn InvocationRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    catalog: Arc<dyn TriggerCatalog>,
    breakers: Arc<CircuitBreakerRegistry>,
    unit_of_work: Arc<dyn UnitOfWork>,
    publisher: Arc<OutboxPublisher>,
}

impl CompletionService {
    pub fn new(
        invocations: Arc<dyn InvocationRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        catalog: Arc<dyn TriggerCatalog>,
        breakers: Arc<CircuitBreakerRegistry>,
        unit_of_work: Arc<dyn UnitOfWork>,
        publisher: Arc<OutboxPublisher>,
    ) -> Self {
        Self {
            invocations,
            subscriptions,
            catalog,
            breakers,
            unit_of_work,
            publisher,
        }
    }

    pub async fn complete(&self, command: CompleteInvocationCommand) -> Result<InvocationStatus> {
        let invocation = match self.invocations.find_by_id(&command.invocation_id).await? {
            Some(i) if i.belongs_to(&command.tenant_id) => i,
            _ => return Err(EtsError::not_found("Invocation", &command.invocation_id)),
        };

        if !invocation.verify_secret(&command.secret) {
            return Err(EtsError::unauthorized("secret does not match the invocation"));
        }

        let (error, output) = match &command.subscription_id {
            Some(subscription_id) => {
                self.inline_result(&command.tenant_id, subscription_id).await?
            }
            None => (command.error, command.output),
        };
        let (error, output) = self.resolve_outcome(&invocation, error, output).await?;

        let (status, entry) = match &error {
            Some(reason) => (
                InvocationStatus::Failed,
                failed_event(&invocation, reason).to_outbox_entry()?,
            ),
            None => {
                let event = InvocationCompletedEvent {
                    invocation_id: invocation.id.clone(),
                    tenant_id: invocation.tenant_id.clone(),
                    trigger_id: invocation.trigger_id.clone(),
                    output: output.unwrap_or(Value::Null),
                    completed_at: Utc::now(),
                };
                (InvocationStatus::Completed, event.to_outbox_entry()?)
            }
        };

        let changes = vec![
            Change::DeleteInvocation(invocation.id.clone()),
            Change::Stage(entry),
        ];
        let outcome = self.unit_of_work.commit(changes).await?;
        if outcome == CommitOutcome::AlreadyGone {
            debug!(invocation_id = %invocation.id, "Invocation finalized concurrently");
            return Err(EtsError::not_found("Invocation", &invocation.id));
        }
        self.publisher.notify_committed();

        let elapsed = invocation.elapsed(Utc::now());
        let breaker = self.breakers.get(&invocation.tenant_id, &invocation.trigger_id);
        histogram!("ets_invocation_duration_seconds").record(elapsed.as_secs_f64());
        match &error {
            Some(reason) => {
                breaker.on_error(elapsed, reason);
                counter!("ets_invocations_failed_total", "reason" => "error").increment(1);
                info!(
                    invocation_id = %invocation.id,
                    tenant_id = %invocation.tenant_id,
                    trigger_id = %invocation.trigger_id,
                    reason = %reason,
                    "Invocation failed"
                );
            }
            None => {
                breaker.on_success(elapsed);
                counter!("ets_invocations_completed_total").increment(1);
                info!(
                    invocation_id = %invocation.id,
                    tenant_id = %invocation.tenant_id,
                    trigger_id = %invocation.trigger_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Invocation completed"
                );
            }
        }
        Ok(status)
    }

    async fn inline_result(
        &self,
        tenant_id: &str,
        subscription_id: &str,
    ) -> Result<(Option<String>, Option<Value>)> {
        let subscription = match self.subscriptions.find_by_id(subscription_id).await? {
            Some(s) if s.belongs_to(tenant_id) => s,
            _ => return Err(EtsError::not_found("Subscription", subscription_id)),
        };
        match subscription.config {
            SubscriptionConfig::Inline(inline) => Ok((inline.error, inline.output)),
            other => Err(EtsError::validation(
                "subscriptionId",
                format!("{} subscriptions have no static result", other.subscription_type()),
            )),
        }
    }

    /// An error wins over output; output must satisfy the trigger's schema.
    /// Empty or whitespace-only errors are ignored so a failure always
    /// carries a reason.
    async fn resolve_outcome(
        &self,
        invocation: &Invocation,
        error: Option<String>,
        output: Option<Value>,
    ) -> Result<(Option<String>, Option<Value>)> {
        if let Some(error) = error.filter(|e| !e.trim().is_empty()) {
            return Ok((Some(error), None));
        }
        let Some(output) = output else {
            return Ok((Some(NO_OUTPUT_ERROR.to_string()), None));
        };

        let validation = match self.catalog.find_by_id(&invocation.trigger_id).await? {
            Some(trigger) => trigger.validate_output(&output),
            None => Err(format!("trigger {} no longer exists", invocation.trigger_id)),
        };
        match validation {
            Ok(()) => Ok((None, Some(output))),
            Err(message) => Ok((Some(format!("output validation failed: {}", message)), None)),
        }
    }
}
