//! In-process routing of relayed outbox entries.
//!
//! Invoked events are dispatched by this process; every other topic goes
//! to the downstream bus.

use std::sync::Arc;

use async_trait::async_trait;
use ets_common::{topics, OutboxEntry};
use ets_outbox::EventBus;
use tracing::{debug, error};

use super::dispatch::{DispatchAdapter, DispatchOutcome};
use crate::domain::TriggerInvokedEvent;
use crate::error::EtsError;

pub struct DispatchRouter {
    dispatcher: Arc<DispatchAdapter>,
    downstream: Arc<dyn EventBus>,
}

impl DispatchRouter {
    pub fn new(dispatcher: Arc<DispatchAdapter>, downstream: Arc<dyn EventBus>) -> Self {
        Self { dispatcher, downstream }
    }
}

#[async_trait]
impl EventBus for DispatchRouter {
    async fn publish(&self, entry: &OutboxEntry) -> anyhow::Result<()> {
        if entry.topic != topics::TRIGGER_INVOKED {
            return self.downstream.publish(entry).await;
        }

        let event: TriggerInvokedEvent = match serde_json::from_value(entry.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                // Retrying cannot fix a malformed payload
                error!(entry_id = %entry.id, error = %e, "Dropping undecodable invoked event");
                return Ok(());
            }
        };

        match self.dispatcher.dispatch(&event).await {
            Ok(DispatchOutcome::Delivered) => Ok(()),
            Ok(DispatchOutcome::Failed(reason)) => {
                debug!(invocation_id = %event.invocation_id, reason = %reason, "Dispatch failed");
                Ok(())
            }
            Err(EtsError::CircuitOpen { .. }) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)),
        }
    }
}
