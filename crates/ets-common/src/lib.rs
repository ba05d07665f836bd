use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

pub mod logging;

// ============================================================================
// Topics
// ============================================================================

/// Event bus topics produced by the trigger service
pub mod topics {
    /// Dispatch instructions, consumed by the dispatch adapter
    pub const TRIGGER_INVOKED: &str = "ets.trigger.invoked";
    /// Successful terminal outcome of a request/response invocation
    pub const INVOCATION_COMPLETED: &str = "ets.invocation.completed";
    /// Failed or timed-out terminal outcome
    pub const INVOCATION_FAILED: &str = "ets.invocation.failed";
    /// Internal workflow engine run requests
    pub const WORKFLOW_RUN: &str = "ets.workflow.run";
}

// ============================================================================
// Outbox Types
// ============================================================================

/// A staged domain event waiting to be relayed to the event bus.
///
/// Entries are written in the same transaction as the state change that
/// produced them and removed once the bus has accepted the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxEntry {
    pub id: String,
    pub topic: String,
    /// Partition key; entries sharing a group are relayed in insertion order
    pub message_group: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(
        topic: impl Into<String>,
        message_group: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            message_group: message_group.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Serialize an event into an entry for the given topic
    pub fn from_event<E: Serialize>(
        topic: &str,
        message_group: impl Into<String>,
        event: &E,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(topic, message_group, serde_json::to_value(event)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        invocation_id: String,
    }

    #[test]
    fn test_entry_from_event() {
        let entry = OutboxEntry::from_event(
            topics::INVOCATION_COMPLETED,
            "tenant-1:inv-1",
            &Sample { invocation_id: "inv-1".to_string() },
        )
        .unwrap();

        assert_eq!(entry.topic, "ets.invocation.completed");
        assert_eq!(entry.message_group, "tenant-1:inv-1");
        assert_eq!(entry.payload["invocationId"], "inv-1");
        assert!(!entry.id.is_empty());
    }

    #[test]
    fn test_entry_ids_are_unique() {
        let a = OutboxEntry::new(topics::WORKFLOW_RUN, "g", serde_json::json!({}));
        let b = OutboxEntry::new(topics::WORKFLOW_RUN, "g", serde_json::json!({}));
        assert_ne!(a.id, b.id);
    }
}
