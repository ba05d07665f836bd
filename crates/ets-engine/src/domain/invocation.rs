//! Invocation Entity
//!
//! One firing of a trigger against one subscription. Request/response
//! invocations are persisted until completed or expired; fire-and-forget
//! invocations are transient and carry no deadline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto;

/// States of the invocation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Created,
    Dispatched,
    Completed,
    Failed,
    Expired,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub id: String,
    pub tenant_id: String,
    pub trigger_id: String,
    pub subscription_id: String,
    /// SHA-256 of the completion secret; empty for transient invocations
    pub secret_hash: String,
    pub created: DateTime<Utc>,
    /// `None` marks a fire-and-forget invocation
    pub deadline: Option<DateTime<Utc>>,
}

impl Invocation {
    /// Create a persistent invocation together with its plaintext secret.
    /// Only the hash is kept on the invocation.
    pub fn request_response(
        tenant_id: impl Into<String>,
        trigger_id: impl Into<String>,
        subscription_id: impl Into<String>,
        deadline_minutes: u32,
    ) -> (Self, String) {
        let secret = crypto::generate_secret();
        let created = Utc::now();
        let invocation = Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            trigger_id: trigger_id.into(),
            subscription_id: subscription_id.into(),
            secret_hash: crypto::hash_secret(&secret),
            created,
            deadline: Some(created + Duration::minutes(i64::from(deadline_minutes))),
        };
        (invocation, secret)
    }

    pub fn fire_and_forget(
        tenant_id: impl Into<String>,
        trigger_id: impl Into<String>,
        subscription_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            trigger_id: trigger_id.into(),
            subscription_id: subscription_id.into(),
            secret_hash: String::new(),
            created: Utc::now(),
            deadline: None,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.deadline.is_some()
    }

    /// Status right after the orchestrator created it
    pub fn initial_status(&self) -> InvocationStatus {
        if self.is_persistent() {
            InvocationStatus::Created
        } else {
            InvocationStatus::Dispatched
        }
    }

    pub fn belongs_to(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }

    pub fn verify_secret(&self, candidate: &str) -> bool {
        self.is_persistent() && crypto::secret_matches(&self.secret_hash, candidate)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| d < now).unwrap_or(false)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.created).to_std().unwrap_or_default()
    }
}
