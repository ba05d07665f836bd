//! Engine Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtsError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error on {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Trigger {trigger_id} already has a subscription for tenant {tenant_id}")]
    DuplicatedSubscription { tenant_id: String, trigger_id: String },

    #[error("Limit exceeded: {message}")]
    LimitExceeded { message: String },

    #[error("Illegal update of {field}: {message}")]
    IllegalUpdate { field: String, message: String },

    #[error("Subscription type {subscription_type} is not allowed for this caller")]
    IllegalSubscriptionType { subscription_type: String },

    #[error("Authorization error: {message}")]
    Unauthorized { message: String },

    #[error("Circuit open for tenant {tenant_id} trigger {trigger_id}")]
    CircuitOpen { tenant_id: String, trigger_id: String },

    #[error("Unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    #[error("Collaborator error: {message}")]
    Collaborator { message: String },

    #[error("Crypto error: {message}")]
    Crypto { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EtsError {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn duplicated(tenant_id: impl Into<String>, trigger_id: impl Into<String>) -> Self {
        Self::DuplicatedSubscription {
            tenant_id: tenant_id.into(),
            trigger_id: trigger_id.into(),
        }
    }

    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::LimitExceeded { message: message.into() }
    }

    pub fn illegal_update(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IllegalUpdate {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation { message: message.into() }
    }

    pub fn collaborator(error: impl std::fmt::Display) -> Self {
        Self::Collaborator { message: error.to_string() }
    }

    pub fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage { message: error.to_string() }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for EtsError {
    fn from(e: sqlx::Error) -> Self {
        Self::storage(e)
    }
}

pub type Result<T> = std::result::Result<T, EtsError>;
