//! Trigger Definitions
//!
//! A trigger is a named extension point raised by the platform. Its
//! definition lives in an external catalog; the engine only reads it.

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::FeatureStore;

/// Whether a trigger waits for a result from its subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    RequestResponse,
    FireAndForget,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestResponse => "REQUEST_RESPONSE",
            Self::FireAndForget => "FIRE_AND_FORGET",
        }
    }

    /// Form used in the metadata block delivered to targets
    pub fn camel_case(&self) -> &'static str {
        match self {
            Self::RequestResponse => "requestResponse",
            Self::FireAndForget => "fireAndForget",
        }
    }
}

/// Catalog entry describing a trigger and its input/output contract
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "type")]
    pub trigger_type: TriggerType,

    pub input_schema: Value,

    /// Required for request/response triggers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_output: Option<Value>,

    /// Tenants only see the trigger when this flag is enabled for them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_flag: Option<String>,

    #[serde(default)]
    pub event_sources: Vec<String>,

    /// Trigger-level deadline, used when the subscription has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_deadline_minutes: Option<u32>,
}

impl Trigger {
    pub fn new(id: impl Into<String>, trigger_type: TriggerType, input_schema: Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            trigger_type,
            input_schema,
            output_schema: None,
            example_input: None,
            example_output: None,
            feature_flag: None,
            event_sources: Vec::new(),
            response_deadline_minutes: None,
        }
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_feature_flag(mut self, flag: impl Into<String>) -> Self {
        self.feature_flag = Some(flag.into());
        self
    }

    pub fn with_response_deadline_minutes(mut self, minutes: u32) -> Self {
        self.response_deadline_minutes = Some(minutes);
        self
    }

    pub fn is_request_response(&self) -> bool {
        self.trigger_type == TriggerType::RequestResponse
    }

    /// A trigger without a feature flag is visible to every tenant
    pub fn is_enabled_for_tenant(&self, features: &dyn FeatureStore, tenant_id: &str) -> bool {
        match &self.feature_flag {
            Some(flag) => features.is_enabled(flag, tenant_id),
            None => true,
        }
    }

    pub fn validate_input(&self, input: &Value) -> std::result::Result<(), String> {
        validate_against(&self.input_schema, input)
    }

    /// Output of a trigger without an output schema is accepted as-is
    pub fn validate_output(&self, output: &Value) -> std::result::Result<(), String> {
        match &self.output_schema {
            Some(schema) => validate_against(schema, output),
            None => Ok(()),
        }
    }
}

fn validate_against(schema: &Value, instance: &Value) -> std::result::Result<(), String> {
    let compiled = JSONSchema::compile(schema).map_err(|e| format!("invalid schema: {}", e))?;
    if let Err(errors) = compiled.validate(instance) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(messages.join("; "));
    }
    Ok(())
}
