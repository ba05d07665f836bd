//! Subscription Entity
//!
//! A tenant's registration to receive invocations of a trigger through one
//! delivery mechanism. Subscriptions are immutable values: updates produce a
//! new value through [`Subscription::updated`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EtsError, Result};

/// Longest response deadline a subscription may ask for (7 days)
pub const MAX_RESPONSE_DEADLINE_MINUTES: u32 = 7 * 24 * 60;

/// Delivery mechanism, derived from the configuration variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionType {
    Http,
    Script,
    #[serde(rename = "EVENTBRIDGE")]
    EventBridge,
    Workflow,
    Inline,
}

impl SubscriptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::Script => "SCRIPT",
            Self::EventBridge => "EVENTBRIDGE",
            Self::Workflow => "WORKFLOW",
            Self::Inline => "INLINE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HTTP" => Some(Self::Http),
            "SCRIPT" => Some(Self::Script),
            "EVENTBRIDGE" => Some(Self::EventBridge),
            "WORKFLOW" => Some(Self::Workflow),
            "INLINE" => Some(Self::Inline),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an HTTP target answers a request/response invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseMode {
    /// The target's HTTP response is the result
    #[default]
    Sync,
    /// The target acknowledges and calls back later
    Async,
    /// The target decides per request
    Dynamic,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Async => "ASYNC",
            Self::Dynamic => "DYNAMIC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HttpAuth {
    BasicAuth { username: String, password: String },
    BearerToken { token: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    pub url: String,
    #[serde(default)]
    pub response_mode: ResponseMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HttpAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScriptLanguage {
    Javascript,
    Python,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    pub language: ScriptLanguage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBridgeConfig {
    pub aws_account: String,
    pub aws_region: String,
    /// Set when the partner event source is provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_event_source_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_event_source_arn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    pub workflow_id: String,
}

/// Static result returned without contacting any target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Type-specific configuration, one variant per subscription type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionConfig {
    Http(HttpConfig),
    Script(ScriptConfig),
    #[serde(rename = "EVENTBRIDGE")]
    EventBridge(EventBridgeConfig),
    Workflow(WorkflowConfig),
    Inline(InlineConfig),
}

impl SubscriptionConfig {
    pub fn subscription_type(&self) -> SubscriptionType {
        match self {
            Self::Http(_) => SubscriptionType::Http,
            Self::Script(_) => SubscriptionType::Script,
            Self::EventBridge(_) => SubscriptionType::EventBridge,
            Self::Workflow(_) => SubscriptionType::Workflow,
            Self::Inline(_) => SubscriptionType::Inline,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Http(http) => {
                let rest = http
                    .url
                    .strip_prefix("https://")
                    .or_else(|| http.url.strip_prefix("http://"));
                match rest {
                    Some(host) if !host.is_empty() && !host.contains(char::is_whitespace) => {}
                    _ => return Err(EtsError::validation("url", "must be an http or https URL")),
                }
                match &http.auth {
                    Some(HttpAuth::BasicAuth { username, password })
                        if username.is_empty() || password.is_empty() =>
                    {
                        Err(EtsError::validation(
                            "auth",
                            "basic auth requires username and password",
                        ))
                    }
                    Some(HttpAuth::BearerToken { token }) if token.is_empty() => {
                        Err(EtsError::validation("auth", "bearer token must not be empty"))
                    }
                    _ => Ok(()),
                }
            }
            Self::Script(_) => Ok(()),
            Self::EventBridge(eb) => {
                if !is_aws_account(&eb.aws_account) {
                    return Err(EtsError::validation(
                        "awsAccount",
                        "must be a 12 digit AWS account id",
                    ));
                }
                if !is_aws_region(&eb.aws_region) {
                    return Err(EtsError::validation(
                        "awsRegion",
                        "must be an AWS region such as us-east-1",
                    ));
                }
                Ok(())
            }
            Self::Workflow(wf) => {
                if wf.workflow_id.trim().is_empty() {
                    return Err(EtsError::validation("workflowId", "must not be empty"));
                }
                Ok(())
            }
            Self::Inline(inline) => {
                if inline.output.is_none() && inline.error.is_none() {
                    return Err(EtsError::validation(
                        "config",
                        "inline subscriptions need an output or an error",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn is_aws_account(value: &str) -> bool {
    value.len() == 12 && value.bytes().all(|b| b.is_ascii_digit())
}

/// `us-east-1`, `eu-central-2`, `us-gov-west-1`, `ap-southeast-4`
fn is_aws_region(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    let (area, rest) = match parts.as_slice() {
        [area, "gov", rest @ ..] => (*area, rest),
        [area, rest @ ..] => (*area, rest),
        [] => return false,
    };
    let [direction, number] = rest else {
        return false;
    };
    area.len() == 2
        && area.bytes().all(|b| b.is_ascii_lowercase())
        && !direction.is_empty()
        && direction.bytes().all(|b| b.is_ascii_lowercase())
        && !number.is_empty()
        && number.bytes().all(|b| b.is_ascii_digit())
}

pub fn validate_response_deadline(minutes: Option<u32>) -> Result<()> {
    match minutes {
        Some(m) if m == 0 || m > MAX_RESPONSE_DEADLINE_MINUTES => Err(EtsError::validation(
            "responseDeadline",
            format!("must be between 1 and {} minutes", MAX_RESPONSE_DEADLINE_MINUTES),
        )),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: String,
    pub tenant_id: String,
    pub trigger_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub config: SubscriptionConfig,
    /// JSONPath expression evaluated against the invocation input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Encrypted script source (SCRIPT subscriptions only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_deadline_minutes: Option<u32>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        tenant_id: impl Into<String>,
        trigger_id: impl Into<String>,
        name: impl Into<String>,
        config: SubscriptionConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            trigger_id: trigger_id.into(),
            name: name.into(),
            description: None,
            config,
            filter: None,
            script_source: None,
            response_deadline_minutes: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn subscription_type(&self) -> SubscriptionType {
        self.config.subscription_type()
    }

    pub fn belongs_to(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }

    /// Copy of this subscription with the given changes applied
    pub fn updated(&self, changes: SubscriptionChanges) -> Subscription {
        Subscription {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            trigger_id: self.trigger_id.clone(),
            name: changes.name.unwrap_or_else(|| self.name.clone()),
            description: changes.description.unwrap_or_else(|| self.description.clone()),
            config: changes.config.unwrap_or_else(|| self.config.clone()),
            filter: changes.filter.unwrap_or_else(|| self.filter.clone()),
            script_source: changes.script_source.unwrap_or_else(|| self.script_source.clone()),
            response_deadline_minutes: changes
                .response_deadline_minutes
                .unwrap_or(self.response_deadline_minutes),
            enabled: changes.enabled.unwrap_or(self.enabled),
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

/// Whitelisted subscription fields; `None` keeps the current value and
/// `Some(None)` clears an optional one.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChanges {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub config: Option<SubscriptionConfig>,
    pub filter: Option<Option<String>>,
    pub script_source: Option<Option<String>>,
    pub response_deadline_minutes: Option<Option<u32>>,
    pub enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eventbridge(account: &str, region: &str) -> SubscriptionConfig {
        SubscriptionConfig::EventBridge(EventBridgeConfig {
            aws_account: account.to_string(),
            aws_region: region.to_string(),
            partner_event_source_name: None,
            partner_event_source_arn: None,
        })
    }

    #[test]
    fn test_config_tagged_serialization() {
        let config: SubscriptionConfig = serde_json::from_value(json!({
            "type": "HTTP",
            "url": "https://hooks.acme.test/access",
            "responseMode": "ASYNC",
            "auth": { "type": "BEARER_TOKEN", "token": "t0k" }
        }))
        .unwrap();

        assert_eq!(config.subscription_type(), SubscriptionType::Http);
        let SubscriptionConfig::Http(http) = &config else {
            panic!("expected HTTP config");
        };
        assert_eq!(http.response_mode, ResponseMode::Async);

        let value = serde_json::to_value(eventbridge("123456789012", "us-east-1")).unwrap();
        assert_eq!(value["type"], "EVENTBRIDGE");
        assert_eq!(value["awsAccount"], "123456789012");
    }

    #[test]
    fn test_http_validation() {
        let ok = SubscriptionConfig::Http(HttpConfig {
            url: "https://hooks.acme.test".to_string(),
            response_mode: ResponseMode::Sync,
            auth: Some(HttpAuth::BasicAuth {
                username: "svc".to_string(),
                password: "pw".to_string(),
            }),
        });
        assert!(ok.validate().is_ok());

        let bad_scheme = SubscriptionConfig::Http(HttpConfig {
            url: "ftp://hooks.acme.test".to_string(),
            response_mode: ResponseMode::Sync,
            auth: None,
        });
        assert!(matches!(
            bad_scheme.validate(),
            Err(EtsError::Validation { field, .. }) if field == "url"
        ));

        let empty_token = SubscriptionConfig::Http(HttpConfig {
            url: "http://localhost:8080/hook".to_string(),
            response_mode: ResponseMode::Sync,
            auth: Some(HttpAuth::BearerToken { token: String::new() }),
        });
        assert!(matches!(
            empty_token.validate(),
            Err(EtsError::Validation { field, .. }) if field == "auth"
        ));
    }

    #[test]
    fn test_eventbridge_validation() {
        assert!(eventbridge("123456789012", "us-east-1").validate().is_ok());
        assert!(eventbridge("123456789012", "us-gov-west-1").validate().is_ok());
        assert!(eventbridge("123456789012", "ap-southeast-4").validate().is_ok());

        assert!(matches!(
            eventbridge("1234", "us-east-1").validate(),
            Err(EtsError::Validation { field, .. }) if field == "awsAccount"
        ));
        assert!(matches!(
            eventbridge("123456789012", "useast1").validate(),
            Err(EtsError::Validation { field, .. }) if field == "awsRegion"
        ));
        assert!(eventbridge("123456789012", "US-EAST-1").validate().is_err());
    }

    #[test]
    fn test_inline_requires_output_or_error() {
        let empty = SubscriptionConfig::Inline(InlineConfig { output: None, error: None });
        assert!(empty.validate().is_err());

        let error_only = SubscriptionConfig::Inline(InlineConfig {
            output: None,
            error: Some("denied".to_string()),
        });
        assert!(error_only.validate().is_ok());
    }

    #[test]
    fn test_response_deadline_range() {
        assert!(validate_response_deadline(None).is_ok());
        assert!(validate_response_deadline(Some(1)).is_ok());
        assert!(validate_response_deadline(Some(MAX_RESPONSE_DEADLINE_MINUTES)).is_ok());
        assert!(validate_response_deadline(Some(0)).is_err());
        assert!(validate_response_deadline(Some(MAX_RESPONSE_DEADLINE_MINUTES + 1)).is_err());
    }

    #[test]
    fn test_updated_copies_with_changes() {
        let mut original = Subscription::new(
            "acme",
            "test:trigger",
            "hook",
            SubscriptionConfig::Workflow(WorkflowConfig {
                workflow_id: "wf-1".to_string(),
            }),
        );
        original.filter = Some("$.identityId".to_string());

        let updated = original.updated(SubscriptionChanges {
            name: Some("renamed".to_string()),
            filter: Some(None),
            enabled: Some(false),
            ..Default::default()
        });

        assert_eq!(updated.id, original.id);
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.filter, None);
        assert!(!updated.enabled);
        assert_eq!(updated.config, original.config);
        assert_eq!(original.name, "hook");
        assert!(updated.updated_at >= original.updated_at);
    }
}
