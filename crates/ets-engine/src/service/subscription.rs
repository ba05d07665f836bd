//! Subscription Management
//!
//! Subscribe, update and unsubscribe commands. Validation and limit checks
//! run before any external resource is provisioned.

use std::sync::Arc;

use ets_config::{EventBridgeConfig as PartnerSourceSettings, LimitsConfig};
use tracing::{info, warn};

use crate::catalog::{FeatureStore, TriggerCatalog};
use crate::crypto::ScriptCipher;
use crate::domain::subscription::validate_response_deadline;
use crate::domain::{
    EventBridgeConfig, Subscription, SubscriptionChanges, SubscriptionConfig, SubscriptionType,
    Trigger, TriggerType,
};
use crate::error::{EtsError, Result};
use crate::filter::SubscriptionFilter;
use crate::invoker::PartnerEventSources;
use crate::repository::SubscriptionRepository;

/// Who is issuing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub principal_id: String,
    /// Internal services may create WORKFLOW subscriptions
    pub trusted: bool,
}

impl Caller {
    pub fn tenant(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            trusted: false,
        }
    }

    pub fn internal(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            trusted: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeCommand {
    pub tenant_id: String,
    pub trigger_id: String,
    pub name: String,
    pub description: Option<String>,
    pub config: SubscriptionConfig,
    pub filter: Option<String>,
    /// Plaintext; encrypted before it is stored
    pub script_source: Option<String>,
    pub response_deadline_minutes: Option<u32>,
    pub enabled: bool,
}

impl SubscribeCommand {
    pub fn new(
        tenant_id: impl Into<String>,
        trigger_id: impl Into<String>,
        name: impl Into<String>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            trigger_id: trigger_id.into(),
            name: name.into(),
            description: None,
            config,
            filter: None,
            script_source: None,
            response_deadline_minutes: None,
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_script_source(mut self, source: impl Into<String>) -> Self {
        self.script_source = Some(source.into());
        self
    }

    pub fn with_response_deadline_minutes(mut self, minutes: u32) -> Self {
        self.response_deadline_minutes = Some(minutes);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct UpdateSubscriptionCommand {
    pub id: String,
    pub tenant_id: String,
    pub trigger_id: String,
    /// `script_source` is plaintext here
    pub changes: SubscriptionChanges,
}

pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    catalog: Arc<dyn TriggerCatalog>,
    features: Arc<dyn FeatureStore>,
    partner_sources: Arc<dyn PartnerEventSources>,
    cipher: Arc<ScriptCipher>,
    limits: LimitsConfig,
    partner_settings: PartnerSourceSettings,
}

impl SubscriptionService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        catalog: Arc<dyn TriggerCatalog>,
        features: Arc<dyn FeatureStore>,
        partner_sources: Arc<dyn PartnerEventSources>,
        cipher: Arc<ScriptCipher>,
        limits: LimitsConfig,
        partner_settings: PartnerSourceSettings,
    ) -> Self {
        Self {
            subscriptions,
            catalog,
            features,
            partner_sources,
            cipher,
            limits,
            partner_settings,
        }
    }

    /// Trigger visible to the tenant, or NotFound
    async fn enabled_trigger(&self, tenant_id: &str, trigger_id: &str) -> Result<Trigger> {
        match self.catalog.find_by_id(trigger_id).await? {
            Some(trigger) if trigger.is_enabled_for_tenant(self.features.as_ref(), tenant_id) => {
                Ok(trigger)
            }
            _ => Err(EtsError::not_found("Trigger", trigger_id)),
        }
    }

    pub async fn subscribe(
        &self,
        caller: &Caller,
        command: SubscribeCommand,
    ) -> Result<Subscription> {
        let trigger = self.enabled_trigger(&command.tenant_id, &command.trigger_id).await?;
        let subscription_type = command.config.subscription_type();

        command.config.validate()?;
        validate_filter(command.filter.as_deref())?;
        validate_response_deadline(command.response_deadline_minutes)?;
        validate_script_source(subscription_type, command.script_source.as_deref())?;

        if subscription_type == SubscriptionType::Workflow && !caller.trusted {
            return Err(EtsError::IllegalSubscriptionType {
                subscription_type: subscription_type.to_string(),
            });
        }

        let existing = self
            .subscriptions
            .find_all_by_tenant_and_trigger(&command.tenant_id, &command.trigger_id)
            .await?;
        match trigger.trigger_type {
            TriggerType::FireAndForget => {
                if existing.len() >= self.limits.fire_and_forget_subscriptions {
                    return Err(EtsError::limit_exceeded(format!(
                        "trigger {} allows at most {} subscriptions",
                        trigger.id, self.limits.fire_and_forget_subscriptions
                    )));
                }
            }
            TriggerType::RequestResponse => {
                if !existing.is_empty() {
                    return Err(EtsError::duplicated(&command.tenant_id, &command.trigger_id));
                }
            }
        }

        if subscription_type == SubscriptionType::Script {
            self.check_script_limit(&command.tenant_id).await?;
        }

        let script_source = match command.script_source.as_deref() {
            Some(source) => Some(self.cipher.encrypt(source)?),
            None => None,
        };

        let mut subscription = Subscription::new(
            &command.tenant_id,
            &command.trigger_id,
            command.name,
            command.config,
        );
        subscription.description = command.description;
        subscription.filter = command.filter;
        subscription.script_source = script_source;
        subscription.response_deadline_minutes = command.response_deadline_minutes;
        subscription.enabled = command.enabled;

        if let SubscriptionConfig::EventBridge(eb) = &subscription.config {
            let provisioned = self.provision_partner_source(&subscription, eb).await?;
            subscription.config = SubscriptionConfig::EventBridge(provisioned);
        }

        if let Err(e) = self.subscriptions.insert(&subscription).await {
            if let SubscriptionConfig::EventBridge(eb) = &subscription.config {
                self.release_partner_source(eb).await;
            }
            return Err(e);
        }

        info!(
            tenant_id = %subscription.tenant_id,
            trigger_id = %subscription.trigger_id,
            subscription_id = %subscription.id,
            subscription_type = %subscription_type,
            principal_id = %caller.principal_id,
            "Subscription created"
        );
        Ok(subscription)
    }

    pub async fn update(
        &self,
        caller: &Caller,
        command: UpdateSubscriptionCommand,
    ) -> Result<Subscription> {
        let existing = match self.subscriptions.find_by_id(&command.id).await? {
            Some(s) if s.belongs_to(&command.tenant_id) && s.trigger_id == command.trigger_id => s,
            _ => return Err(EtsError::not_found("Subscription", &command.id)),
        };
        self.enabled_trigger(&command.tenant_id, &command.trigger_id).await?;

        let mut changes = command.changes;
        let old_type = existing.subscription_type();

        if let Some(config) = changes.config.take() {
            let new_type = config.subscription_type();
            let config = match (&existing.config, config) {
                (SubscriptionConfig::EventBridge(old), SubscriptionConfig::EventBridge(new)) => {
                    if new.aws_account != old.aws_account {
                        return Err(EtsError::illegal_update(
                            "awsAccount",
                            "the AWS account of an EVENTBRIDGE subscription cannot change",
                        ));
                    }
                    if new.aws_region != old.aws_region {
                        return Err(EtsError::illegal_update(
                            "awsRegion",
                            "the AWS region of an EVENTBRIDGE subscription cannot change",
                        ));
                    }
                    // Provisioned source stays attached
                    SubscriptionConfig::EventBridge(EventBridgeConfig {
                        partner_event_source_name: old.partner_event_source_name.clone(),
                        partner_event_source_arn: old.partner_event_source_arn.clone(),
                        ..new
                    })
                }
                (_, config) => {
                    let was_eventbridge = old_type == SubscriptionType::EventBridge;
                    if was_eventbridge != (new_type == SubscriptionType::EventBridge) {
                        return Err(EtsError::illegal_update(
                            "type",
                            format!(
                                "cannot change subscription type from {} to {}",
                                old_type, new_type
                            ),
                        ));
                    }
                    config
                }
            };
            config.validate()?;

            if new_type != old_type {
                if new_type == SubscriptionType::Workflow && !caller.trusted {
                    return Err(EtsError::IllegalSubscriptionType {
                        subscription_type: new_type.to_string(),
                    });
                }
                if new_type == SubscriptionType::Script {
                    self.check_script_limit(&existing.tenant_id).await?;
                }
                if old_type == SubscriptionType::Script && changes.script_source.is_none() {
                    changes.script_source = Some(None);
                }
            }
            changes.config = Some(config);
        }

        if let Some(filter) = &changes.filter {
            validate_filter(filter.as_deref())?;
        }
        if let Some(minutes) = changes.response_deadline_minutes {
            validate_response_deadline(minutes)?;
        }

        let effective_type = changes
            .config
            .as_ref()
            .map(|c| c.subscription_type())
            .unwrap_or(old_type);
        if let Some(source) = changes.script_source.take() {
            validate_script_source(effective_type, source.as_deref())?;
            changes.script_source = Some(match source {
                Some(plain) => Some(self.cipher.encrypt(&plain)?),
                None => None,
            });
        } else if effective_type == SubscriptionType::Script && existing.script_source.is_none() {
            return Err(EtsError::validation(
                "scriptSource",
                "SCRIPT subscriptions need a script source",
            ));
        }

        let updated = existing.updated(changes);
        self.subscriptions.update(&updated).await?;

        info!(
            tenant_id = %updated.tenant_id,
            subscription_id = %updated.id,
            principal_id = %caller.principal_id,
            "Subscription updated"
        );
        Ok(updated)
    }

    pub async fn unsubscribe(&self, id: &str, tenant_id: &str) -> Result<()> {
        let subscription = match self.subscriptions.find_by_id(id).await? {
            Some(s) if s.belongs_to(tenant_id) => s,
            _ => return Err(EtsError::not_found("Subscription", id)),
        };

        if let SubscriptionConfig::EventBridge(eb) = &subscription.config {
            if let Some(name) = &eb.partner_event_source_name {
                self.partner_sources
                    .delete(&eb.aws_account, &eb.aws_region, name)
                    .await
                    .map_err(EtsError::collaborator)?;
                info!(partner_event_source = %name, "Partner event source released");
            }
        }

        self.subscriptions.delete(id).await?;
        info!(tenant_id, subscription_id = id, "Subscription deleted");
        Ok(())
    }

    pub async fn get(&self, id: &str, tenant_id: &str) -> Result<Subscription> {
        match self.subscriptions.find_by_id(id).await? {
            Some(s) if s.belongs_to(tenant_id) => Ok(s),
            _ => Err(EtsError::not_found("Subscription", id)),
        }
    }

    pub async fn list(&self, tenant_id: &str, trigger_id: &str) -> Result<Vec<Subscription>> {
        self.subscriptions
            .find_all_by_tenant_and_trigger(tenant_id, trigger_id)
            .await
    }

    async fn check_script_limit(&self, tenant_id: &str) -> Result<()> {
        let scripts = self
            .subscriptions
            .find_all_by_tenant_and_type(tenant_id, SubscriptionType::Script)
            .await?;
        if scripts.len() >= self.limits.script_subscriptions {
            return Err(EtsError::limit_exceeded(format!(
                "tenant {} allows at most {} SCRIPT subscriptions",
                tenant_id, self.limits.script_subscriptions
            )));
        }
        Ok(())
    }

    async fn provision_partner_source(
        &self,
        subscription: &Subscription,
        eb: &EventBridgeConfig,
    ) -> Result<EventBridgeConfig> {
        if self.partner_settings.is_restricted_region(&eb.aws_region) {
            warn!(
                tenant_id = %subscription.tenant_id,
                aws_region = %eb.aws_region,
                "Partner event sources may be unavailable in this partition"
            );
        }

        let name = partner_source_name(
            &self.partner_settings.partner_source_prefix,
            &subscription.tenant_id,
            &subscription.trigger_id,
            &subscription.id,
        );
        let source = self
            .partner_sources
            .create(&eb.aws_account, &eb.aws_region, &name)
            .await
            .map_err(EtsError::collaborator)?;

        info!(
            partner_event_source = %source.name,
            arn = %source.arn,
            "Partner event source provisioned"
        );
        Ok(EventBridgeConfig {
            partner_event_source_name: Some(source.name),
            partner_event_source_arn: Some(source.arn),
            ..eb.clone()
        })
    }

    async fn release_partner_source(&self, eb: &EventBridgeConfig) {
        let Some(name) = &eb.partner_event_source_name else {
            return;
        };
        let released = self
            .partner_sources
            .delete(&eb.aws_account, &eb.aws_region, name)
            .await;
        if let Err(e) = released {
            warn!(
                partner_event_source = %name,
                error = %e,
                "Failed to release partner event source"
            );
        }
    }
}

fn validate_filter(filter: Option<&str>) -> Result<()> {
    match filter {
        Some(expression) if !expression.trim().is_empty() => {
            SubscriptionFilter::parse(expression).map(|_| ())
        }
        _ => Ok(()),
    }
}

fn validate_script_source(subscription_type: SubscriptionType, source: Option<&str>) -> Result<()> {
    let has_source = source.map(|s| !s.trim().is_empty()).unwrap_or(false);
    match (subscription_type, has_source) {
        (SubscriptionType::Script, false) => {
            Err(EtsError::validation("scriptSource", "SCRIPT subscriptions need a script source"))
        }
        (SubscriptionType::Script, true) | (_, false) => Ok(()),
        (_, true) => Err(EtsError::validation(
            "scriptSource",
            "only SCRIPT subscriptions carry a script source",
        )),
    }
}

/// Partner source names allow `[.\-_A-Za-z0-9]` segments separated by `/`
fn partner_source_name(
    prefix: &str,
    tenant_id: &str,
    trigger_id: &str,
    subscription_id: &str,
) -> String {
    let segment = |value: &str| -> String {
        value
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!(
        "{}/{}/{}/{}",
        prefix.trim_end_matches('/'),
        segment(tenant_id),
        segment(trigger_id),
        segment(subscription_id)
    )
}
