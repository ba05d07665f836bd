//! Trigger Catalog and Feature Flags
//!
//! Both are owned outside the engine and consumed read-only.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::domain::Trigger;
use crate::error::{EtsError, Result};

/// Grant value enabling a flag for every tenant
pub const ALL_TENANTS: &str = "*";

#[async_trait]
pub trait TriggerCatalog: Send + Sync {
    async fn find_by_id(&self, trigger_id: &str) -> Result<Option<Trigger>>;
}

pub trait FeatureStore: Send + Sync {
    fn is_enabled(&self, flag: &str, tenant_id: &str) -> bool;
}

/// Catalog backed by a fixed set of trigger definitions
#[derive(Debug, Default)]
pub struct StaticTriggerCatalog {
    triggers: HashMap<String, Trigger>,
}

impl StaticTriggerCatalog {
    pub fn new(triggers: impl IntoIterator<Item = Trigger>) -> Self {
        Self {
            triggers: triggers.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// Load a JSON array of trigger definitions
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EtsError::validation("catalog.triggersFile", format!("{}: {}", path.display(), e))
        })?;
        let triggers: Vec<Trigger> = serde_json::from_str(&raw)?;
        info!(path = %path.display(), triggers = triggers.len(), "Loaded trigger catalog");
        Ok(Self::new(triggers))
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

#[async_trait]
impl TriggerCatalog for StaticTriggerCatalog {
    async fn find_by_id(&self, trigger_id: &str) -> Result<Option<Trigger>> {
        Ok(self.triggers.get(trigger_id).cloned())
    }
}

/// Flag grants from configuration
#[derive(Debug, Default)]
pub struct StaticFeatureStore {
    grants: HashMap<String, HashSet<String>>,
}

impl StaticFeatureStore {
    pub fn new(grants: &HashMap<String, Vec<String>>) -> Self {
        Self {
            grants: grants
                .iter()
                .map(|(flag, tenants)| (flag.clone(), tenants.iter().cloned().collect()))
                .collect(),
        }
    }
}

impl FeatureStore for StaticFeatureStore {
    fn is_enabled(&self, flag: &str, tenant_id: &str) -> bool {
        self.grants
            .get(flag)
            .map(|tenants| tenants.contains(ALL_TENANTS) || tenants.contains(tenant_id))
            .unwrap_or(false)
    }
}
