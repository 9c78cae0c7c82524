//! Resource descriptors and provisioning results

use super::stack::StackReference;
use crate::deferred::Deferred;
use crate::error::{Result, StackError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Declarative resource as handed over by the configuration layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource name, unique within its stack
    pub name: String,

    /// Resource type tag (e.g. "gcp-redis", "gcp-cloudsql-postgres")
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Type-specific configuration, including the `adopt` flag
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ResourceDescriptor {
    pub fn new(
        name: impl Into<String>,
        resource_type: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            config,
        }
    }

    /// Whether the resource is adopted instead of created
    pub fn adopt(&self) -> bool {
        self.get_config::<bool>("adopt").unwrap_or(false)
    }

    /// Get a configuration value as a specific type
    pub fn get_config<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Deserialize the whole configuration into its typed form
    pub fn typed_config<T: DeserializeOwned>(&self) -> Result<T> {
        let config = if self.config.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.config.clone()
        };
        serde_json::from_value(config).map_err(|e| StackError::config(&self.name, e.to_string()))
    }

    pub fn label(&self) -> String {
        format!("resource '{}' ({})", self.name, self.resource_type)
    }
}

/// How a stack consumes a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ConsumerRelation {
    /// Direct consumption of a resource of the stack or one of its ancestors
    Uses,
    /// Cross-stack consumption of a resource owned by `owner`
    DependsOn { name: String, owner: String },
}

impl ConsumerRelation {
    pub fn is_depends_on(&self) -> bool {
        matches!(self, ConsumerRelation::DependsOn { .. })
    }
}

impl fmt::Display for ConsumerRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerRelation::Uses => write!(f, "uses"),
            ConsumerRelation::DependsOn { name, owner } => {
                write!(f, "dependsOn '{}' (owner '{}')", name, owner)
            }
        }
    }
}

/// A resource as seen by one consuming workload
#[derive(Debug, Clone)]
pub struct ConsumedResource {
    pub descriptor: ResourceDescriptor,
    /// Stack instance that owns and exported the resource
    pub owner: StackReference,
    /// Derived name the owner provisioned it under
    pub derived_name: String,
    pub relation: ConsumerRelation,
    /// Engine handle, when the owner was provisioned in the current run
    pub handle: Option<ResourceHandle>,
}

impl ConsumedResource {
    /// Key used for template extensions (`${resource:<key>...}` or `${dependency:<key>...}`)
    pub fn template_key(&self) -> &str {
        match &self.relation {
            ConsumerRelation::Uses => &self.descriptor.name,
            ConsumerRelation::DependsOn { name, .. } => name,
        }
    }

    pub fn label(&self) -> String {
        format!(
            "{} from {} via {}",
            self.descriptor.label(),
            self.owner,
            self.relation
        )
    }
}

/// Opaque handle to an object managed by the provisioning engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Engine-wide unique identifier
    pub urn: String,
    pub resource_type: String,
}

impl ResourceHandle {
    pub fn new(urn: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            urn: urn.into(),
            resource_type: resource_type.into(),
        }
    }
}

/// Which path provisioned a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionAction {
    Create,
    Adopt,
}

impl fmt::Display for ProvisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionAction::Create => write!(f, "create"),
            ProvisionAction::Adopt => write!(f, "adopt"),
        }
    }
}

/// One output a resource publishes for consumers
#[derive(Debug, Clone)]
pub struct ResourceExport {
    pub key: String,
    pub value: Deferred<String>,
    pub secret: bool,
}

/// Result of a provisioning function or a compute processor
#[derive(Debug, Clone)]
pub struct ResourceOutput {
    pub resource_name: String,
    pub resource_type: String,
    pub derived_name: String,
    pub action: Option<ProvisionAction>,
    pub handle: Option<ResourceHandle>,
    pub exports: Vec<ResourceExport>,
}

impl ResourceOutput {
    pub fn new(descriptor: &ResourceDescriptor, derived_name: impl Into<String>) -> Self {
        Self {
            resource_name: descriptor.name.clone(),
            resource_type: descriptor.resource_type.clone(),
            derived_name: derived_name.into(),
            action: None,
            handle: None,
            exports: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: ProvisionAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_handle(mut self, handle: ResourceHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn export(&mut self, key: impl Into<String>, value: Deferred<String>, secret: bool) {
        self.exports.push(ResourceExport {
            key: key.into(),
            value,
            secret,
        });
    }

    pub fn export_keys(&self) -> BTreeSet<String> {
        self.exports.iter().map(|e| e.key.clone()).collect()
    }

    pub fn secret_keys(&self) -> BTreeSet<String> {
        self.exports
            .iter()
            .filter(|e| e.secret)
            .map(|e| e.key.clone())
            .collect()
    }
}
