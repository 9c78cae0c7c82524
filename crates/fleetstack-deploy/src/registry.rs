//! Provisioning function and compute processor registry
//!
//! Resource types are looked up through an explicit registry built at
//! startup and handed to the deployer, so tests can swap in fakes.

use crate::context::ProvisionContext;
use crate::resources;
use async_trait::async_trait;
use fleetstack_core::{
    export_key, ComputeContextCollector, ConsumedResource, ResourceDescriptor, ResourceOutput,
    Result, ShapeKind, StackDescriptor, StackError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One conventional export of a resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportField {
    /// Appended to the derived name to form the export key
    pub suffix: &'static str,
    pub secret: bool,
}

impl ExportField {
    pub const fn plain(suffix: &'static str) -> Self {
        Self {
            suffix,
            secret: false,
        }
    }

    pub const fn secret(suffix: &'static str) -> Self {
        Self {
            suffix,
            secret: true,
        }
    }

    pub fn key(&self, derived_name: &str) -> String {
        export_key(derived_name, self.suffix)
    }
}

/// Per-call parameters of a provisioning function
#[derive(Debug, Clone)]
pub struct ProvisionParams {
    /// Derived name of the resource
    pub derived_name: String,
}

/// Per-call parameters of a compute processor
#[derive(Debug, Clone)]
pub struct ProcessParams {
    /// Shape of the consuming workload
    pub shape: ShapeKind,
    /// Name of the consuming workload
    pub workload: String,
}

/// Create/Adopt handler of one resource type.
///
/// Both paths publish exactly [`exports`](ProvisioningFunction::exports).
#[async_trait]
pub trait ProvisioningFunction: Send + Sync {
    /// Resource type tag handled (e.g. "gcp-redis")
    fn resource_type(&self) -> &str;

    /// Exports written by both the Create and the Adopt path
    fn exports(&self) -> &'static [ExportField];

    /// Check the descriptor without touching the engine
    fn validate(&self, resource: &ResourceDescriptor) -> Result<()>;

    /// Create or adopt the resource and stage its exports
    async fn provision(
        &self,
        ctx: &ProvisionContext,
        stack: &StackDescriptor,
        resource: &ResourceDescriptor,
        params: &ProvisionParams,
    ) -> Result<ResourceOutput>;

    /// Export keys for a resource with the given derived name
    fn export_keys(&self, derived_name: &str) -> Vec<String> {
        self.exports().iter().map(|f| f.key(derived_name)).collect()
    }
}

/// Wires a consumed resource into a workload's compute context
#[async_trait]
pub trait ComputeProcessor: Send + Sync {
    /// Resource type tag handled
    fn resource_type(&self) -> &str;

    async fn process(
        &self,
        ctx: &ProvisionContext,
        stack: &StackDescriptor,
        resource: &ConsumedResource,
        collector: &ComputeContextCollector,
        params: &ProcessParams,
    ) -> Result<ResourceOutput>;
}

/// Registry of provisioning functions and compute processors by type tag
#[derive(Default, Clone)]
pub struct Registry {
    provisioners: BTreeMap<String, Arc<dyn ProvisioningFunction>>,
    processors: BTreeMap<String, Arc<dyn ComputeProcessor>>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in resource type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        resources::register_defaults(&mut registry);
        registry
    }

    /// Register a provisioning function under its resource type.
    ///
    /// An existing registration for the same type is replaced.
    pub fn register_provisioner(&mut self, provisioner: Arc<dyn ProvisioningFunction>) {
        let name = provisioner.resource_type().to_string();
        debug!("Registering provisioning function: {}", name);
        self.provisioners.insert(name, provisioner);
    }

    pub fn register_processor(&mut self, processor: Arc<dyn ComputeProcessor>) {
        let name = processor.resource_type().to_string();
        debug!("Registering compute processor: {}", name);
        self.processors.insert(name, processor);
    }

    pub fn provisioner(&self, resource_type: &str) -> Result<Arc<dyn ProvisioningFunction>> {
        self.provisioners
            .get(resource_type)
            .cloned()
            .ok_or_else(|| StackError::UnknownResourceType(resource_type.to_string()))
    }

    pub fn processor(&self, resource_type: &str) -> Result<Arc<dyn ComputeProcessor>> {
        self.processors
            .get(resource_type)
            .cloned()
            .ok_or_else(|| StackError::NoComputeProcessor(resource_type.to_string()))
    }

    /// Registered resource types, sorted
    pub fn resource_types(&self) -> Vec<&str> {
        self.provisioners.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("provisioners", &self.provisioners.keys().collect::<Vec<_>>())
            .field("processors", &self.processors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_type_both_ways() {
        let registry = Registry::with_defaults();
        let types = registry.resource_types();
        assert_eq!(
            types,
            vec![
                "gcp-bucket",
                "gcp-cloudsql-postgres",
                "gcp-gke-cluster",
                "gcp-pubsub-topic",
                "gcp-redis",
            ]
        );
        for resource_type in types {
            assert!(registry.processor(resource_type).is_ok(), "{}", resource_type);
        }
    }

    #[test]
    fn test_unknown_type() {
        let registry = Registry::new();
        assert!(matches!(
            registry.provisioner("aws-s3"),
            Err(StackError::UnknownResourceType(_))
        ));
        assert!(matches!(
            registry.processor("aws-s3"),
            Err(StackError::NoComputeProcessor(_))
        ));
    }

    #[test]
    fn test_export_keys_follow_derived_name() {
        let registry = Registry::with_defaults();
        let redis = registry.provisioner("gcp-redis").unwrap();
        assert_eq!(
            redis.export_keys("base--cache--prod"),
            vec!["base--cache--prod-host", "base--cache--prod-port"]
        );
    }
}
