//! Provisioning engine interface
//!
//! The engine performs the actual create/import calls against cloud APIs,
//! deploys workloads, runs one-shot jobs and owns infrastructure state.
//! FleetStack only describes what it wants; everything below this trait is
//! the engine's business, including retries.

use crate::error::Result;
use async_trait::async_trait;
use fleetstack_core::{Deferred, JobSpec, ResourceHandle, StackReference, WorkloadShape};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Engine-held random secret.
///
/// Requested with a `length` property; the engine generates the value once,
/// keeps it in its state and reports it as the `result` attribute on every
/// later create of the same logical name.
pub const RANDOM_PASSWORD_KIND: &str = "random-password";

/// Resource attributes reported by the engine (IP addresses, URLs, ...)
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Read a string attribute, accepting numbers as well
pub fn attribute_string(attributes: &Attributes, key: &str) -> Option<String> {
    match attributes.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Provisioning engine abstraction
///
/// Implementations must be safe to call from many stacks at once.
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Returns the engine name (e.g., "memory", "pulumi")
    fn name(&self) -> &str;

    /// Create a new resource
    async fn create(&self, request: ResourceRequest) -> Result<ProvisionedResource>;

    /// Bring an existing resource under management without recreating it.
    ///
    /// `request.import_id` identifies the live object.
    async fn adopt(&self, request: ResourceRequest) -> Result<ProvisionedResource>;

    /// Read the live configuration of an existing object
    async fn lookup(
        &self,
        kind: &str,
        external_id: &str,
        region: Option<&str>,
    ) -> Result<Option<LiveResource>>;

    /// Deploy the main workload of a stack
    async fn deploy_workload(
        &self,
        stack: &StackReference,
        name: &str,
        shape: &WorkloadShape,
        depends_on: &[ResourceHandle],
    ) -> Result<ResourceHandle>;

    /// Run a job to completion
    async fn run_job(&self, job: &JobSpec) -> Result<JobOutcome>;
}

/// Request to create or adopt one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Resource kind understood by the engine (e.g. "gcp-redis")
    pub kind: String,

    /// Engine-side logical name, unique per run (the derived name)
    pub logical_name: String,

    /// Name on the platform, already sanitised
    pub external_name: String,

    /// Desired properties
    pub properties: serde_json::Value,

    /// Identifier of the live object for adoption
    pub import_id: Option<String>,

    /// Resources that must exist first
    pub depends_on: Vec<ResourceHandle>,
}

impl ResourceRequest {
    pub fn new(
        kind: impl Into<String>,
        logical_name: impl Into<String>,
        external_name: impl Into<String>,
        properties: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            logical_name: logical_name.into(),
            external_name: external_name.into(),
            properties,
            import_id: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_import_id(mut self, import_id: impl Into<String>) -> Self {
        self.import_id = Some(import_id.into());
        self
    }

    pub fn with_depends_on(mut self, handle: ResourceHandle) -> Self {
        self.depends_on.push(handle);
        self
    }

    /// Get a property value as a specific type
    pub fn get_property<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.properties
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// A resource handed over to the engine.
///
/// The handle is known right away; attributes resolve once the engine
/// finished the operation.
#[derive(Debug, Clone)]
pub struct ProvisionedResource {
    pub handle: ResourceHandle,
    pub attributes: Deferred<Attributes>,
}

impl ProvisionedResource {
    /// Deferred string attribute; a missing attribute fails resolution
    pub fn attribute(&self, key: &str) -> Deferred<String> {
        let key = key.to_string();
        let urn = self.handle.urn.clone();
        self.attributes.try_map(move |attrs| {
            attribute_string(&attrs, &key).ok_or_else(|| {
                fleetstack_core::StackError::TransientProvisioning(format!(
                    "engine reported no '{}' for {}",
                    key, urn
                ))
            })
        })
    }
}

/// Live configuration of an existing cloud object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveResource {
    pub kind: String,
    pub external_id: String,
    pub region: Option<String>,
    pub attributes: Attributes,
}

impl LiveResource {
    pub fn new(kind: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            external_id: external_id.into(),
            region: None,
            attributes: Attributes::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn get_attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Result of a job run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub exit_code: i32,
    pub logs: String,
    pub duration_ms: u64,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            logs: String::new(),
            duration_ms: 0,
        }
    }

    pub fn failure(exit_code: i32, logs: impl Into<String>) -> Self {
        Self {
            exit_code,
            logs: logs.into(),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Retry configuration for engine operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: std::time::Duration,

    /// Maximum delay between retries
    pub max_delay: std::time::Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: std::time::Duration::from_secs(1),
            max_delay: std::time::Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-based)
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}
