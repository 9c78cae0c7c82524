//! Simulated provisioning engine
//!
//! Keeps every resource in memory and fabricates the attributes a real cloud
//! would report. Used by tests and by `fleetstack deploy --simulate`.
//! Failures, latency and pre-existing ("live") objects can be configured to
//! exercise adoption, error and ordering paths.

use crate::engine::{
    Attributes, JobOutcome, LiveResource, ProvisionedResource, ProvisioningEngine,
    ResourceRequest, RetryConfig, RANDOM_PASSWORD_KIND,
};
use crate::error::{CloudError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use fleetstack_core::{Deferred, JobSpec, ProvisionAction, ResourceHandle, StackReference, WorkloadShape};
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Captured call information for verification
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub kind: String,
    pub name: String,
}

/// A resource managed by the simulated engine
#[derive(Debug, Clone)]
pub struct ManagedResource {
    pub handle: ResourceHandle,
    pub action: ProvisionAction,
    pub request: ResourceRequest,
    pub attributes: Attributes,
}

/// A workload deployed through the simulated engine
#[derive(Debug, Clone)]
pub struct DeployedWorkloadRecord {
    pub stack: StackReference,
    pub name: String,
    pub shape: WorkloadShape,
    pub depends_on: Vec<ResourceHandle>,
}

/// In-memory provisioning engine
#[derive(Clone)]
pub struct MemoryEngine {
    project: String,
    retry: RetryConfig,
    /// Objects that exist "in the cloud", keyed by (kind, external id)
    live: Arc<RwLock<HashMap<(String, String), LiveResource>>>,
    /// Resources under management, keyed by URN
    managed: Arc<RwLock<BTreeMap<String, ManagedResource>>>,
    workloads: Arc<RwLock<Vec<DeployedWorkloadRecord>>>,
    jobs: Arc<RwLock<Vec<JobSpec>>>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    /// Remaining injected API failures per resource kind
    failures: Arc<RwLock<HashMap<String, u32>>>,
    /// Job outcomes by job name prefix
    job_outcomes: Arc<RwLock<Vec<(String, JobOutcome)>>>,
    /// Attribute resolution delay per resource kind
    latency: Arc<RwLock<HashMap<String, Duration>>>,
    job_duration: Arc<RwLock<Duration>>,
    counter: Arc<AtomicUsize>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new("fleetstack-sim")
    }
}

impl MemoryEngine {
    /// Create an engine simulating the given cloud project
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
            },
            live: Arc::new(RwLock::new(HashMap::new())),
            managed: Arc::new(RwLock::new(BTreeMap::new())),
            workloads: Arc::new(RwLock::new(Vec::new())),
            jobs: Arc::new(RwLock::new(Vec::new())),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
            job_outcomes: Arc::new(RwLock::new(Vec::new())),
            latency: Arc::new(RwLock::new(HashMap::new())),
            job_duration: Arc::new(RwLock::new(Duration::ZERO)),
            counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Register an object that already exists outside of FleetStack
    pub fn add_live_resource(self, resource: LiveResource) -> Self {
        self.live.write().insert(
            (resource.kind.clone(), resource.external_id.clone()),
            resource,
        );
        self
    }

    /// Fail the next `times` create/adopt calls for `kind`
    pub fn fail_next(self, kind: impl Into<String>, times: u32) -> Self {
        self.failures.write().insert(kind.into(), times);
        self
    }

    /// Return `outcome` for every job whose name starts with `prefix`
    pub fn job_outcome(self, prefix: impl Into<String>, outcome: JobOutcome) -> Self {
        self.job_outcomes.write().push((prefix.into(), outcome));
        self
    }

    /// Delay attribute resolution of every resource of `kind`
    pub fn latency(self, kind: impl Into<String>, delay: Duration) -> Self {
        self.latency.write().insert(kind.into(), delay);
        self
    }

    /// Time every job takes to run
    pub fn job_duration(self, duration: Duration) -> Self {
        *self.job_duration.write() = duration;
        self
    }

    /// Get all captured calls
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Get calls to a specific method
    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn managed(&self, urn: &str) -> Option<ManagedResource> {
        self.managed.read().get(urn).cloned()
    }

    pub fn managed_resources(&self) -> Vec<ManagedResource> {
        self.managed.read().values().cloned().collect()
    }

    pub fn managed_of_kind(&self, kind: &str) -> Vec<ManagedResource> {
        self.managed
            .read()
            .values()
            .filter(|m| m.handle.resource_type == kind)
            .cloned()
            .collect()
    }

    pub fn workloads(&self) -> Vec<DeployedWorkloadRecord> {
        self.workloads.read().clone()
    }

    pub fn workload(&self, stack: &StackReference) -> Option<DeployedWorkloadRecord> {
        self.workloads
            .read()
            .iter()
            .find(|w| &w.stack == stack)
            .cloned()
    }

    pub fn jobs(&self) -> Vec<JobSpec> {
        self.jobs.read().clone()
    }

    fn record_call(&self, method: &str, kind: &str, name: &str) {
        self.captured_calls.write().push(CapturedCall {
            method: method.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        });
    }

    fn take_failure(&self, kind: &str) -> bool {
        let mut failures = self.failures.write();
        match failures.get_mut(kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Simulated API call with retry on injected failures
    async fn call_api(&self, kind: &str, name: &str) -> Result<()> {
        let mut attempt = 1;
        loop {
            if !self.take_failure(kind) {
                return Ok(());
            }
            if attempt >= self.retry.max_attempts {
                return Err(CloudError::ApiError(format!(
                    "{} '{}' failed after {} attempts",
                    kind, name, attempt
                )));
            }
            let delay = self.retry.delay_for(attempt);
            tracing::debug!(kind, name, attempt, ?delay, "Retrying simulated API call");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn next_index(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Attributes a real cloud would report for a new object
    fn fabricate_attributes(&self, request: &ResourceRequest) -> Attributes {
        let mut attrs: Attributes = match &request.properties {
            serde_json::Value::Object(map) => map.clone().into_iter().collect(),
            _ => Attributes::new(),
        };
        let n = self.next_index();
        let name = request.external_name.as_str();
        let region = request
            .get_property::<String>("region")
            .unwrap_or_else(|| "us-central1".to_string());

        let computed: Vec<(&str, serde_json::Value)> = match request.kind.as_str() {
            "gcp-cloudsql-postgres" => vec![
                (
                    "connectionName",
                    format!("{}:{}:{}", self.project, region, name).into(),
                ),
                ("privateIp", format!("10.20.0.{}", n).into()),
                ("port", 5432.into()),
                ("region", region.clone().into()),
            ],
            "gcp-redis" => vec![
                ("host", format!("10.30.0.{}", n).into()),
                ("port", 6379.into()),
                ("region", region.clone().into()),
            ],
            "gcp-bucket" => vec![
                ("url", format!("gs://{}", name).into()),
                (
                    "selfLink",
                    format!("https://www.googleapis.com/storage/v1/b/{}", name).into(),
                ),
            ],
            "gcp-pubsub-topic" => vec![(
                "id",
                format!("projects/{}/topics/{}", self.project, name).into(),
            )],
            "gcp-gke-cluster" => vec![
                ("endpoint", format!("34.120.0.{}", n).into()),
                (
                    "caCertificate",
                    STANDARD.encode(format!("simulated-ca-{}", name)).into(),
                ),
            ],
            RANDOM_PASSWORD_KIND => {
                let length = request.get_property::<usize>("length").unwrap_or(32);
                let value: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(length)
                    .map(char::from)
                    .collect();
                vec![("result", value.into())]
            }
            "gcp-service-account" => vec![(
                "email",
                format!("{}@{}.iam.gserviceaccount.com", name, self.project).into(),
            )],
            "gcp-service-account-key" => {
                let account = request
                    .get_property::<String>("serviceAccount")
                    .unwrap_or_else(|| name.to_string());
                let key = serde_json::json!({
                    "type": "service_account",
                    "project_id": self.project,
                    "client_email": account,
                    "private_key_id": format!("sim-{}", n),
                });
                vec![("privateKey", STANDARD.encode(key.to_string()).into())]
            }
            _ => Vec::new(),
        };
        for (key, value) in computed {
            attrs.entry(key.to_string()).or_insert(value);
        }
        attrs.insert("name".to_string(), name.into());
        attrs
    }

    fn deferred_attributes(&self, kind: &str, attributes: Attributes) -> Deferred<Attributes> {
        let delay = self.latency.read().get(kind).copied().unwrap_or_default();
        Deferred::new(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(attributes)
        })
    }

    fn register(
        &self,
        request: ResourceRequest,
        action: ProvisionAction,
        attributes: Attributes,
    ) -> ProvisionedResource {
        let handle = ResourceHandle::new(urn_of(&request), &request.kind);
        let kind = request.kind.clone();
        {
            let mut managed = self.managed.write();
            if managed.contains_key(&handle.urn) {
                tracing::debug!(urn = %handle.urn, "Updating managed resource");
            }
            managed.insert(
                handle.urn.clone(),
                ManagedResource {
                    handle: handle.clone(),
                    action,
                    request,
                    attributes: attributes.clone(),
                },
            );
        }
        ProvisionedResource {
            handle,
            attributes: self.deferred_attributes(&kind, attributes),
        }
    }
}

fn urn_of(request: &ResourceRequest) -> String {
    format!("urn:{}:{}", request.kind, request.logical_name)
}

#[async_trait]
impl ProvisioningEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, request: ResourceRequest) -> Result<ProvisionedResource> {
        self.record_call("create", &request.kind, &request.external_name);
        self.call_api(&request.kind, &request.external_name).await?;

        let key = (request.kind.clone(), request.external_name.clone());
        if self.live.read().contains_key(&key) && !self.managed.read().values().any(|m| {
            m.handle.resource_type == request.kind && m.request.external_name == request.external_name
        }) {
            return Err(CloudError::ResourceAlreadyExists(format!(
                "{} '{}' exists and must be adopted",
                request.kind, request.external_name
            )));
        }

        // Updating a managed resource keeps what the cloud computed for it
        let previous = self
            .managed
            .read()
            .get(&urn_of(&request))
            .map(|m| m.attributes.clone());
        let attributes = match previous {
            Some(mut attributes) => {
                if let serde_json::Value::Object(map) = &request.properties {
                    for (key, value) in map {
                        attributes.insert(key.clone(), value.clone());
                    }
                }
                attributes
            }
            None => self.fabricate_attributes(&request),
        };
        let mut live = LiveResource::new(&request.kind, &request.external_name);
        live.region = request.get_property("region");
        live.attributes = attributes.clone();

        let provisioned = self.register(request, ProvisionAction::Create, attributes);
        self.live.write().insert(key, live);
        tracing::debug!(urn = %provisioned.handle.urn, "Simulated create");
        Ok(provisioned)
    }

    async fn adopt(&self, request: ResourceRequest) -> Result<ProvisionedResource> {
        self.record_call("adopt", &request.kind, &request.external_name);
        self.call_api(&request.kind, &request.external_name).await?;

        let import_id = request.import_id.clone().ok_or_else(|| {
            CloudError::InvalidRequest(format!(
                "adopting {} '{}' requires an import id",
                request.kind, request.logical_name
            ))
        })?;
        let live = self
            .live
            .read()
            .get(&(request.kind.clone(), import_id.clone()))
            .cloned()
            .ok_or_else(|| CloudError::ResourceNotFound(format!("{} '{}'", request.kind, import_id)))?;

        // Imported object keeps its live state; desired properties are applied on top
        let mut attributes = live.attributes;
        if let serde_json::Value::Object(map) = &request.properties {
            for (key, value) in map {
                attributes.insert(key.clone(), value.clone());
            }
        }
        attributes.insert("name".to_string(), import_id.into());

        let provisioned = self.register(request, ProvisionAction::Adopt, attributes);
        tracing::debug!(urn = %provisioned.handle.urn, "Simulated adopt");
        Ok(provisioned)
    }

    async fn lookup(
        &self,
        kind: &str,
        external_id: &str,
        region: Option<&str>,
    ) -> Result<Option<LiveResource>> {
        self.record_call("lookup", kind, external_id);
        let live = self
            .live
            .read()
            .get(&(kind.to_string(), external_id.to_string()))
            .cloned();
        Ok(live.filter(|l| match (region, l.region.as_deref()) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }))
    }

    async fn deploy_workload(
        &self,
        stack: &StackReference,
        name: &str,
        shape: &WorkloadShape,
        depends_on: &[ResourceHandle],
    ) -> Result<ResourceHandle> {
        self.record_call("deploy_workload", &shape.kind().to_string(), name);
        let handle = ResourceHandle::new(
            format!("urn:workload:{}/{}:{}", stack.stack, stack.env, name),
            "workload",
        );
        let mut workloads = self.workloads.write();
        workloads.retain(|w| !(&w.stack == stack && w.name == name));
        workloads.push(DeployedWorkloadRecord {
            stack: stack.clone(),
            name: name.to_string(),
            shape: shape.clone(),
            depends_on: depends_on.to_vec(),
        });
        Ok(handle)
    }

    async fn run_job(&self, job: &JobSpec) -> Result<JobOutcome> {
        self.record_call("run_job", "job", &job.name);
        self.jobs.write().push(job.clone());

        let duration = *self.job_duration.read();
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }

        let outcome = self
            .job_outcomes
            .read()
            .iter()
            .find(|(prefix, _)| job.name.starts_with(prefix.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(JobOutcome::success);
        Ok(JobOutcome {
            duration_ms: duration.as_millis() as u64,
            ..outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetstack_core::ShapeKind;

    fn redis_request(name: &str) -> ResourceRequest {
        ResourceRequest::new(
            "gcp-redis",
            format!("base--{}--prod", name),
            format!("base--{}--prod", name),
            serde_json::json!({"memorySizeGb": 1, "region": "europe-west1"}),
        )
    }

    #[tokio::test]
    async fn test_create_fabricates_attributes() {
        let engine = MemoryEngine::new("acme");
        let created = engine.create(redis_request("cache")).await.unwrap();

        assert_eq!(created.handle.urn, "urn:gcp-redis:base--cache--prod");
        assert_eq!(created.attribute("port").resolve().await.unwrap(), "6379");
        assert!(created.attribute("host").resolve().await.unwrap().starts_with("10.30.0."));
        assert_eq!(engine.get_method_calls("create").len(), 1);
    }

    #[tokio::test]
    async fn test_create_refuses_unmanaged_live_object() {
        let engine = MemoryEngine::new("acme").add_live_resource(LiveResource::new(
            "gcp-redis",
            "base--cache--prod",
        ));
        let err = engine.create(redis_request("cache")).await.unwrap_err();
        assert!(matches!(err, CloudError::ResourceAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_adopt_keeps_live_attributes() {
        let engine = MemoryEngine::new("acme").add_live_resource(
            LiveResource::new("gcp-redis", "legacy-cache")
                .with_region("europe-west1")
                .with_attribute("host", serde_json::json!("10.9.9.9"))
                .with_attribute("port", serde_json::json!(6380))
                .with_attribute("memorySizeGb", serde_json::json!(4)),
        );

        let request = ResourceRequest::new(
            "gcp-redis",
            "base--cache--prod",
            "legacy-cache",
            serde_json::json!({"memorySizeGb": 4}),
        )
        .with_import_id("legacy-cache");
        let adopted = engine.adopt(request).await.unwrap();

        assert_eq!(adopted.attribute("host").resolve().await.unwrap(), "10.9.9.9");
        assert_eq!(adopted.attribute("port").resolve().await.unwrap(), "6380");
        let managed = engine.managed(&adopted.handle.urn).unwrap();
        assert_eq!(managed.action, ProvisionAction::Adopt);
    }

    #[tokio::test]
    async fn test_adopt_missing_object() {
        let engine = MemoryEngine::new("acme");
        let request = redis_request("cache").with_import_id("ghost");
        let err = engine.adopt(request).await.unwrap_err();
        assert!(matches!(err, CloudError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_lookup_filters_by_region() {
        let engine = MemoryEngine::new("acme").add_live_resource(
            LiveResource::new("gcp-redis", "legacy-cache").with_region("europe-west1"),
        );
        assert!(engine
            .lookup("gcp-redis", "legacy-cache", Some("europe-west1"))
            .await
            .unwrap()
            .is_some());
        assert!(engine
            .lookup("gcp-redis", "legacy-cache", Some("us-east1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_failures_are_retried() {
        let engine = MemoryEngine::new("acme").fail_next("gcp-redis", 2);
        assert!(engine.create(redis_request("cache")).await.is_ok());

        let engine = MemoryEngine::new("acme").fail_next("gcp-redis", 5);
        let err = engine.create(redis_request("cache")).await.unwrap_err();
        assert!(matches!(err, CloudError::ApiError(_)));
    }

    #[tokio::test]
    async fn test_job_outcomes_by_prefix() {
        let engine = MemoryEngine::new("acme").job_outcome("grant-", JobOutcome::failure(3, "denied"));
        let job = |name: &str| JobSpec {
            name: name.to_string(),
            containers: vec![],
            volumes: vec![],
            timeout: Duration::from_secs(30),
        };

        assert!(!engine.run_job(&job("grant-api")).await.unwrap().is_success());
        assert!(engine.run_job(&job("migrate-api")).await.unwrap().is_success());
        assert_eq!(engine.jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_create_twice_updates_in_place() {
        let engine = MemoryEngine::new("acme");
        engine.create(redis_request("cache")).await.unwrap();
        engine.create(redis_request("cache")).await.unwrap();
        assert_eq!(engine.managed_of_kind("gcp-redis").len(), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_computed_attributes() {
        let engine = MemoryEngine::new("acme");
        let first = engine.create(redis_request("cache")).await.unwrap();
        let host = first.attribute("host").resolve().await.unwrap();

        let mut resized = redis_request("cache");
        resized.properties["memorySizeGb"] = serde_json::json!(4);
        let second = engine.create(resized).await.unwrap();

        assert_eq!(second.attribute("host").resolve().await.unwrap(), host);
        assert_eq!(second.attribute("memorySizeGb").resolve().await.unwrap(), "4");
    }

    #[tokio::test]
    async fn test_random_password_is_generated_once() {
        let engine = MemoryEngine::new("acme");
        let request = |logical: &str| {
            ResourceRequest::new(
                RANDOM_PASSWORD_KIND,
                logical,
                logical,
                serde_json::json!({"length": 24}),
            )
        };

        let first = engine.create(request("base--db--prod--root-password")).await.unwrap();
        let first = first.attribute("result").resolve().await.unwrap();
        let again = engine.create(request("base--db--prod--root-password")).await.unwrap();
        let other = engine.create(request("base--db--staging--root-password")).await.unwrap();

        assert_eq!(first.len(), 24);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(again.attribute("result").resolve().await.unwrap(), first);
        assert_ne!(other.attribute("result").resolve().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_deploy_workload_replaces_previous_revision() {
        let engine = MemoryEngine::new("acme");
        let stack = StackReference::new("api", "prod");
        let shape = WorkloadShape::empty(ShapeKind::KubernetesPod);
        engine.deploy_workload(&stack, "api", &shape, &[]).await.unwrap();
        engine.deploy_workload(&stack, "api", &shape, &[]).await.unwrap();
        assert_eq!(engine.workloads().len(), 1);
    }
}
