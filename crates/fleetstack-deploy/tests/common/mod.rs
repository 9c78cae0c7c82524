use fleetstack_cloud::MemoryEngine;
use fleetstack_config::Settings;
use fleetstack_core::{
    ContainerSpec, DependsOnResource, MemoryOutputBackend, ResourceDescriptor, ShapeKind,
    WorkloadDescriptor,
};
use fleetstack_deploy::{Deployer, ProvisionContext, Registry};
use std::sync::Arc;

pub struct Harness {
    pub engine: MemoryEngine,
    pub backend: Arc<MemoryOutputBackend>,
    pub deployer: Deployer,
}

impl Harness {
    pub fn new(engine: MemoryEngine) -> Self {
        Self::with_registry(engine, Registry::with_defaults())
    }

    pub fn with_registry(engine: MemoryEngine, registry: Registry) -> Self {
        let backend = Arc::new(MemoryOutputBackend::new());
        let ctx = ProvisionContext::new(
            Arc::new(engine.clone()),
            backend.clone(),
            Settings::default(),
        );
        Self {
            engine,
            backend,
            deployer: Deployer::new(registry, ctx),
        }
    }
}

pub fn redis(name: &str) -> ResourceDescriptor {
    ResourceDescriptor::new(name, "gcp-redis", serde_json::json!({"memorySizeGb": 1}))
}

pub fn postgres(name: &str) -> ResourceDescriptor {
    ResourceDescriptor::new(
        name,
        "gcp-cloudsql-postgres",
        serde_json::json!({"version": "POSTGRES_16", "tier": "db-custom-1-3840"}),
    )
}

pub fn pod(name: &str) -> WorkloadDescriptor {
    WorkloadDescriptor::new(
        name,
        ShapeKind::KubernetesPod,
        ContainerSpec::new("app", format!("{}:1", name)),
    )
}

pub fn depends_on(name: &str, owner: &str, resource: &str) -> DependsOnResource {
    DependsOnResource {
        name: name.to_string(),
        owner: owner.to_string(),
        resource: resource.to_string(),
        environment: None,
    }
}
