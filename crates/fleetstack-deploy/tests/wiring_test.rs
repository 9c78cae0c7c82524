mod common;

use async_trait::async_trait;
use common::{depends_on, pod, postgres, redis, Harness};
use fleetstack_cloud::MemoryEngine;
use fleetstack_core::{
    ComputeContextCollector, ConsumedResource, Deferred, MemoryOutputBackend, OutputBackend,
    ProvisionAction, ResolvedExport, ResourceDescriptor, ResourceOutput, Result,
    StackDescriptor, StackError, StackGraph, StackReference,
};
use fleetstack_deploy::{
    ComputeProcessor, ExportField, ProcessParams, ProvisionContext, ProvisionParams,
    ProvisioningFunction, Registry,
};
use fleetstack_config::Settings;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const KV_TYPE: &str = "test-kv";
const KV_EXPORTS: &[ExportField] = &[ExportField::plain("host")];

/// Resource type whose processor also claims `REDIS_HOST`, slowly
struct KvStore;

#[async_trait]
impl ProvisioningFunction for KvStore {
    fn resource_type(&self) -> &str {
        KV_TYPE
    }

    fn exports(&self) -> &'static [ExportField] {
        KV_EXPORTS
    }

    fn validate(&self, _resource: &ResourceDescriptor) -> Result<()> {
        Ok(())
    }

    async fn provision(
        &self,
        _ctx: &ProvisionContext,
        _stack: &StackDescriptor,
        resource: &ResourceDescriptor,
        params: &ProvisionParams,
    ) -> Result<ResourceOutput> {
        let mut output =
            ResourceOutput::new(resource, &params.derived_name).with_action(ProvisionAction::Create);
        output.export(
            KV_EXPORTS[0].key(&params.derived_name),
            Deferred::ready("kv.internal".to_string()),
            false,
        );
        Ok(output)
    }
}

#[async_trait]
impl ComputeProcessor for KvStore {
    fn resource_type(&self) -> &str {
        KV_TYPE
    }

    async fn process(
        &self,
        ctx: &ProvisionContext,
        _stack: &StackDescriptor,
        resource: &ConsumedResource,
        collector: &ComputeContextCollector,
        _params: &ProcessParams,
    ) -> Result<ResourceOutput> {
        let host = ctx
            .import(&resource.owner, &KV_EXPORTS[0].key(&resource.derived_name), false)
            .await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.add_env_variable_if_not_exist(
            "REDIS_HOST",
            &host,
            KV_TYPE,
            &resource.descriptor.name,
            &resource.owner.stack,
        );
        Ok(ResourceOutput::new(&resource.descriptor, &resource.derived_name))
    }
}

fn registry_with_kv() -> Registry {
    let mut registry = Registry::with_defaults();
    registry.register_provisioner(Arc::new(KvStore));
    registry.register_processor(Arc::new(KvStore));
    registry
}

fn kv_graph(uses: &[&str]) -> StackGraph {
    StackGraph::new(vec![
        StackDescriptor::new("base", "prod")
            .with_resource(redis("cache"))
            .with_resource(ResourceDescriptor::new("kv", KV_TYPE, serde_json::json!({}))),
        StackDescriptor::new("api", "prod")
            .with_parent("base", None)
            .with_workload(pod("api").with_uses(uses)),
    ])
}

async fn exported(backend: &MemoryOutputBackend, stack: &StackReference, key: &str) -> String {
    backend.get_output(stack, key).await.unwrap().unwrap().value
}

#[tokio::test]
async fn test_first_declared_writer_wins_env() {
    let harness = Harness::with_registry(MemoryEngine::new("acme"), registry_with_kv());
    let report = harness.deployer.deploy(&kv_graph(&["cache", "kv"])).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures());

    let base = StackReference::new("base", "prod");
    let redis_host = exported(&harness.backend, &base, "base--cache--prod-host").await;
    let workload = harness.engine.workload(&StackReference::new("api", "prod")).unwrap();
    let main = &workload.shape.containers()[0];
    assert_eq!(main.env["REDIS_HOST"], redis_host);
    assert_eq!(main.env["REDIS_PORT"], "6379");
}

#[tokio::test]
async fn test_declared_order_beats_completion_order() {
    // kv finishes last but is declared first
    let harness = Harness::with_registry(MemoryEngine::new("acme"), registry_with_kv());
    let report = harness.deployer.deploy(&kv_graph(&["kv", "cache"])).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures());

    let workload = harness.engine.workload(&StackReference::new("api", "prod")).unwrap();
    let main = &workload.shape.containers()[0];
    assert_eq!(main.env["REDIS_HOST"], "kv.internal");
    assert!(main.env.contains_key("REDIS_URL"));
}

#[tokio::test]
async fn test_depends_on_consumers_get_distinct_credentials() {
    let harness = Harness::new(MemoryEngine::new("acme"));
    let graph = StackGraph::new(vec![
        StackDescriptor::new("orders", "prod").with_resource(postgres("db")),
        StackDescriptor::new("api", "prod")
            .with_depends_on(depends_on("orders-db", "orders", "db"))
            .with_workload(pod("api").with_env("ORDERS_PASSWORD", "${dependency:orders-db.password}")),
        StackDescriptor::new("worker", "prod")
            .with_depends_on(depends_on("orders-db", "orders", "db"))
            .with_workload(pod("worker")),
        StackDescriptor::new("reports", "prod")
            .with_parent("orders", None)
            .with_workload(pod("reports").with_uses(&["db"])),
    ]);

    let report = harness.deployer.deploy(&graph).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures());

    let user_of = |stack: &str| {
        let workload = harness.engine.workload(&StackReference::new(stack, "prod")).unwrap();
        workload.shape.containers()[0].env["PGUSER"].clone()
    };
    let api = user_of("api");
    let worker = user_of("worker");
    let reports = user_of("reports");

    assert_eq!(reports, "reports");
    assert!(api.contains("api") && api.contains("orders"));
    assert!(worker.contains("worker") && worker.contains("orders"));
    assert_ne!(api, worker);
    assert_ne!(api, reports);

    // One proxy identity and one init job per consumer
    assert_eq!(harness.engine.managed_of_kind("gcp-service-account").len(), 3);
    assert_eq!(harness.engine.jobs().len(), 3);

    let api = harness.engine.workload(&StackReference::new("api", "prod")).unwrap();
    let main = &api.shape.containers()[0];
    assert!(!main.env.contains_key("ORDERS_PASSWORD"));
    assert_eq!(main.secret_env["ORDERS_PASSWORD"], main.secret_env["PGPASSWORD"]);
    assert!(!main.env.contains_key("DATABASE_URL"));
}

#[tokio::test]
async fn test_two_databases_get_separate_proxy_identities() {
    let harness = Harness::new(MemoryEngine::new("acme"));
    let graph = StackGraph::new(vec![
        StackDescriptor::new("base", "prod")
            .with_resource(postgres("orders"))
            .with_resource(postgres("billing")),
        StackDescriptor::new("api", "prod")
            .with_parent("base", None)
            .with_workload(pod("api").with_uses(&["orders", "billing"])),
        StackDescriptor::new("base", "staging").with_resource(postgres("orders")),
        StackDescriptor::new("api", "staging")
            .with_parent("base", None)
            .with_workload(pod("api").with_uses(&["orders"])),
    ]);

    let report = harness.deployer.deploy(&graph).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures());

    let jobs: BTreeSet<String> = harness.engine.jobs().into_iter().map(|j| j.name).collect();
    assert_eq!(jobs.len(), 3);
    let accounts: BTreeSet<String> = harness
        .engine
        .managed_of_kind("gcp-service-account")
        .into_iter()
        .map(|m| m.request.external_name)
        .collect();
    assert_eq!(accounts.len(), 3);
    assert!(accounts.iter().all(|a| a.len() <= 30));

    let workload = harness.engine.workload(&StackReference::new("api", "prod")).unwrap();
    let proxies: Vec<&str> = workload
        .shape
        .containers()
        .iter()
        .filter(|c| c.name.starts_with("cloud-sql-proxy"))
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(proxies.len(), 2);
}

#[tokio::test]
async fn test_similar_stack_names_get_separate_roles() {
    let harness = Harness::new(MemoryEngine::new("acme"));
    let graph = StackGraph::new(vec![
        StackDescriptor::new("base", "prod").with_resource(postgres("db")),
        StackDescriptor::new("api-v2", "prod")
            .with_parent("base", None)
            .with_workload(pod("api-v2").with_uses(&["db"])),
        StackDescriptor::new("api_v2", "prod")
            .with_parent("base", None)
            .with_workload(pod("api_v2").with_uses(&["db"])),
    ]);

    let report = harness.deployer.deploy(&graph).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures());

    let user_of = |stack: &str| {
        let workload = harness.engine.workload(&StackReference::new(stack, "prod")).unwrap();
        workload.shape.containers()[0].env["PGUSER"].clone()
    };
    assert_eq!(user_of("api_v2"), "api_v2");
    assert_ne!(user_of("api-v2"), user_of("api_v2"));
}

#[tokio::test]
async fn test_uses_reaches_grandparent_resources() {
    let harness = Harness::new(MemoryEngine::new("acme"));
    let graph = StackGraph::new(vec![
        StackDescriptor::new("platform", "prod").with_resource(redis("cache")),
        StackDescriptor::new("team", "prod").with_parent("platform", None),
        StackDescriptor::new("api", "prod")
            .with_parent("team", None)
            .with_workload(pod("api").with_uses(&["cache"]).with_env("CACHE", "${resource:cache.url}")),
    ]);

    let report = harness.deployer.deploy(&graph).await.unwrap();
    assert!(report.is_success(), "{:?}", report.failures());

    let platform = StackReference::new("platform", "prod");
    let host = exported(&harness.backend, &platform, "platform--cache--prod-host").await;
    let workload = harness.engine.workload(&StackReference::new("api", "prod")).unwrap();
    let main = &workload.shape.containers()[0];
    assert_eq!(main.env["REDIS_HOST"], host);
    assert_eq!(main.env["CACHE"], format!("redis://{}:6379", host));
    assert_eq!(workload.depends_on.len(), 1);
    assert_eq!(workload.depends_on[0].urn, "urn:gcp-redis:platform--cache--prod");
}

#[tokio::test]
async fn test_uses_unknown_resource_fails_validation() {
    let harness = Harness::new(MemoryEngine::new("acme"));
    let graph = StackGraph::new(vec![
        StackDescriptor::new("platform", "prod").with_resource(redis("cache")),
        StackDescriptor::new("api", "prod")
            .with_parent("platform", None)
            .with_workload(pod("api").with_uses(&["queue"])),
    ]);

    assert!(harness.deployer.deploy(&graph).await.is_err());
    assert!(harness.engine.get_calls().is_empty());
}

fn import_context(backend: Arc<MemoryOutputBackend>) -> ProvisionContext {
    ProvisionContext::new(Arc::new(MemoryEngine::new("acme")), backend, Settings::default())
}

#[tokio::test]
async fn test_import_missing_and_empty_values_are_errors() {
    let owner = StackReference::new("base", "prod");
    let backend = Arc::new(MemoryOutputBackend::new());
    backend.seed(
        owner.clone(),
        vec![
            ResolvedExport::new("base--db--prod-host", "10.0.0.3", false),
            ResolvedExport::new("base--db--prod-version", "  ", false),
            ResolvedExport::new("base--db--prod-root-password", "s3cret", true),
        ],
    );
    let ctx = import_context(backend);

    assert_eq!(ctx.import(&owner, "base--db--prod-host", false).await.unwrap(), "10.0.0.3");
    assert!(matches!(
        ctx.import(&owner, "base--db--prod-port", false).await,
        Err(StackError::ExportNotFound { .. })
    ));
    assert!(matches!(
        ctx.import(&owner, "base--db--prod-version", false).await,
        Err(StackError::ExportEmpty { .. })
    ));
    assert!(matches!(
        ctx.import(&owner, "base--db--prod-root-password", false).await,
        Err(StackError::SecretExposure { .. })
    ));
    assert_eq!(
        ctx.import(&owner, "base--db--prod-root-password", true).await.unwrap(),
        "s3cret"
    );
    assert!(matches!(
        ctx.import(&StackReference::new("other", "prod"), "base--db--prod-host", false).await,
        Err(StackError::ExportNotFound { .. })
    ));
}
