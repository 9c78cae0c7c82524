//! GKE clusters

use super::{
    adopted_property, import_exports, imported, missing, properties, register_consumption,
    template_fields, write_exports, EnvWriter, ExportValues,
};
use crate::context::ProvisionContext;
use crate::registry::{ComputeProcessor, ExportField, ProcessParams, ProvisionParams, ProvisioningFunction};
use async_trait::async_trait;
use fleetstack_cloud::{ProvisionedResource, ResourceRequest};
use fleetstack_core::{
    ComputeContextCollector, ConsumedResource, Deferred, NameRules, ProvisionAction,
    ResourceDescriptor, ResourceOutput, Result, StackDescriptor, StackError, TemplateValue,
};
use serde::Deserialize;

pub const RESOURCE_TYPE: &str = "gcp-gke-cluster";

const EXPORTS: &[ExportField] = &[
    ExportField::plain("cluster-name"),
    ExportField::plain("endpoint"),
    ExportField::secret("kubeconfig"),
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfig {
    #[serde(default)]
    adopt: bool,
    location: Option<String>,
    node_version: Option<String>,
    node_count: Option<u32>,
    machine_type: Option<String>,
    cluster_name: Option<String>,
}

impl ClusterConfig {
    fn parse(resource: &ResourceDescriptor) -> Result<Self> {
        let config: Self = resource.typed_config()?;
        if config.location.is_none() {
            let path = if config.adopt { "adopt a cluster" } else { "create a cluster" };
            return Err(missing(&resource.name, "location", path));
        }
        if config.adopt {
            if config.cluster_name.is_none() {
                return Err(missing(&resource.name, "clusterName", "adopt a cluster"));
            }
        } else if config.node_version.is_none() {
            return Err(missing(&resource.name, "nodeVersion", "create a cluster"));
        }
        if config.node_count == Some(0) {
            return Err(StackError::config(&resource.name, "nodeCount must be at least 1"));
        }
        Ok(config)
    }
}

/// Kubeconfig for a cluster, authenticating through the gcloud plugin
fn kubeconfig(cluster: &str, endpoint: &str, ca_certificate: &str) -> Result<String> {
    let config = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster,
            "cluster": {
                "server": format!("https://{}", endpoint),
                "certificate-authority-data": ca_certificate,
            },
        }],
        "contexts": [{
            "name": cluster,
            "context": { "cluster": cluster, "user": cluster },
        }],
        "current-context": cluster,
        "users": [{
            "name": cluster,
            "user": {
                "exec": {
                    "apiVersion": "client.authentication.k8s.io/v1beta1",
                    "command": "gke-gcloud-auth-plugin",
                    "provideClusterInfo": true,
                },
            },
        }],
    });
    serde_yaml::to_string(&config)
        .map_err(|e| StackError::TransientProvisioning(format!("rendering kubeconfig: {}", e)))
}

fn kubeconfig_of(provisioned: &ProvisionedResource) -> Deferred<String> {
    let name = provisioned.attribute("name");
    let endpoint = provisioned.attribute("endpoint");
    let ca = provisioned.attribute("caCertificate");
    Deferred::new(async move {
        let (name, endpoint, ca) = futures_util::try_join!(
            name.resolve(),
            endpoint.resolve(),
            ca.resolve()
        )?;
        kubeconfig(&name, &endpoint, &ca)
    })
}

pub struct ClusterProvisioner;

#[async_trait]
impl ProvisioningFunction for ClusterProvisioner {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    fn exports(&self) -> &'static [ExportField] {
        EXPORTS
    }

    fn validate(&self, resource: &ResourceDescriptor) -> Result<()> {
        ClusterConfig::parse(resource).map(|_| ())
    }

    async fn provision(
        &self,
        ctx: &ProvisionContext,
        _stack: &StackDescriptor,
        resource: &ResourceDescriptor,
        params: &ProvisionParams,
    ) -> Result<ResourceOutput> {
        let config = ClusterConfig::parse(resource)?;
        let derived = &params.derived_name;
        let location = config.location.clone().unwrap_or_default();

        let (action, provisioned) = if config.adopt {
            let cluster_name = config.cluster_name.clone().unwrap_or_default();
            let live = ctx
                .lookup_required(RESOURCE_TYPE, &cluster_name, Some(&location))
                .await?;
            let props = properties([
                ("region", Some(location.clone().into())),
                ("nodeVersion", adopted_property(config.node_version.clone(), &live, "nodeVersion")),
                ("nodeCount", adopted_property(config.node_count, &live, "nodeCount")),
                ("machineType", adopted_property(config.machine_type.clone(), &live, "machineType")),
            ]);
            let request = ResourceRequest::new(RESOURCE_TYPE, derived, &cluster_name, props)
                .with_import_id(&cluster_name);
            (ProvisionAction::Adopt, ctx.adopt(request).await?)
        } else {
            let props = properties([
                ("region", Some(location.clone().into())),
                ("nodeVersion", config.node_version.clone().map(Into::into)),
                ("nodeCount", Some(config.node_count.unwrap_or(3).into())),
                ("machineType", Some(config.machine_type.clone().unwrap_or_else(|| "e2-standard-4".into()).into())),
            ]);
            let request = ResourceRequest::new(
                RESOURCE_TYPE,
                derived,
                NameRules::GKE_CLUSTER.apply(derived),
                props,
            );
            (ProvisionAction::Create, ctx.create(request).await?)
        };

        let mut output = ResourceOutput::new(resource, derived)
            .with_action(action)
            .with_handle(provisioned.handle.clone());
        write_exports(
            &mut output,
            EXPORTS,
            ExportValues::from([
                ("cluster-name", provisioned.attribute("name")),
                ("endpoint", provisioned.attribute("endpoint")),
                ("kubeconfig", kubeconfig_of(&provisioned)),
            ]),
        )?;
        Ok(output)
    }
}

pub struct ClusterProcessor;

#[async_trait]
impl ComputeProcessor for ClusterProcessor {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    async fn process(
        &self,
        ctx: &ProvisionContext,
        _stack: &StackDescriptor,
        resource: &ConsumedResource,
        collector: &ComputeContextCollector,
        _params: &ProcessParams,
    ) -> Result<ResourceOutput> {
        let values = import_exports(ctx, resource, EXPORTS).await?;
        let name = imported(&values, "cluster-name");
        let endpoint = imported(&values, "endpoint");
        let kubeconfig = imported(&values, "kubeconfig");

        let env = EnvWriter::new(collector, resource);
        env.plain("KUBE_CLUSTER_NAME", name);
        env.plain("KUBE_ENDPOINT", endpoint);
        env.secret("KUBECONFIG_DATA", kubeconfig);

        register_consumption(
            collector,
            resource,
            template_fields([
                ("name", TemplateValue::plain(name)),
                ("endpoint", TemplateValue::plain(endpoint)),
                ("kubeconfig", TemplateValue::secret(kubeconfig)),
            ]),
        );
        Ok(ResourceOutput::new(&resource.descriptor, &resource.derived_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing;
    use fleetstack_cloud::{LiveResource, MemoryEngine};
    use fleetstack_core::ShapeKind;

    fn params() -> ProvisionParams {
        ProvisionParams {
            derived_name: "base--gke--prod".into(),
        }
    }

    #[tokio::test]
    async fn test_kubeconfig_is_secret_and_points_at_endpoint() {
        let engine = MemoryEngine::new("acme");
        let (ctx, _) = testing::context(&engine);
        let resource = ResourceDescriptor::new(
            "gke",
            RESOURCE_TYPE,
            serde_json::json!({"location": "us-central1", "nodeVersion": "1.30"}),
        );
        let out = ClusterProvisioner
            .provision(&ctx, &testing::base(), &resource, &params())
            .await
            .unwrap();
        assert_eq!(
            out.secret_keys().into_iter().collect::<Vec<_>>(),
            vec!["base--gke--prod-kubeconfig"]
        );

        let consumed = testing::publish(&ctx, &testing::base(), &resource, &out).await;
        let collector = testing::collector();
        let process = ProcessParams {
            shape: ShapeKind::KubernetesPod,
            workload: "deployer".into(),
        };
        ClusterProcessor
            .process(&ctx, &testing::base(), &consumed, &collector, &process)
            .await
            .unwrap();

        let endpoint = collector.env_value("KUBE_ENDPOINT").unwrap();
        let secrets = collector.secret_env_variables();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].name, "KUBECONFIG_DATA");
        assert!(secrets[0].value.contains(&format!("https://{}", endpoint)));
        assert!(collector.env_variables().iter().all(|v| v.name != "KUBECONFIG_DATA"));
    }

    #[tokio::test]
    async fn test_adopt_looks_up_in_location() {
        let engine = MemoryEngine::new("acme").add_live_resource(
            LiveResource::new(RESOURCE_TYPE, "legacy")
                .with_region("europe-west1")
                .with_attribute("endpoint", serde_json::json!("35.1.2.3"))
                .with_attribute("caCertificate", serde_json::json!("Y2E="))
                .with_attribute("nodeCount", serde_json::json!(6)),
        );
        let (ctx, _) = testing::context(&engine);
        let resource = ResourceDescriptor::new(
            "gke",
            RESOURCE_TYPE,
            serde_json::json!({"adopt": true, "clusterName": "legacy", "location": "europe-west1"}),
        );
        let out = ClusterProvisioner
            .provision(&ctx, &testing::base(), &resource, &params())
            .await
            .unwrap();
        let managed = engine.managed(&out.handle.unwrap().urn).unwrap();
        assert_eq!(managed.request.properties["nodeCount"], 6);
        assert_eq!(managed.request.import_id.as_deref(), Some("legacy"));
    }

    #[test]
    fn test_validate_requires_location_on_both_paths() {
        let adopt = ResourceDescriptor::new(
            "gke",
            RESOURCE_TYPE,
            serde_json::json!({"adopt": true, "clusterName": "legacy"}),
        );
        let create = ResourceDescriptor::new("gke", RESOURCE_TYPE, serde_json::json!({"nodeVersion": "1.30"}));
        assert!(ClusterProvisioner.validate(&adopt).is_err());
        assert!(ClusterProvisioner.validate(&create).is_err());
    }

    #[tokio::test]
    async fn test_create_and_adopt_export_the_same_keys() {
        let engine = MemoryEngine::new("acme").add_live_resource(
            LiveResource::new(RESOURCE_TYPE, "legacy")
                .with_region("europe-west1")
                .with_attribute("endpoint", serde_json::json!("35.1.2.3"))
                .with_attribute("caCertificate", serde_json::json!("Y2E=")),
        );
        let (ctx, _) = testing::context(&engine);
        let created = ResourceDescriptor::new(
            "gke",
            RESOURCE_TYPE,
            serde_json::json!({"location": "europe-west1", "nodeVersion": "1.30"}),
        );
        let adopted = ResourceDescriptor::new(
            "gke",
            RESOURCE_TYPE,
            serde_json::json!({"adopt": true, "clusterName": "legacy", "location": "europe-west1"}),
        );

        let create_out = ClusterProvisioner
            .provision(&ctx, &testing::base(), &created, &params())
            .await
            .unwrap();
        let adopt_out = ClusterProvisioner
            .provision(&ctx, &testing::base(), &adopted, &params())
            .await
            .unwrap();

        assert_eq!(adopt_out.action, Some(ProvisionAction::Adopt));
        assert_eq!(create_out.export_keys(), adopt_out.export_keys());
        assert_eq!(create_out.secret_keys(), adopt_out.secret_keys());
        assert_eq!(
            adopt_out.secret_keys().into_iter().collect::<Vec<_>>(),
            vec!["base--gke--prod-kubeconfig"]
        );
    }
}
