//! Memorystore for Redis

use super::{
    adopted_property, import_exports, imported, missing, properties, register_consumption,
    template_fields, write_exports, EnvWriter, ExportValues,
};
use crate::context::ProvisionContext;
use crate::registry::{ComputeProcessor, ExportField, ProcessParams, ProvisionParams, ProvisioningFunction};
use async_trait::async_trait;
use fleetstack_cloud::ResourceRequest;
use fleetstack_core::{
    ComputeContextCollector, ConsumedResource, NameRules, ProvisionAction, ResourceDescriptor,
    ResourceOutput, Result, StackDescriptor, TemplateValue,
};
use serde::Deserialize;

pub const RESOURCE_TYPE: &str = "gcp-redis";

const EXPORTS: &[ExportField] = &[ExportField::plain("host"), ExportField::plain("port")];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RedisConfig {
    #[serde(default)]
    adopt: bool,
    memory_size_gb: Option<u32>,
    tier: Option<String>,
    redis_version: Option<String>,
    region: Option<String>,
    /// Existing instance to adopt
    instance_id: Option<String>,
}

impl RedisConfig {
    fn parse(resource: &ResourceDescriptor) -> Result<Self> {
        let config: Self = resource.typed_config()?;
        if config.adopt {
            if config.instance_id.is_none() {
                return Err(missing(&resource.name, "instanceId", "adopt a Redis instance"));
            }
            if config.region.is_none() {
                return Err(missing(&resource.name, "region", "adopt a Redis instance"));
            }
        } else if config.memory_size_gb.is_none() {
            return Err(missing(&resource.name, "memorySizeGb", "create a Redis instance"));
        }
        Ok(config)
    }
}

pub struct RedisProvisioner;

#[async_trait]
impl ProvisioningFunction for RedisProvisioner {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    fn exports(&self) -> &'static [ExportField] {
        EXPORTS
    }

    fn validate(&self, resource: &ResourceDescriptor) -> Result<()> {
        RedisConfig::parse(resource).map(|_| ())
    }

    async fn provision(
        &self,
        ctx: &ProvisionContext,
        _stack: &StackDescriptor,
        resource: &ResourceDescriptor,
        params: &ProvisionParams,
    ) -> Result<ResourceOutput> {
        let config = RedisConfig::parse(resource)?;
        let derived = &params.derived_name;

        let (action, provisioned) = if config.adopt {
            let instance_id = config.instance_id.clone().unwrap_or_default();
            let live = ctx
                .lookup_required(RESOURCE_TYPE, &instance_id, config.region.as_deref())
                .await?;
            let props = properties([
                ("region", live.region.clone().map(Into::into)),
                ("memorySizeGb", adopted_property(config.memory_size_gb, &live, "memorySizeGb")),
                ("tier", adopted_property(config.tier.clone(), &live, "tier")),
                ("redisVersion", adopted_property(config.redis_version.clone(), &live, "redisVersion")),
            ]);
            let request = ResourceRequest::new(RESOURCE_TYPE, derived, &instance_id, props)
                .with_import_id(&instance_id);
            (ProvisionAction::Adopt, ctx.adopt(request).await?)
        } else {
            let props = properties([
                ("region", Some(config.region.clone().unwrap_or_else(|| "us-central1".into()).into())),
                ("memorySizeGb", config.memory_size_gb.map(Into::into)),
                ("tier", Some(config.tier.clone().unwrap_or_else(|| "BASIC".into()).into())),
                ("redisVersion", Some(config.redis_version.clone().unwrap_or_else(|| "REDIS_7_0".into()).into())),
            ]);
            let request = ResourceRequest::new(
                RESOURCE_TYPE,
                derived,
                NameRules::MEMORYSTORE_INSTANCE.apply(derived),
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
                ("host", provisioned.attribute("host")),
                ("port", provisioned.attribute("port")),
            ]),
        )?;
        Ok(output)
    }
}

pub struct RedisProcessor;

#[async_trait]
impl ComputeProcessor for RedisProcessor {
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
        let host = imported(&values, "host");
        let port = imported(&values, "port");
        let url = format!("redis://{}:{}", host, port);

        let env = EnvWriter::new(collector, resource);
        env.plain("REDIS_HOST", host);
        env.plain("REDIS_PORT", port);
        env.plain("REDIS_URL", &url);

        register_consumption(
            collector,
            resource,
            template_fields([
                ("host", TemplateValue::plain(host)),
                ("port", TemplateValue::plain(port)),
                ("url", TemplateValue::plain(url)),
            ]),
        );
        Ok(ResourceOutput::new(&resource.descriptor, &resource.derived_name))
    }
}
