//! Cloud Storage buckets

use super::{
    adopted_property, import_exports, imported, missing, properties, register_consumption,
    template_fields, write_exports, EnvWriter, ExportValues,
};
use crate::context::ProvisionContext;
use crate::registry::{ComputeProcessor, ExportField, ProcessParams, ProvisionParams, ProvisioningFunction};
use async_trait::async_trait;
use fleetstack_cloud::ResourceRequest;
use fleetstack_core::{
    ComputeContextCollector, ConsumedResource, Deferred, NameRules, ProvisionAction,
    ResourceDescriptor, ResourceOutput, Result, StackDescriptor, TemplateValue,
};
use serde::Deserialize;

pub const RESOURCE_TYPE: &str = "gcp-bucket";

const EXPORTS: &[ExportField] = &[
    ExportField::plain("bucket-name"),
    ExportField::plain("location"),
    ExportField::plain("url"),
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketConfig {
    #[serde(default)]
    adopt: bool,
    location: Option<String>,
    storage_class: Option<String>,
    versioning: Option<bool>,
    bucket_name: Option<String>,
}

impl BucketConfig {
    fn parse(resource: &ResourceDescriptor) -> Result<Self> {
        let config: Self = resource.typed_config()?;
        if config.adopt {
            if config.bucket_name.is_none() {
                return Err(missing(&resource.name, "bucketName", "adopt a bucket"));
            }
        } else if config.location.is_none() {
            return Err(missing(&resource.name, "location", "create a bucket"));
        }
        Ok(config)
    }
}

pub struct BucketProvisioner;

#[async_trait]
impl ProvisioningFunction for BucketProvisioner {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    fn exports(&self) -> &'static [ExportField] {
        EXPORTS
    }

    fn validate(&self, resource: &ResourceDescriptor) -> Result<()> {
        BucketConfig::parse(resource).map(|_| ())
    }

    async fn provision(
        &self,
        ctx: &ProvisionContext,
        _stack: &StackDescriptor,
        resource: &ResourceDescriptor,
        params: &ProvisionParams,
    ) -> Result<ResourceOutput> {
        let config = BucketConfig::parse(resource)?;
        let derived = &params.derived_name;

        let (action, provisioned, location) = if config.adopt {
            let bucket_name = config.bucket_name.clone().unwrap_or_default();
            let live = ctx.lookup_required(RESOURCE_TYPE, &bucket_name, None).await?;
            let location = config
                .location
                .clone()
                .or_else(|| live.get_attribute::<String>("location"))
                .or_else(|| live.region.clone())
                .unwrap_or_default();
            let props = properties([
                ("location", Some(location.clone().into())),
                ("storageClass", adopted_property(config.storage_class.clone(), &live, "storageClass")),
                ("versioning", adopted_property(config.versioning, &live, "versioning")),
            ]);
            let request = ResourceRequest::new(RESOURCE_TYPE, derived, &bucket_name, props)
                .with_import_id(&bucket_name);
            (ProvisionAction::Adopt, ctx.adopt(request).await?, location)
        } else {
            let location = config.location.clone().unwrap_or_default();
            let props = properties([
                ("location", Some(location.clone().into())),
                ("storageClass", Some(config.storage_class.clone().unwrap_or_else(|| "STANDARD".into()).into())),
                ("versioning", Some(config.versioning.unwrap_or(false).into())),
            ]);
            let request = ResourceRequest::new(
                RESOURCE_TYPE,
                derived,
                NameRules::GCS_BUCKET.apply(derived),
                props,
            );
            (ProvisionAction::Create, ctx.create(request).await?, location)
        };

        let mut output = ResourceOutput::new(resource, derived)
            .with_action(action)
            .with_handle(provisioned.handle.clone());
        write_exports(
            &mut output,
            EXPORTS,
            ExportValues::from([
                ("bucket-name", provisioned.attribute("name")),
                ("location", Deferred::ready(location)),
                ("url", provisioned.attribute("url")),
            ]),
        )?;
        Ok(output)
    }
}

pub struct BucketProcessor;

#[async_trait]
impl ComputeProcessor for BucketProcessor {
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
        let name = imported(&values, "bucket-name");
        let location = imported(&values, "location");
        let url = imported(&values, "url");

        let env = EnvWriter::new(collector, resource);
        env.plain("GCS_BUCKET_NAME", name);
        env.plain("GCS_LOCATION", location);
        env.plain("GCS_BUCKET_URL", url);

        register_consumption(
            collector,
            resource,
            template_fields([
                ("name", TemplateValue::plain(name)),
                ("location", TemplateValue::plain(location)),
                ("url", TemplateValue::plain(url)),
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
            derived_name: "base--assets--prod".into(),
        }
    }

    #[tokio::test]
    async fn test_adopt_reads_live_location() {
        let engine = MemoryEngine::new("acme").add_live_resource(
            LiveResource::new(RESOURCE_TYPE, "acme-legacy-assets")
                .with_attribute("location", serde_json::json!("EU"))
                .with_attribute("url", serde_json::json!("gs://acme-legacy-assets")),
        );
        let (ctx, backend) = testing::context(&engine);
        let resource = ResourceDescriptor::new(
            "assets",
            RESOURCE_TYPE,
            serde_json::json!({"adopt": true, "bucketName": "acme-legacy-assets"}),
        );
        let out = BucketProvisioner
            .provision(&ctx, &testing::base(), &resource, &params())
            .await
            .unwrap();
        testing::publish(&ctx, &testing::base(), &resource, &out).await;

        let location = fleetstack_core::import(
            backend.as_ref(),
            &testing::base().reference(),
            "base--assets--prod-location",
            false,
        )
        .await
        .unwrap();
        assert_eq!(location, "EU");
        let name = fleetstack_core::import(
            backend.as_ref(),
            &testing::base().reference(),
            "base--assets--prod-bucket-name",
            false,
        )
        .await
        .unwrap();
        assert_eq!(name, "acme-legacy-assets");
    }

    #[tokio::test]
    async fn test_processor_exposes_bucket() {
        let engine = MemoryEngine::new("acme");
        let (ctx, _) = testing::context(&engine);
        let resource = ResourceDescriptor::new("assets", RESOURCE_TYPE, serde_json::json!({"location": "US"}));
        let out = BucketProvisioner
            .provision(&ctx, &testing::base(), &resource, &params())
            .await
            .unwrap();
        assert_eq!(out.export_keys().len(), EXPORTS.len());
        let consumed = testing::publish(&ctx, &testing::base(), &resource, &out).await;

        let collector = testing::collector();
        let process = ProcessParams {
            shape: ShapeKind::CloudRun,
            workload: "api".into(),
        };
        BucketProcessor
            .process(&ctx, &testing::base(), &consumed, &collector, &process)
            .await
            .unwrap();
        assert_eq!(collector.env_value("GCS_BUCKET_NAME").unwrap(), "base--assets--prod");
        assert_eq!(collector.env_value("GCS_LOCATION").unwrap(), "US");
        assert_eq!(collector.env_value("GCS_BUCKET_URL").unwrap(), "gs://base--assets--prod");
    }

    #[tokio::test]
    async fn test_create_and_adopt_export_the_same_keys() {
        let engine = MemoryEngine::new("acme").add_live_resource(
            LiveResource::new(RESOURCE_TYPE, "acme-legacy-assets")
                .with_attribute("location", serde_json::json!("EU")),
        );
        let (ctx, _) = testing::context(&engine);
        let created = ResourceDescriptor::new("assets", RESOURCE_TYPE, serde_json::json!({"location": "US"}));
        let adopted = ResourceDescriptor::new(
            "assets",
            RESOURCE_TYPE,
            serde_json::json!({"adopt": true, "bucketName": "acme-legacy-assets"}),
        );

        let create_out = BucketProvisioner
            .provision(&ctx, &testing::base(), &created, &params())
            .await
            .unwrap();
        let adopt_out = BucketProvisioner
            .provision(&ctx, &testing::base(), &adopted, &params())
            .await
            .unwrap();

        assert_eq!(create_out.action, Some(ProvisionAction::Create));
        assert_eq!(adopt_out.action, Some(ProvisionAction::Adopt));
        assert_eq!(create_out.export_keys(), adopt_out.export_keys());
        assert_eq!(create_out.secret_keys(), adopt_out.secret_keys());
        assert_eq!(create_out.export_keys().len(), EXPORTS.len());
    }
}
