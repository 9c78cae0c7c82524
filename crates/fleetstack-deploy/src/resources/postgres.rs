//! Cloud SQL for PostgreSQL
//!
//! The instance is shared: every consumer gets its own role and database,
//! created by the sidecar provisioner once the consuming workload exists.

use super::{
    adopted_property, import_exports, imported, missing, properties, register_consumption,
    template_fields, write_exports, ExportValues,
};
use crate::context::ProvisionContext;
use crate::registry::{ComputeProcessor, ExportField, ProcessParams, ProvisionParams, ProvisioningFunction};
use crate::sidecar::{self, InstanceAccess};
use async_trait::async_trait;
use fleetstack_cloud::ResourceRequest;
use fleetstack_core::{
    ComputeContextCollector, ConsumedResource, Deferred, NameRules, ProvisionAction,
    ResourceDescriptor, ResourceOutput, Result, StackDescriptor, TemplateValue,
};
use serde::Deserialize;

pub const RESOURCE_TYPE: &str = "gcp-cloudsql-postgres";

const EXPORTS: &[ExportField] = &[
    ExportField::plain("connection-name"),
    ExportField::plain("host"),
    ExportField::plain("port"),
    ExportField::plain("root-user"),
    ExportField::secret("root-password"),
    ExportField::plain("version"),
];

const DEFAULT_ROOT_USER: &str = "postgres";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostgresConfig {
    #[serde(default)]
    adopt: bool,
    /// e.g. POSTGRES_16
    version: Option<String>,
    tier: Option<String>,
    region: Option<String>,
    disk_size_gb: Option<u32>,
    availability_type: Option<String>,
    root_user: Option<String>,
    instance_name: Option<String>,
    /// Root password of an adopted instance; it cannot be read back
    root_password: Option<String>,
}

impl PostgresConfig {
    fn parse(resource: &ResourceDescriptor) -> Result<Self> {
        let config: Self = resource.typed_config()?;
        let required: Vec<(&str, bool)> = if config.adopt {
            vec![
                ("instanceName", config.instance_name.is_some()),
                ("region", config.region.is_some()),
                ("rootPassword", config.root_password.as_deref().is_some_and(|p| !p.is_empty())),
            ]
        } else {
            vec![("version", config.version.is_some()), ("tier", config.tier.is_some())]
        };
        let path = if config.adopt {
            "adopt a Cloud SQL instance"
        } else {
            "create a Cloud SQL instance"
        };
        if let Some((field, _)) = required.iter().find(|(_, present)| !present) {
            return Err(missing(&resource.name, field, path));
        }
        Ok(config)
    }
}

pub struct PostgresProvisioner;

#[async_trait]
impl ProvisioningFunction for PostgresProvisioner {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    fn exports(&self) -> &'static [ExportField] {
        EXPORTS
    }

    fn validate(&self, resource: &ResourceDescriptor) -> Result<()> {
        PostgresConfig::parse(resource).map(|_| ())
    }

    async fn provision(
        &self,
        ctx: &ProvisionContext,
        _stack: &StackDescriptor,
        resource: &ResourceDescriptor,
        params: &ProvisionParams,
    ) -> Result<ResourceOutput> {
        let config = PostgresConfig::parse(resource)?;
        let derived = &params.derived_name;

        let (action, provisioned, root_user, root_password) = if config.adopt {
            let instance_name = config.instance_name.clone().unwrap_or_default();
            let live = ctx
                .lookup_required(RESOURCE_TYPE, &instance_name, config.region.as_deref())
                .await?;
            let root_user = config
                .root_user
                .clone()
                .or_else(|| live.get_attribute::<String>("rootUser"))
                .unwrap_or_else(|| DEFAULT_ROOT_USER.to_string());
            let props = properties([
                ("region", config.region.clone().map(Into::into)),
                ("databaseVersion", adopted_property(config.version.clone(), &live, "databaseVersion")),
                ("tier", adopted_property(config.tier.clone(), &live, "tier")),
                ("diskSizeGb", adopted_property(config.disk_size_gb, &live, "diskSizeGb")),
                ("availabilityType", adopted_property(config.availability_type.clone(), &live, "availabilityType")),
            ]);
            let request = ResourceRequest::new(RESOURCE_TYPE, derived, &instance_name, props)
                .with_import_id(&instance_name);
            let provisioned = ctx.adopt(request).await?;
            (
                ProvisionAction::Adopt,
                provisioned,
                root_user,
                config.root_password.clone().unwrap_or_default(),
            )
        } else {
            let root_user = config
                .root_user
                .clone()
                .unwrap_or_else(|| DEFAULT_ROOT_USER.to_string());
            let (password_handle, root_password) =
                sidecar::stable_password(ctx, &format!("{}--root-password", derived)).await?;
            let props = properties([
                ("region", Some(config.region.clone().unwrap_or_else(|| "us-central1".into()).into())),
                ("databaseVersion", config.version.clone().map(Into::into)),
                ("tier", config.tier.clone().map(Into::into)),
                ("diskSizeGb", Some(config.disk_size_gb.unwrap_or(10).into())),
                ("availabilityType", Some(config.availability_type.clone().unwrap_or_else(|| "ZONAL".into()).into())),
                ("rootUser", Some(root_user.clone().into())),
                ("rootPassword", Some(root_password.clone().into())),
            ]);
            let request = ResourceRequest::new(
                RESOURCE_TYPE,
                derived,
                NameRules::CLOUDSQL_INSTANCE.apply(derived),
                props,
            )
            .with_depends_on(password_handle);
            (ProvisionAction::Create, ctx.create(request).await?, root_user, root_password)
        };

        let mut output = ResourceOutput::new(resource, derived)
            .with_action(action)
            .with_handle(provisioned.handle.clone());
        write_exports(
            &mut output,
            EXPORTS,
            ExportValues::from([
                ("connection-name", provisioned.attribute("connectionName")),
                ("host", provisioned.attribute("privateIp")),
                ("port", provisioned.attribute("port")),
                ("root-user", Deferred::ready(root_user)),
                ("root-password", Deferred::ready(root_password)),
                ("version", provisioned.attribute("databaseVersion")),
            ]),
        )?;
        Ok(output)
    }
}

pub struct PostgresProcessor;

#[async_trait]
impl ComputeProcessor for PostgresProcessor {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    async fn process(
        &self,
        ctx: &ProvisionContext,
        stack: &StackDescriptor,
        resource: &ConsumedResource,
        collector: &ComputeContextCollector,
        params: &ProcessParams,
    ) -> Result<ResourceOutput> {
        let values = import_exports(ctx, resource, EXPORTS).await?;
        let instance = InstanceAccess {
            connection_name: imported(&values, "connection-name").to_string(),
            host: imported(&values, "host").to_string(),
            root_user: imported(&values, "root-user").to_string(),
            root_password: imported(&values, "root-password").to_string(),
        };

        let consumer = sidecar::provision_consumer(ctx, stack, resource, collector, params, &instance).await?;

        register_consumption(
            collector,
            resource,
            template_fields([
                ("host", TemplateValue::plain(consumer.host.as_str())),
                ("port", TemplateValue::plain(consumer.port.to_string())),
                ("user", TemplateValue::plain(consumer.user.as_str())),
                ("database", TemplateValue::plain(consumer.database.as_str())),
                ("connectionName", TemplateValue::plain(instance.connection_name.as_str())),
                ("password", TemplateValue::secret(consumer.password.as_str())),
                ("url", TemplateValue::secret(consumer.url())),
            ]),
        );
        Ok(ResourceOutput::new(&resource.descriptor, &resource.derived_name))
    }
}
