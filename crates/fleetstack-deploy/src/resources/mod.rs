//! Built-in resource types
//!
//! Every type follows the same shape: parse and validate the typed config,
//! branch on the adopt flag, create or adopt through the engine, then hand
//! both paths' values to one shared export-writing step.

pub mod bucket;
pub mod cluster;
pub mod postgres;
pub mod pubsub;
pub mod redis;

use crate::context::ProvisionContext;
use crate::registry::{ExportField, Registry};
use fleetstack_cloud::LiveResource;
use fleetstack_core::{
    ComputeContextCollector, ConsumedResource, ConsumerRelation, Deferred, ResourceOutput,
    Result, StackError, TemplateFields, TemplateValue,
};
use futures_util::future;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn register_defaults(registry: &mut Registry) {
    registry.register_provisioner(Arc::new(postgres::PostgresProvisioner));
    registry.register_processor(Arc::new(postgres::PostgresProcessor));
    registry.register_provisioner(Arc::new(redis::RedisProvisioner));
    registry.register_processor(Arc::new(redis::RedisProcessor));
    registry.register_provisioner(Arc::new(bucket::BucketProvisioner));
    registry.register_processor(Arc::new(bucket::BucketProcessor));
    registry.register_provisioner(Arc::new(pubsub::TopicProvisioner));
    registry.register_processor(Arc::new(pubsub::TopicProcessor));
    registry.register_provisioner(Arc::new(cluster::ClusterProvisioner));
    registry.register_processor(Arc::new(cluster::ClusterProcessor));
}

/// Deferred export values of one resource, by suffix
pub(crate) type ExportValues = BTreeMap<&'static str, Deferred<String>>;

/// Stage the exports of a resource.
///
/// The single exit point of both the Create and the Adopt path: every
/// declared field must have a value and nothing else may be written.
pub(crate) fn write_exports(
    output: &mut ResourceOutput,
    fields: &[ExportField],
    mut values: ExportValues,
) -> Result<()> {
    for field in fields {
        let value = values.remove(field.suffix).ok_or_else(|| {
            StackError::config(
                &output.resource_name,
                format!("no value produced for export '{}'", field.suffix),
            )
        })?;
        let key = field.key(&output.derived_name);
        output.export(key, value, field.secret);
    }
    if let Some(extra) = values.keys().next() {
        return Err(StackError::config(
            &output.resource_name,
            format!("undeclared export '{}'", extra),
        ));
    }
    Ok(())
}

/// Import every export of a consumed resource
pub(crate) async fn import_exports(
    ctx: &ProvisionContext,
    resource: &ConsumedResource,
    fields: &[ExportField],
) -> Result<BTreeMap<&'static str, String>> {
    let values = future::try_join_all(fields.iter().map(|field| async move {
        let key = field.key(&resource.derived_name);
        let value = ctx.import(&resource.owner, &key, field.secret).await?;
        Ok::<_, StackError>((field.suffix, value))
    }))
    .await?;
    Ok(values.into_iter().collect())
}

/// Value of an imported export; `import_exports` guarantees presence
pub(crate) fn imported<'a>(values: &'a BTreeMap<&'static str, String>, suffix: &str) -> &'a str {
    values.get(suffix).map(String::as_str).unwrap_or_default()
}

/// Env writes on behalf of one consumed resource
pub(crate) struct EnvWriter<'a> {
    collector: &'a ComputeContextCollector,
    resource: &'a ConsumedResource,
}

impl<'a> EnvWriter<'a> {
    pub(crate) fn new(collector: &'a ComputeContextCollector, resource: &'a ConsumedResource) -> Self {
        Self {
            collector,
            resource,
        }
    }

    pub(crate) fn plain(&self, name: &str, value: &str) {
        self.collector.add_env_variable_if_not_exist(
            name,
            value,
            &self.resource.descriptor.resource_type,
            &self.resource.descriptor.name,
            &self.resource.owner.stack,
        );
    }

    pub(crate) fn secret(&self, name: &str, value: &str) {
        self.collector.add_secret_env_variable_if_not_exist(
            name,
            value,
            &self.resource.descriptor.resource_type,
            &self.resource.descriptor.name,
            &self.resource.owner.stack,
        );
    }
}

/// Register the dependency edge and template fields of a consumed resource
pub(crate) fn register_consumption(
    collector: &ComputeContextCollector,
    resource: &ConsumedResource,
    fields: TemplateFields,
) {
    if let Some(handle) = &resource.handle {
        collector.add_dependency(handle.clone());
    }
    match &resource.relation {
        ConsumerRelation::Uses => {
            collector.add_resource_tpl_extension(resource.template_key(), fields)
        }
        ConsumerRelation::DependsOn { .. } => {
            collector.add_dependency_tpl_extension(resource.template_key(), fields)
        }
    }
}

pub(crate) fn template_fields<const N: usize>(fields: [(&str, TemplateValue); N]) -> TemplateFields {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Property of an adopted resource.
///
/// An explicit config value wins; otherwise the live object's current value
/// is kept so adoption never drifts back to platform defaults.
pub(crate) fn adopted_property<T: serde::Serialize>(
    explicit: Option<T>,
    live: &LiveResource,
    key: &str,
) -> Option<serde_json::Value> {
    match explicit {
        Some(value) => serde_json::to_value(value).ok(),
        None => live.attributes.get(key).cloned(),
    }
}

/// Object of properties, skipping absent values
pub(crate) fn properties<const N: usize>(
    entries: [(&str, Option<serde_json::Value>); N],
) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = entries
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
        .collect();
    serde_json::Value::Object(map)
}

/// Error for a field the chosen path needs but the config lacks
pub(crate) fn missing(resource: &str, field: &str, path: &str) -> StackError {
    StackError::config(resource, format!("'{}' is required to {}", field, path))
}
