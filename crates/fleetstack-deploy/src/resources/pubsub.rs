//! Pub/Sub topics and their pull subscriptions

use super::{
    import_exports, imported, missing, properties, register_consumption, template_fields,
    write_exports, EnvWriter, ExportValues,
};
use crate::context::ProvisionContext;
use crate::registry::{ComputeProcessor, ExportField, ProcessParams, ProvisionParams, ProvisioningFunction};
use async_trait::async_trait;
use fleetstack_cloud::ResourceRequest;
use fleetstack_core::{
    ComputeContextCollector, ConsumedResource, Deferred, NameRules, ProvisionAction,
    ResourceDescriptor, ResourceOutput, Result, StackDescriptor, StackError, TemplateValue,
};
use futures_util::future;
use serde::Deserialize;

pub const RESOURCE_TYPE: &str = "gcp-pubsub-topic";
const SUBSCRIPTION_TYPE: &str = "gcp-pubsub-subscription";

const EXPORTS: &[ExportField] = &[ExportField::plain("topic"), ExportField::plain("subscriptions")];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicConfig {
    #[serde(default)]
    adopt: bool,
    #[serde(default)]
    subscriptions: Option<Vec<String>>,
    message_retention: Option<String>,
    topic_name: Option<String>,
}

impl TopicConfig {
    fn parse(resource: &ResourceDescriptor) -> Result<Self> {
        let config: Self = resource.typed_config()?;
        if config.adopt && config.topic_name.is_none() {
            return Err(missing(&resource.name, "topicName", "adopt a topic"));
        }
        if let Some(subs) = &config.subscriptions {
            if subs.iter().any(|s| s.trim().is_empty() || s.contains(',')) {
                return Err(StackError::config(
                    &resource.name,
                    "subscription names must be non-empty and contain no ','",
                ));
            }
        }
        Ok(config)
    }
}

pub struct TopicProvisioner;

#[async_trait]
impl ProvisioningFunction for TopicProvisioner {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    fn exports(&self) -> &'static [ExportField] {
        EXPORTS
    }

    fn validate(&self, resource: &ResourceDescriptor) -> Result<()> {
        TopicConfig::parse(resource).map(|_| ())
    }

    async fn provision(
        &self,
        ctx: &ProvisionContext,
        _stack: &StackDescriptor,
        resource: &ResourceDescriptor,
        params: &ProvisionParams,
    ) -> Result<ResourceOutput> {
        let config = TopicConfig::parse(resource)?;
        let derived = &params.derived_name;

        let (action, topic, subscriptions) = if config.adopt {
            let topic_name = config.topic_name.clone().unwrap_or_default();
            let live = ctx.lookup_required(RESOURCE_TYPE, &topic_name, None).await?;
            // Existing subscriptions stay owned by whoever created them
            let subscriptions = config
                .subscriptions
                .clone()
                .or_else(|| live.get_attribute::<Vec<String>>("subscriptions"))
                .unwrap_or_default();
            let props = properties([(
                "messageRetention",
                config
                    .message_retention
                    .clone()
                    .map(Into::into)
                    .or_else(|| live.attributes.get("messageRetention").cloned()),
            )]);
            let request = ResourceRequest::new(RESOURCE_TYPE, derived, &topic_name, props)
                .with_import_id(&topic_name);
            (ProvisionAction::Adopt, ctx.adopt(request).await?, subscriptions)
        } else {
            let props = properties([(
                "messageRetention",
                config.message_retention.clone().map(Into::into),
            )]);
            let request = ResourceRequest::new(
                RESOURCE_TYPE,
                derived,
                NameRules::PUBSUB_TOPIC.apply(derived),
                props,
            );
            let topic = ctx.create(request).await?;

            let subscriptions = config.subscriptions.clone().unwrap_or_default();
            let created = future::try_join_all(subscriptions.iter().map(|sub| {
                let logical = format!("{}--{}", derived, sub);
                let request = ResourceRequest::new(
                    SUBSCRIPTION_TYPE,
                    &logical,
                    NameRules::PUBSUB_TOPIC.apply(&logical),
                    serde_json::json!({ "topic": NameRules::PUBSUB_TOPIC.apply(derived) }),
                )
                .with_depends_on(topic.handle.clone());
                ctx.create(request)
            }))
            .await?;
            let names = created
                .iter()
                .zip(&subscriptions)
                .map(|(res, sub)| {
                    tracing::debug!(urn = %res.handle.urn, subscription = %sub, "Subscription created");
                    NameRules::PUBSUB_TOPIC.apply(&format!("{}--{}", derived, sub))
                })
                .collect();
            (ProvisionAction::Create, topic, names)
        };

        let mut output = ResourceOutput::new(resource, derived)
            .with_action(action)
            .with_handle(topic.handle.clone());
        write_exports(
            &mut output,
            EXPORTS,
            ExportValues::from([
                ("topic", topic.attribute("name")),
                ("subscriptions", Deferred::ready(subscriptions.join(","))),
            ]),
        )?;
        Ok(output)
    }
}

pub struct TopicProcessor;

#[async_trait]
impl ComputeProcessor for TopicProcessor {
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
        // A topic without subscriptions exports an empty list, which import rejects
        let topic_field = &EXPORTS[..1];
        let values = import_exports(ctx, resource, topic_field).await?;
        let topic = imported(&values, "topic");
        let subscriptions = match ctx
            .import(&resource.owner, &EXPORTS[1].key(&resource.derived_name), false)
            .await
        {
            Ok(list) => list,
            Err(StackError::ExportEmpty { .. }) => String::new(),
            Err(e) => return Err(e),
        };

        let env = EnvWriter::new(collector, resource);
        env.plain("PUBSUB_TOPIC", topic);
        if !subscriptions.is_empty() {
            env.plain("PUBSUB_SUBSCRIPTIONS", &subscriptions);
        }

        register_consumption(
            collector,
            resource,
            template_fields([
                ("topic", TemplateValue::plain(topic)),
                ("subscriptions", TemplateValue::plain(subscriptions.as_str())),
            ]),
        );
        Ok(ResourceOutput::new(&resource.descriptor, &resource.derived_name))
    }
}
