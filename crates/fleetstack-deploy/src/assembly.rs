//! Workload assembly
//!
//! Runs the compute processor of every consumed resource against one
//! collector, then turns the collected context into the workload shape that
//! is handed to the engine.

use crate::context::ProvisionContext;
use crate::registry::{ProcessParams, Registry};
use fleetstack_core::{
    CollectedContext, ComputeContextCollector, ConsumedResource, ConsumerRelation, ContainerSpec,
    ResourceHandle, Result, ResultExt, StackDescriptor, StackError, StackGraph, StackReference,
    WorkloadDescriptor, WorkloadShape,
};
use futures_util::future;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Engine handles of resources provisioned in the current run
pub type HandleIndex = BTreeMap<(StackReference, String), ResourceHandle>;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(resource|dependency):([^.}]+)\.([^}]+)\}").unwrap()
});

/// Workload ready to be deployed
#[derive(Debug)]
pub struct AssembledWorkload {
    pub name: String,
    pub shape: WorkloadShape,
    pub context: CollectedContext,
    pub consumed: Vec<ConsumedResource>,
}

/// Resources a stack's workload consumes, in declared order: `uses` first,
/// then `dependsOnResources`. The position is the collector slot.
pub fn consumed_resources(
    graph: &StackGraph,
    stack: &StackDescriptor,
    handles: &HandleIndex,
) -> Result<Vec<ConsumedResource>> {
    let mut consumed = Vec::new();

    if let Some(workload) = &stack.workload {
        for name in &workload.uses {
            let (owner, descriptor) = graph.resolve_uses(stack, name)?;
            let owner_ref = owner.reference();
            consumed.push(ConsumedResource {
                descriptor: descriptor.clone(),
                derived_name: owner.resource_name(&descriptor.name),
                handle: handles.get(&(owner_ref.clone(), descriptor.name.clone())).cloned(),
                owner: owner_ref,
                relation: ConsumerRelation::Uses,
            });
        }
    }

    for dep in &stack.depends_on_resources {
        let owner_ref = stack.depends_on_reference(dep);
        let owner = graph
            .get_required(&owner_ref)
            .with_context(|| format!("dependsOn '{}'", dep.name))?;
        let descriptor = owner
            .find_resource(&dep.resource)
            .ok_or_else(|| StackError::ResourceNotFound {
                stack: owner_ref.to_string(),
                resource: dep.resource.clone(),
            })
            .with_context(|| format!("dependsOn '{}'", dep.name))?;
        consumed.push(ConsumedResource {
            descriptor: descriptor.clone(),
            derived_name: owner.resource_name(&descriptor.name),
            handle: handles.get(&(owner_ref.clone(), descriptor.name.clone())).cloned(),
            owner: owner_ref,
            relation: ConsumerRelation::DependsOn {
                name: dep.name.clone(),
                owner: dep.owner.clone(),
            },
        });
    }

    Ok(consumed)
}

/// Assemble the workload of a stack, if it declares one
pub async fn assemble(
    ctx: &ProvisionContext,
    registry: &Registry,
    graph: &StackGraph,
    stack: &StackDescriptor,
    handles: &HandleIndex,
) -> Result<Option<AssembledWorkload>> {
    let Some(workload) = &stack.workload else {
        return Ok(None);
    };
    if workload.containers.is_empty() {
        return Err(StackError::config(&workload.name, "workload declares no container"));
    }

    let consumed = consumed_resources(graph, stack, handles)?;
    let collector = ComputeContextCollector::new();
    let params = ProcessParams {
        shape: workload.shape,
        workload: workload.name.clone(),
    };

    // Processors run concurrently; slots keep the outcome in declared order
    future::try_join_all(consumed.iter().enumerate().map(|(slot, resource)| {
        let collector = collector.for_slot(slot as u32);
        let params = &params;
        async move {
            let processor = registry.processor(&resource.descriptor.resource_type)?;
            processor
                .process(ctx, stack, resource, &collector, params)
                .await
                .with_context(|| resource.label())
        }
    }))
    .await?;

    let mut context = collector.finish()?;
    let mut shape = workload.to_shape();
    apply_env(&mut shape, workload, &context)?;
    context.apply_pre_processors(&mut shape)?;

    tracing::debug!(
        stack = %stack.reference(),
        workload = %workload.name,
        consumed = consumed.len(),
        env = context.env.len(),
        secret_env = context.secret_env.len(),
        "Assembled workload"
    );

    Ok(Some(AssembledWorkload {
        name: workload.name.clone(),
        shape,
        context,
        consumed,
    }))
}

/// Write the workload env and the collected env into the main container.
///
/// Declared values win over collected ones; a value built from a secret
/// template field is stored as a secret.
fn apply_env(shape: &mut WorkloadShape, workload: &WorkloadDescriptor, context: &CollectedContext) -> Result<()> {
    let main = shape
        .main_container_mut()
        .ok_or_else(|| StackError::config(&workload.name, "workload declares no container"))?;

    for (name, raw) in &workload.env {
        let (value, secret) = expand(raw, context).with_context(|| format!("env '{}'", name))?;
        if secret {
            main.env.remove(name);
            main.secret_env.insert(name.clone(), value);
        } else {
            main.env.insert(name.clone(), value);
        }
    }

    for variable in &context.env {
        if !is_declared(main, &variable.name) {
            main.env.insert(variable.name.clone(), variable.value.clone());
        }
    }
    for variable in &context.secret_env {
        if !is_declared(main, &variable.name) {
            main.secret_env.insert(variable.name.clone(), variable.value.clone());
        }
    }
    Ok(())
}

fn is_declared(container: &ContainerSpec, name: &str) -> bool {
    container.env.contains_key(name) || container.secret_env.contains_key(name)
}

/// Expand `${resource:..}` / `${dependency:..}` placeholders
fn expand(raw: &str, context: &CollectedContext) -> Result<(String, bool)> {
    let mut out = String::with_capacity(raw.len());
    let mut secret = false;
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(raw) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let (kind, name, field) = (&caps[1], &caps[2], &caps[3]);
        let templates = match kind {
            "resource" => &context.resource_templates,
            _ => &context.dependency_templates,
        };
        let value = templates
            .get(name)
            .and_then(|fields| fields.get(field))
            .ok_or_else(|| {
                StackError::config(
                    name,
                    format!("unknown placeholder '{}'", whole.as_str()),
                )
            })?;
        out.push_str(&raw[last..whole.start()]);
        out.push_str(&value.value);
        secret |= value.secret;
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok((out, secret))
}
