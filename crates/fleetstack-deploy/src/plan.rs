//! Deploy planning
//!
//! A plan lists what a deploy would do without asking the engine anything.

use crate::assembly::{self, HandleIndex};
use crate::orchestrator::Deployer;
use fleetstack_core::{ProvisionAction, Result, StackGraph, StackReference};
use serde::Serialize;

/// One resource a stack would provision
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedResource {
    pub name: String,
    pub resource_type: String,
    pub derived_name: String,
    pub action: ProvisionAction,
    pub export_keys: Vec<String>,
}

/// One resource the stack's workload would be wired with
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedConsumer {
    /// Template key (`uses` resource name or `dependsOn` relation name)
    pub key: String,
    pub owner: StackReference,
    pub resource_type: String,
    pub derived_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackPlan {
    pub reference: StackReference,
    pub parent: Option<StackReference>,
    pub resources: Vec<PlannedResource>,
    pub consumes: Vec<PlannedConsumer>,
    pub workload: Option<String>,
}

/// Plan of a whole graph, stacks in execution order
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployPlan {
    pub stacks: Vec<StackPlan>,
}

impl DeployPlan {
    pub fn resources_by_action(&self, action: ProvisionAction) -> Vec<&PlannedResource> {
        self.stacks
            .iter()
            .flat_map(|s| s.resources.iter())
            .filter(|r| r.action == action)
            .collect()
    }

    pub fn get(&self, reference: &StackReference) -> Option<&StackPlan> {
        self.stacks.iter().find(|s| &s.reference == reference)
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            stacks: self.stacks.len(),
            create: self.resources_by_action(ProvisionAction::Create).len(),
            adopt: self.resources_by_action(ProvisionAction::Adopt).len(),
            exports: self
                .stacks
                .iter()
                .flat_map(|s| s.resources.iter())
                .map(|r| r.export_keys.len())
                .sum(),
            wirings: self.stacks.iter().map(|s| s.consumes.len()).sum(),
        }
    }
}

/// Summary of planned work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub stacks: usize,
    pub create: usize,
    pub adopt: usize,
    pub exports: usize,
    pub wirings: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} stacks: {} to create, {} to adopt, {} exports, {} consumer wirings",
            self.stacks, self.create, self.adopt, self.exports, self.wirings
        )
    }
}

impl Deployer {
    /// Plan a deploy of the graph.
    ///
    /// Runs the same validation as [`Deployer::deploy`] and makes no engine call.
    pub fn plan(&self, graph: &StackGraph) -> Result<DeployPlan> {
        let order = self.validate(graph)?;
        let no_handles = HandleIndex::new();
        let mut stacks = Vec::with_capacity(order.len());

        for stack in order {
            let mut resources = Vec::with_capacity(stack.resources.len());
            for resource in &stack.resources {
                let provisioner = self.registry().provisioner(&resource.resource_type)?;
                let derived_name = stack.resource_name(&resource.name);
                resources.push(PlannedResource {
                    name: resource.name.clone(),
                    resource_type: resource.resource_type.clone(),
                    export_keys: provisioner.export_keys(&derived_name),
                    derived_name,
                    action: if resource.adopt() {
                        ProvisionAction::Adopt
                    } else {
                        ProvisionAction::Create
                    },
                });
            }

            let consumes = assembly::consumed_resources(graph, stack, &no_handles)?
                .into_iter()
                .map(|c| PlannedConsumer {
                    key: c.template_key().to_string(),
                    resource_type: c.descriptor.resource_type.clone(),
                    owner: c.owner,
                    derived_name: c.derived_name,
                })
                .collect();

            stacks.push(StackPlan {
                reference: stack.reference(),
                parent: stack.parent_reference(),
                resources,
                consumes,
                workload: stack.workload.as_ref().map(|w| w.name.clone()),
            });
        }

        Ok(DeployPlan { stacks })
    }
}

impl std::fmt::Display for DeployPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for stack in &self.stacks {
            match &stack.parent {
                Some(parent) => writeln!(f, "{} (parent {})", stack.reference, parent)?,
                None => writeln!(f, "{}", stack.reference)?,
            }
            for resource in &stack.resources {
                writeln!(
                    f,
                    "  {} {} [{}] as {}",
                    resource.action, resource.name, resource.resource_type, resource.derived_name
                )?;
                for key in &resource.export_keys {
                    writeln!(f, "      export {}", key)?;
                }
            }
            if let Some(workload) = &stack.workload {
                writeln!(f, "  workload {}", workload)?;
                for consumer in &stack.consumes {
                    writeln!(
                        f,
                        "      wires {} [{}] from {}",
                        consumer.key, consumer.resource_type, consumer.owner
                    )?;
                }
            }
        }
        write!(f, "{}", self.summary())
    }
}
