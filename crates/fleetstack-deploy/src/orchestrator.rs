//! Stack orchestration
//!
//! A deploy validates the whole graph first, then runs every stack once its
//! parent and all of its `dependsOn` owners finished. Stacks without a
//! dependency edge between them run concurrently.
//!
//! Per stack:
//!
//! ```text
//! provision resources ─► resolve exports ─► publish ─► assemble workload
//!   (bounded)                                  │            │
//!                                              ▼            ▼
//!                                        OutputBackend   deploy workload
//!                                                           │
//!                                             post-processors ─► outputs
//! ```

use crate::assembly::{self, HandleIndex};
use crate::cancel::CancellationSignal;
use crate::context::ProvisionContext;
use crate::registry::{ProvisionParams, Registry};
use fleetstack_core::{
    Deferred, DeployedWorkload, ProvisionAction, ResourceDescriptor, ResourceHandle,
    ResourceOutput, Result, ResultExt, StackDescriptor, StackError, StackExportStore, StackGraph,
    StackReference, validate_name_part,
};
use futures_util::{future, stream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One provisioned resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub name: String,
    pub resource_type: String,
    pub derived_name: String,
    pub action: Option<ProvisionAction>,
    pub urn: Option<String>,
}

impl From<&ResourceOutput> for ResourceSummary {
    fn from(output: &ResourceOutput) -> Self {
        Self {
            name: output.resource_name.clone(),
            resource_type: output.resource_type.clone(),
            derived_name: output.derived_name.clone(),
            action: output.action,
            urn: output.handle.as_ref().map(|h| h.urn.clone()),
        }
    }
}

/// Result of a successfully deployed stack
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackOutcome {
    pub reference: StackReference,
    pub resources: Vec<ResourceSummary>,
    /// Published export keys
    pub exports: Vec<String>,
    pub workload: Option<ResourceHandle>,
}

#[derive(Debug, Clone)]
pub struct StackReport {
    pub reference: StackReference,
    pub result: std::result::Result<StackOutcome, StackError>,
}

/// Result of a deploy, one entry per stack in execution order
#[derive(Debug, Clone, Default)]
pub struct DeployReport {
    pub stacks: Vec<StackReport>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.stacks.iter().all(|s| s.result.is_ok())
    }

    pub fn succeeded(&self) -> Vec<&StackOutcome> {
        self.stacks.iter().filter_map(|s| s.result.as_ref().ok()).collect()
    }

    pub fn failures(&self) -> Vec<(&StackReference, &StackError)> {
        self.stacks
            .iter()
            .filter_map(|s| s.result.as_ref().err().map(|e| (&s.reference, e)))
            .collect()
    }

    pub fn get(&self, reference: &StackReference) -> Option<&StackReport> {
        self.stacks.iter().find(|s| &s.reference == reference)
    }
}

/// Deploys stack graphs
#[derive(Clone)]
pub struct Deployer {
    registry: Arc<Registry>,
    ctx: ProvisionContext,
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("registry", &self.registry)
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl Deployer {
    pub fn new(registry: Registry, ctx: ProvisionContext) -> Self {
        Self {
            registry: Arc::new(registry),
            ctx,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn context(&self) -> &ProvisionContext {
        &self.ctx
    }

    /// Signal aborting this deployer's runs
    pub fn cancel_signal(&self) -> CancellationSignal {
        self.ctx.cancel.clone()
    }

    /// Check the graph without touching the engine.
    ///
    /// Returns the stacks in execution order.
    pub fn validate<'a>(&self, graph: &'a StackGraph) -> Result<Vec<&'a StackDescriptor>> {
        let order = graph.execution_order()?;
        let no_handles = HandleIndex::new();

        for stack in &order {
            let check = || -> Result<()> {
                graph.ancestors(stack)?;
                validate_name_part(&stack.name)?;

                let mut names = BTreeSet::new();
                for resource in &stack.resources {
                    validate_name_part(&resource.name)?;
                    if !names.insert(resource.name.as_str()) {
                        return Err(StackError::config(&resource.name, "resource declared more than once"));
                    }
                    self.registry
                        .provisioner(&resource.resource_type)
                        .and_then(|p| p.validate(resource))
                        .with_context(|| resource.label())?;
                }

                let mut relations = BTreeSet::new();
                for dep in &stack.depends_on_resources {
                    validate_name_part(&dep.name)?;
                    if !relations.insert(dep.name.as_str()) {
                        return Err(StackError::config(&dep.name, "dependsOn relation declared more than once"));
                    }
                }

                for consumed in assembly::consumed_resources(graph, stack, &no_handles)? {
                    self.registry
                        .processor(&consumed.descriptor.resource_type)
                        .with_context(|| consumed.label())?;
                }
                Ok(())
            };
            check().with_context(|| stack.label())?;
        }
        Ok(order)
    }

    /// Deploy every stack of the graph.
    ///
    /// Validation errors fail the call before any engine request. Failures
    /// of individual stacks are reported per stack; a failed stack fails its
    /// descendants.
    pub async fn deploy(&self, graph: &StackGraph) -> Result<DeployReport> {
        let order = self.validate(graph)?;
        info!(stacks = order.len(), engine = self.ctx.engine.name(), "Starting deploy");

        let shared_graph = Arc::new(graph.clone());
        let handles: Arc<RwLock<HandleIndex>> = Arc::default();
        let mut runs: HashMap<StackReference, Deferred<StackOutcome>> = HashMap::new();
        let mut sequence = Vec::with_capacity(order.len());

        for stack in order {
            let reference = stack.reference();
            let prerequisites: Vec<(StackReference, Deferred<StackOutcome>)> = graph
                .prerequisites(stack)
                .into_iter()
                .filter_map(|r| runs.get(&r).map(|run| (r, run.clone())))
                .collect();

            let deployer = self.clone();
            let graph = shared_graph.clone();
            let handles = handles.clone();
            let stack = stack.clone();
            let run = Deferred::new(async move {
                for (prerequisite, run) in prerequisites {
                    if let Err(e) = run.resolve().await {
                        if e.is_cancelled() {
                            return Err(e);
                        }
                        return Err(e.context(format!("prerequisite {} failed", prerequisite)));
                    }
                }
                deployer
                    .deploy_stack(&graph, &stack, &handles)
                    .await
                    .with_context(|| stack.label())
            });

            runs.insert(reference.clone(), run.clone());
            sequence.push((reference, run));
        }

        let results = future::join_all(sequence.iter().map(|(_, run)| run.resolve())).await;
        let report = DeployReport {
            stacks: sequence
                .into_iter()
                .zip(results)
                .map(|((reference, _), result)| StackReport { reference, result })
                .collect(),
        };

        for (reference, error) in report.failures() {
            warn!(stack = %reference, error = %error, "Stack failed");
        }
        info!(
            succeeded = report.succeeded().len(),
            failed = report.failures().len(),
            "Deploy finished"
        );
        Ok(report)
    }

    /// Deploy one stack within its deadline
    async fn deploy_stack(
        &self,
        graph: &StackGraph,
        stack: &StackDescriptor,
        handles: &RwLock<HandleIndex>,
    ) -> Result<StackOutcome> {
        let deadline = self.ctx.settings.deploy_timeout();
        let run = self.ctx.cancel.guard(self.run_stack(graph, stack, handles));
        match tokio::time::timeout(deadline, run).await {
            Ok(result) => result,
            Err(_) => Err(StackError::Timeout(format!(
                "deploy did not finish within {}s",
                deadline.as_secs()
            ))),
        }
    }

    async fn run_stack(
        &self,
        graph: &StackGraph,
        stack: &StackDescriptor,
        handles: &RwLock<HandleIndex>,
    ) -> Result<StackOutcome> {
        let reference = stack.reference();
        info!(stack = %reference, resources = stack.resources.len(), "Deploying stack");

        let limit = self.ctx.settings.max_concurrent_resources.max(1);
        let provisions: Vec<_> = stack
            .resources
            .iter()
            .map(|resource| self.provision_resource(stack, resource))
            .collect();
        let outputs: Vec<ResourceOutput> = stream::iter(provisions)
        .buffered(limit)
        .try_collect()
        .await?;

        // Nothing reaches the backend unless every value resolved
        let store = StackExportStore::new(reference.clone());
        for output in &outputs {
            store
                .export_resource(output)
                .with_context(|| format!("resource '{}'", output.resource_name))?;
        }
        store.resolve().await?;
        if self.ctx.cancel.is_cancelled() {
            return Err(StackError::Cancelled);
        }
        let published = store.commit(self.ctx.backend.as_ref()).await?;

        {
            let mut index = handles.write();
            for output in &outputs {
                if let Some(handle) = &output.handle {
                    index.insert((reference.clone(), output.resource_name.clone()), handle.clone());
                }
            }
        }

        let snapshot = handles.read().clone();
        let workload = match assembly::assemble(&self.ctx, &self.registry, graph, stack, &snapshot).await? {
            Some(mut assembled) => {
                let handle = self
                    .ctx
                    .engine
                    .deploy_workload(&reference, &assembled.name, &assembled.shape, &assembled.context.dependencies)
                    .await
                    .map_err(StackError::from)
                    .with_context(|| format!("workload '{}'", assembled.name))?;
                debug!(stack = %reference, urn = %handle.urn, "Workload deployed");

                let deployed = DeployedWorkload {
                    stack: reference.clone(),
                    handle: handle.clone(),
                    shape: assembled.shape.clone(),
                };
                assembled.context.run_post_processors(&deployed).await?;
                assembled.context.await_outputs().await?;
                Some(handle)
            }
            None => None,
        };

        info!(stack = %reference, exports = published.len(), "Stack deployed");
        Ok(StackOutcome {
            reference,
            resources: outputs.iter().map(ResourceSummary::from).collect(),
            exports: published.into_iter().map(|e| e.key).collect(),
            workload,
        })
    }

    async fn provision_resource(
        &self,
        stack: &StackDescriptor,
        resource: &ResourceDescriptor,
    ) -> Result<ResourceOutput> {
        let provisioner = self.registry.provisioner(&resource.resource_type)?;
        let params = ProvisionParams {
            derived_name: stack.resource_name(&resource.name),
        };
        debug!(
            resource = %resource.name,
            derived_name = %params.derived_name,
            adopt = resource.adopt(),
            "Provisioning resource"
        );
        provisioner
            .provision(&self.ctx, stack, resource, &params)
            .await
            .with_context(|| resource.label())
    }
}
