//! Compute context collector
//!
//! While a workload is assembled, every consumed resource's compute processor
//! contributes environment variables, dependencies, template extensions and
//! workload hooks to one shared collector.
//!
//! Writes are first-write-wins. "First" is decided by an [`OrderKey`]: the
//! declared position (slot) of the contributing resource, then the call
//! sequence. Processors may run concurrently and finish in any order; the
//! collected result is the same as running them one by one in declared order.

use crate::deferred::Deferred;
use crate::error::{Result, StackError};
use crate::model::{ResourceHandle, ShapeKind, StackReference, WorkloadShape};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Position of a collector write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub slot: u32,
    pub seq: u64,
}

/// An environment variable contributed by a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
    pub resource_type: String,
    pub resource_name: String,
    pub owner_stack: String,
    pub secret: bool,
}

/// Field exposed to `${resource:..}` / `${dependency:..}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValue {
    pub value: String,
    pub secret: bool,
}

impl TemplateValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: true,
        }
    }
}

pub type TemplateFields = BTreeMap<String, TemplateValue>;

/// The deployed main workload, handed to post-processors
#[derive(Debug, Clone)]
pub struct DeployedWorkload {
    pub stack: StackReference,
    pub handle: ResourceHandle,
    pub shape: WorkloadShape,
}

pub type PreProcessorFn = Box<dyn FnOnce(&mut WorkloadShape) -> Result<()> + Send>;
pub type PostProcessorFn =
    Box<dyn FnOnce(DeployedWorkload) -> BoxFuture<'static, Result<()>> + Send>;

/// A registered pre- or post-processor
pub struct Hook<F> {
    pub order: OrderKey,
    pub shape: ShapeKind,
    pub label: String,
    run: F,
}

impl<F> fmt::Debug for Hook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("order", &self.order)
            .field("shape", &self.shape)
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Default)]
struct CollectorState {
    next_seq: u64,
    env: HashMap<String, (OrderKey, EnvVariable)>,
    dependencies: BTreeMap<ResourceHandle, OrderKey>,
    pre_processors: Vec<Hook<PreProcessorFn>>,
    post_processors: Vec<Hook<PostProcessorFn>>,
    resource_templates: BTreeMap<String, BTreeMap<String, (OrderKey, TemplateValue)>>,
    dependency_templates: BTreeMap<String, BTreeMap<String, (OrderKey, TemplateValue)>>,
    outputs: Vec<(OrderKey, Deferred<()>)>,
    finished: bool,
}

impl CollectorState {
    fn next_order(&mut self, slot: u32) -> OrderKey {
        let order = OrderKey {
            slot,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        order
    }
}

/// Accumulates the compute context of one workload assembly pass.
///
/// Cloning is cheap; every clone writes into the same context.
#[derive(Clone)]
pub struct ComputeContextCollector {
    state: Arc<Mutex<CollectorState>>,
    slot: u32,
}

impl Default for ComputeContextCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ComputeContextCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ComputeContextCollector")
            .field("slot", &self.slot)
            .field("env", &state.env.len())
            .field("dependencies", &state.dependencies.len())
            .field("pre_processors", &state.pre_processors.len())
            .field("post_processors", &state.post_processors.len())
            .finish()
    }
}

impl ComputeContextCollector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectorState::default())),
            slot: 0,
        }
    }

    /// Handle writing on behalf of the resource declared at position `slot`
    pub fn for_slot(&self, slot: u32) -> Self {
        Self {
            state: self.state.clone(),
            slot,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    // A write arriving after `finish` has nowhere to go
    fn begin_write(&self, what: &str) -> Option<(MutexGuard<'_, CollectorState>, OrderKey)> {
        let mut state = self.state.lock();
        if state.finished {
            tracing::warn!(slot = self.slot, write = what, "Ignoring write to a finished compute context");
            return None;
        }
        let order = state.next_order(self.slot);
        Some((state, order))
    }

    pub fn add_env_variable_if_not_exist(
        &self,
        name: &str,
        value: &str,
        resource_type: &str,
        resource_name: &str,
        owner_stack: &str,
    ) {
        self.add_env(EnvVariable {
            name: name.to_string(),
            value: value.to_string(),
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
            owner_stack: owner_stack.to_string(),
            secret: false,
        });
    }

    pub fn add_secret_env_variable_if_not_exist(
        &self,
        name: &str,
        value: &str,
        resource_type: &str,
        resource_name: &str,
        owner_stack: &str,
    ) {
        self.add_env(EnvVariable {
            name: name.to_string(),
            value: value.to_string(),
            resource_type: resource_type.to_string(),
            resource_name: resource_name.to_string(),
            owner_stack: owner_stack.to_string(),
            secret: true,
        });
    }

    // Plain and secret variables share one namespace, so a name claimed by a
    // secret can never be shadowed by a plain value and vice versa.
    fn add_env(&self, variable: EnvVariable) {
        let Some((mut state, order)) = self.begin_write("env variable") else {
            return;
        };
        if let Some((existing, current)) = state.env.get(&variable.name) {
            if *existing < order {
                tracing::trace!(
                    name = %variable.name,
                    kept_from = %current.resource_name,
                    skipped_from = %variable.resource_name,
                    "Env variable already set"
                );
                return;
            }
        }
        state.env.insert(variable.name.clone(), (order, variable));
    }

    pub fn add_dependency(&self, handle: ResourceHandle) {
        let Some((mut state, order)) = self.begin_write("dependency") else {
            return;
        };
        state.dependencies.entry(handle).or_insert(order);
    }

    /// Register a hook mutating the workload before it is deployed
    pub fn add_pre_processor<F>(&self, shape: ShapeKind, label: impl Into<String>, f: F)
    where
        F: FnOnce(&mut WorkloadShape) -> Result<()> + Send + 'static,
    {
        let Some((mut state, order)) = self.begin_write("pre-processor") else {
            return;
        };
        state.pre_processors.push(Hook {
            order,
            shape,
            label: label.into(),
            run: Box::new(f),
        });
    }

    /// Register a hook run once the workload exists
    pub fn add_post_processor<F>(&self, shape: ShapeKind, label: impl Into<String>, f: F)
    where
        F: FnOnce(DeployedWorkload) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let Some((mut state, order)) = self.begin_write("post-processor") else {
            return;
        };
        state.post_processors.push(Hook {
            order,
            shape,
            label: label.into(),
            run: Box::new(f),
        });
    }

    pub fn add_resource_tpl_extension(&self, resource_name: &str, fields: TemplateFields) {
        let Some((mut state, order)) = self.begin_write("resource template") else {
            return;
        };
        let entry = state
            .resource_templates
            .entry(resource_name.to_string())
            .or_default();
        merge_fields(entry, fields, order);
    }

    pub fn add_dependency_tpl_extension(&self, relation_name: &str, fields: TemplateFields) {
        let Some((mut state, order)) = self.begin_write("dependency template") else {
            return;
        };
        let entry = state
            .dependency_templates
            .entry(relation_name.to_string())
            .or_default();
        merge_fields(entry, fields, order);
    }

    /// Track a value the stack must wait for before it counts as deployed
    pub fn add_output<T>(&self, value: &Deferred<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let Some((mut state, order)) = self.begin_write("output") else {
            return;
        };
        state.outputs.push((order, value.map(|_| ())));
    }

    /// Current value of a variable, plain or secret
    pub fn env_value(&self, name: &str) -> Option<String> {
        self.state.lock().env.get(name).map(|(_, v)| v.value.clone())
    }

    /// Plain variables in order of contribution
    pub fn env_variables(&self) -> Vec<EnvVariable> {
        ordered_env(&self.state.lock().env, false)
    }

    /// Secret variables in order of contribution
    pub fn secret_env_variables(&self) -> Vec<EnvVariable> {
        ordered_env(&self.state.lock().env, true)
    }

    pub fn dependencies(&self) -> Vec<ResourceHandle> {
        ordered_dependencies(&self.state.lock().dependencies)
    }

    /// Take everything collected so far. A context is consumed exactly once.
    pub fn finish(&self) -> Result<CollectedContext> {
        let mut state = self.state.lock();
        if state.finished {
            return Err(StackError::config(
                "compute context",
                "collector was already consumed",
            ));
        }
        state.finished = true;
        let taken = std::mem::take(&mut *state);
        state.finished = true;
        state.next_seq = taken.next_seq;
        drop(state);

        let mut pre_processors = taken.pre_processors;
        pre_processors.sort_by_key(|h| h.order);
        let mut post_processors = taken.post_processors;
        post_processors.sort_by_key(|h| h.order);
        let mut outputs = taken.outputs;
        outputs.sort_by_key(|(order, _)| *order);

        Ok(CollectedContext {
            env: ordered_env(&taken.env, false),
            secret_env: ordered_env(&taken.env, true),
            dependencies: ordered_dependencies(&taken.dependencies),
            resource_templates: flatten_templates(taken.resource_templates),
            dependency_templates: flatten_templates(taken.dependency_templates),
            pre_processors,
            post_processors,
            outputs: outputs.into_iter().map(|(_, o)| o).collect(),
        })
    }
}

fn merge_fields(
    entry: &mut BTreeMap<String, (OrderKey, TemplateValue)>,
    fields: TemplateFields,
    order: OrderKey,
) {
    for (field, value) in fields {
        match entry.get(&field) {
            Some((existing, _)) if *existing < order => {}
            _ => {
                entry.insert(field, (order, value));
            }
        }
    }
}

fn ordered_env(env: &HashMap<String, (OrderKey, EnvVariable)>, secret: bool) -> Vec<EnvVariable> {
    let mut vars: Vec<&(OrderKey, EnvVariable)> =
        env.values().filter(|(_, v)| v.secret == secret).collect();
    vars.sort_by_key(|(order, _)| *order);
    vars.into_iter().map(|(_, v)| v.clone()).collect()
}

fn ordered_dependencies(deps: &BTreeMap<ResourceHandle, OrderKey>) -> Vec<ResourceHandle> {
    let mut handles: Vec<(&ResourceHandle, &OrderKey)> = deps.iter().collect();
    handles.sort_by_key(|(_, order)| **order);
    handles.into_iter().map(|(h, _)| h.clone()).collect()
}

fn flatten_templates(
    templates: BTreeMap<String, BTreeMap<String, (OrderKey, TemplateValue)>>,
) -> BTreeMap<String, TemplateFields> {
    templates
        .into_iter()
        .map(|(name, fields)| {
            let fields = fields.into_iter().map(|(k, (_, v))| (k, v)).collect();
            (name, fields)
        })
        .collect()
}

/// Everything a collector gathered, ready to be applied to a workload
pub struct CollectedContext {
    pub env: Vec<EnvVariable>,
    pub secret_env: Vec<EnvVariable>,
    pub dependencies: Vec<ResourceHandle>,
    pub resource_templates: BTreeMap<String, TemplateFields>,
    pub dependency_templates: BTreeMap<String, TemplateFields>,
    pre_processors: Vec<Hook<PreProcessorFn>>,
    post_processors: Vec<Hook<PostProcessorFn>>,
    outputs: Vec<Deferred<()>>,
}

impl fmt::Debug for CollectedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectedContext")
            .field("env", &self.env.len())
            .field("secret_env", &self.secret_env.len())
            .field("dependencies", &self.dependencies)
            .field("pre_processors", &self.pre_processors)
            .field("post_processors", &self.post_processors)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

impl CollectedContext {
    pub fn pre_processor_labels(&self) -> Vec<&str> {
        self.pre_processors.iter().map(|h| h.label.as_str()).collect()
    }

    pub fn post_processor_labels(&self) -> Vec<&str> {
        self.post_processors.iter().map(|h| h.label.as_str()).collect()
    }

    /// Run pre-processors in registration order.
    ///
    /// A hook written for another shape kind is a programming error and
    /// stops the run before the hook is invoked.
    pub fn apply_pre_processors(&mut self, shape: &mut WorkloadShape) -> Result<()> {
        for hook in std::mem::take(&mut self.pre_processors) {
            shape
                .expect_kind(hook.shape)
                .map_err(|e| e.context(format!("pre-processor '{}'", hook.label)))?;
            tracing::debug!(hook = %hook.label, "Running pre-processor");
            (hook.run)(shape).map_err(|e| e.context(format!("pre-processor '{}'", hook.label)))?;
        }
        Ok(())
    }

    /// Run post-processors one after another in registration order
    pub async fn run_post_processors(&mut self, deployed: &DeployedWorkload) -> Result<()> {
        for hook in std::mem::take(&mut self.post_processors) {
            deployed
                .shape
                .expect_kind(hook.shape)
                .map_err(|e| e.context(format!("post-processor '{}'", hook.label)))?;
            tracing::debug!(hook = %hook.label, "Running post-processor");
            (hook.run)(deployed.clone())
                .await
                .map_err(|e| e.context(format!("post-processor '{}'", hook.label)))?;
        }
        Ok(())
    }

    /// Wait for every registered output
    pub async fn await_outputs(&mut self) -> Result<()> {
        let outputs = std::mem::take(&mut self.outputs);
        futures_util::future::try_join_all(outputs.iter().map(|o| o.resolve())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerSpec, VolumeSource, VolumeSpec};
    use futures_util::FutureExt;

    fn add_plain(c: &ComputeContextCollector, name: &str, value: &str, resource: &str) {
        c.add_env_variable_if_not_exist(name, value, "gcp-redis", resource, "base");
    }

    #[test]
    fn test_first_write_wins() {
        let collector = ComputeContextCollector::new();
        add_plain(&collector, "REDIS_HOST", "10.0.0.1", "cache");
        add_plain(&collector, "REDIS_HOST", "10.0.0.2", "sessions");

        assert_eq!(collector.env_value("REDIS_HOST").unwrap(), "10.0.0.1");
        assert_eq!(collector.env_variables().len(), 1);
        assert_eq!(collector.env_variables()[0].resource_name, "cache");
    }

    #[test]
    fn test_earlier_slot_wins_even_when_written_later() {
        let collector = ComputeContextCollector::new();
        add_plain(&collector.for_slot(1), "HOST", "late-declared", "b");
        add_plain(&collector.for_slot(0), "HOST", "first-declared", "a");

        assert_eq!(collector.env_value("HOST").unwrap(), "first-declared");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_are_deterministic() {
        for _ in 0..20 {
            let collector = ComputeContextCollector::new();
            let mut tasks = Vec::new();
            for slot in (0..8u32).rev() {
                let handle = collector.for_slot(slot);
                tasks.push(tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    handle.add_env_variable_if_not_exist(
                        "HOST",
                        &format!("value-{}", slot),
                        "gcp-redis",
                        &format!("r{}", slot),
                        "base",
                    );
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(collector.env_value("HOST").unwrap(), "value-0");
        }
    }

    #[test]
    fn test_secret_and_plain_share_namespace() {
        let collector = ComputeContextCollector::new();
        collector.add_secret_env_variable_if_not_exist(
            "PGPASSWORD",
            "s3cret",
            "gcp-cloudsql-postgres",
            "db",
            "base",
        );
        add_plain(&collector, "PGPASSWORD", "oops", "cache");

        assert!(collector.env_variables().is_empty());
        let secrets = collector.secret_env_variables();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].value, "s3cret");
    }

    #[test]
    fn test_dependencies_are_a_set() {
        let collector = ComputeContextCollector::new();
        let handle = ResourceHandle::new("urn:gcp-redis:cache", "gcp-redis");
        collector.add_dependency(handle.clone());
        collector.add_dependency(handle.clone());
        assert_eq!(collector.dependencies(), vec![handle]);
    }

    #[test]
    fn test_template_extension_fields_first_wins() {
        let collector = ComputeContextCollector::new();
        collector.add_resource_tpl_extension(
            "cache",
            TemplateFields::from([("host".to_string(), TemplateValue::plain("10.0.0.1"))]),
        );
        collector.add_resource_tpl_extension(
            "cache",
            TemplateFields::from([
                ("host".to_string(), TemplateValue::plain("10.0.0.9")),
                ("port".to_string(), TemplateValue::plain("6379")),
            ]),
        );

        let context = collector.finish().unwrap();
        let cache = &context.resource_templates["cache"];
        assert_eq!(cache["host"].value, "10.0.0.1");
        assert_eq!(cache["port"].value, "6379");
    }

    #[test]
    fn test_pre_processors_run_in_order() {
        let collector = ComputeContextCollector::new();
        collector.for_slot(1).add_pre_processor(ShapeKind::KubernetesPod, "second", |shape| {
            shape.append_container(ContainerSpec::new("second", "img:2"));
            Ok(())
        });
        collector.for_slot(0).add_pre_processor(ShapeKind::KubernetesPod, "first", |shape| {
            shape.append_container(ContainerSpec::new("first", "img:1"));
            shape.append_volume(VolumeSpec {
                name: "creds".into(),
                source: VolumeSource::EmptyDir,
            });
            Ok(())
        });

        let mut context = collector.finish().unwrap();
        assert_eq!(context.pre_processor_labels(), vec!["first", "second"]);

        let mut shape = WorkloadShape::empty(ShapeKind::KubernetesPod);
        context.apply_pre_processors(&mut shape).unwrap();
        let names: Vec<&str> = shape.containers().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(shape.volumes().len(), 1);
    }

    #[test]
    fn test_pre_processor_shape_mismatch_fails_fast() {
        let collector = ComputeContextCollector::new();
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        collector.add_pre_processor(ShapeKind::KubernetesPod, "proxy sidecar", move |_| {
            *flag.lock() = true;
            Ok(())
        });

        let mut context = collector.finish().unwrap();
        let mut shape = WorkloadShape::empty(ShapeKind::CloudRun);
        let err = context.apply_pre_processors(&mut shape).unwrap_err();

        assert!(matches!(err.root_cause(), StackError::ShapeMismatch { .. }));
        assert!(!*called.lock());
    }

    #[tokio::test]
    async fn test_post_processors_run_sequentially() {
        let collector = ComputeContextCollector::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (slot, name) in [(1u32, "grant-b"), (0, "grant-a")] {
            let log = log.clone();
            collector
                .for_slot(slot)
                .add_post_processor(ShapeKind::KubernetesPod, name, move |deployed| {
                    async move {
                        log.lock().push(format!("{}@{}", name, deployed.handle.urn));
                        Ok(())
                    }
                    .boxed()
                });
        }

        let mut context = collector.finish().unwrap();
        let deployed = DeployedWorkload {
            stack: StackReference::new("api", "prod"),
            handle: ResourceHandle::new("urn:workload:api", "workload"),
            shape: WorkloadShape::empty(ShapeKind::KubernetesPod),
        };
        context.run_post_processors(&deployed).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["grant-a@urn:workload:api", "grant-b@urn:workload:api"]
        );
    }

    #[tokio::test]
    async fn test_outputs_are_awaited() {
        let collector = ComputeContextCollector::new();
        collector.add_output(&Deferred::ready("done".to_string()));
        collector.add_output::<u32>(&Deferred::failed(StackError::InitJobFailed {
            job: "grant".into(),
            message: "exit 1".into(),
        }));

        let mut context = collector.finish().unwrap();
        let err = context.await_outputs().await.unwrap_err();
        assert!(matches!(err, StackError::InitJobFailed { .. }));
    }

    #[test]
    fn test_finish_consumes_once() {
        let collector = ComputeContextCollector::new();
        let clone = collector.for_slot(3);
        collector.finish().unwrap();
        assert!(clone.finish().is_err());
    }

    #[test]
    fn test_writes_after_finish_are_dropped() {
        let collector = ComputeContextCollector::new();
        collector.add_env_variable_if_not_exist("REDIS_HOST", "10.0.0.1", "gcp-redis", "cache", "base");
        let context = collector.finish().unwrap();

        let late = collector.for_slot(1);
        late.add_env_variable_if_not_exist("REDIS_PORT", "6379", "gcp-redis", "cache", "base");
        late.add_dependency(ResourceHandle::new("urn:gcp-redis:late", "gcp-redis"));
        late.add_pre_processor(ShapeKind::KubernetesPod, "late", |_| Ok(()));

        assert_eq!(context.env.len(), 1);
        assert_eq!(collector.env_value("REDIS_PORT"), None);
        assert!(collector.dependencies().is_empty());
        assert!(format!("{:?}", collector).contains("pre_processors: 0"));
    }
}
