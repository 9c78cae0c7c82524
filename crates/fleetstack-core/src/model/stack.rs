//! Stack descriptors and the stack graph

use super::resource::ResourceDescriptor;
use super::workload::WorkloadDescriptor;
use crate::error::{Result, StackError};
use crate::naming;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Reference to one deployed instance of a stack (stack name + environment)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackReference {
    pub stack: String,
    pub env: String,
}

impl StackReference {
    pub fn new(stack: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            env: env.into(),
        }
    }
}

impl fmt::Display for StackReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stack, self.env)
    }
}

/// Parent of a stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentReference {
    /// Name of the parent stack
    pub stack: String,
    /// Environment of the parent to attach to, if different from ours
    #[serde(default)]
    pub environment: Option<String>,
}

/// A resource of another stack consumed across stacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependsOnResource {
    /// Relation name, unique within the consuming stack
    pub name: String,
    /// Stack owning the resource
    pub owner: String,
    /// Resource name inside the owner stack
    pub resource: String,
    /// Environment of the owner, defaults to the consumer's naming environment
    #[serde(default)]
    pub environment: Option<String>,
}

/// Stack definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackDescriptor {
    pub name: String,
    pub environment: String,
    #[serde(default)]
    pub parent: Option<ParentReference>,
    /// Resources owned by this stack
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    /// Resources of other stacks this stack consumes
    #[serde(default)]
    pub depends_on_resources: Vec<DependsOnResource>,
    /// Workload deployed by this stack
    #[serde(default)]
    pub workload: Option<WorkloadDescriptor>,
}

impl StackDescriptor {
    pub fn new(name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, stack: impl Into<String>, environment: Option<&str>) -> Self {
        self.parent = Some(ParentReference {
            stack: stack.into(),
            environment: environment.map(String::from),
        });
        self
    }

    pub fn with_resource(mut self, resource: ResourceDescriptor) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_depends_on(mut self, depends_on: DependsOnResource) -> Self {
        self.depends_on_resources.push(depends_on);
        self
    }

    pub fn with_workload(mut self, workload: WorkloadDescriptor) -> Self {
        self.workload = Some(workload);
        self
    }

    pub fn reference(&self) -> StackReference {
        StackReference::new(&self.name, &self.environment)
    }

    /// Parent environment as declared
    pub fn parent_env(&self) -> Option<&str> {
        self.parent.as_ref().and_then(|p| p.environment.as_deref())
    }

    /// Environment this stack's names and parent lookups resolve against
    pub fn naming_env(&self) -> &str {
        naming::naming_env(&self.environment, self.parent_env())
    }

    /// Reference to the parent instance this stack attaches to
    pub fn parent_reference(&self) -> Option<StackReference> {
        self.parent
            .as_ref()
            .map(|p| StackReference::new(&p.stack, self.naming_env()))
    }

    /// Reference to the owner of a `dependsOn` relation
    pub fn depends_on_reference(&self, dep: &DependsOnResource) -> StackReference {
        let env = dep
            .environment
            .clone()
            .unwrap_or_else(|| self.naming_env().to_string());
        StackReference::new(&dep.owner, env)
    }

    /// Derived name of one of this stack's own resources
    pub fn resource_name(&self, resource: &str) -> String {
        naming::derive_name(&self.name, &self.environment, self.parent_env(), resource)
    }

    pub fn find_resource(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn label(&self) -> String {
        format!("stack '{}' [{}]", self.name, self.environment)
    }
}

/// All stacks taking part in one provisioning run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackGraph {
    pub stacks: Vec<StackDescriptor>,
}

impl StackGraph {
    pub fn new(stacks: Vec<StackDescriptor>) -> Self {
        Self { stacks }
    }

    pub fn get(&self, reference: &StackReference) -> Option<&StackDescriptor> {
        self.stacks
            .iter()
            .find(|s| s.name == reference.stack && s.environment == reference.env)
    }

    pub fn get_required(&self, reference: &StackReference) -> Result<&StackDescriptor> {
        self.get(reference)
            .ok_or_else(|| StackError::StackNotFound(reference.to_string()))
    }

    /// Ancestors of a stack, nearest first
    pub fn ancestors(&self, stack: &StackDescriptor) -> Result<Vec<&StackDescriptor>> {
        let mut chain = Vec::new();
        let mut seen = BTreeSet::from([stack.reference()]);
        let mut current = stack;
        while let Some(parent_ref) = current.parent_reference() {
            if !seen.insert(parent_ref.clone()) {
                return Err(StackError::CircularDependency(format!(
                    "parent chain of {} loops at {}",
                    stack.reference(),
                    parent_ref
                )));
            }
            let parent = self.get_required(&parent_ref)?;
            chain.push(parent);
            current = parent;
        }
        Ok(chain)
    }

    /// Stacks that must finish before `stack` can start
    pub fn prerequisites(&self, stack: &StackDescriptor) -> Vec<StackReference> {
        let mut refs = BTreeSet::new();
        if let Some(parent) = stack.parent_reference() {
            refs.insert(parent);
        }
        for dep in &stack.depends_on_resources {
            refs.insert(stack.depends_on_reference(dep));
        }
        refs.remove(&stack.reference());
        refs.into_iter().collect()
    }

    /// Stacks ordered so that every stack comes after its prerequisites.
    ///
    /// Ties keep declaration order.
    pub fn execution_order(&self) -> Result<Vec<&StackDescriptor>> {
        let mut index: HashMap<StackReference, usize> = HashMap::new();
        for (i, stack) in self.stacks.iter().enumerate() {
            if index.insert(stack.reference(), i).is_some() {
                return Err(StackError::config(
                    stack.reference().to_string(),
                    "stack declared more than once",
                ));
            }
        }

        let mut pending: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, stack) in self.stacks.iter().enumerate() {
            let mut deps = Vec::new();
            for prerequisite in self.prerequisites(stack) {
                let j = *index
                    .get(&prerequisite)
                    .ok_or_else(|| StackError::StackNotFound(prerequisite.to_string()))
                    .map_err(|e| e.context(stack.label()))?;
                deps.push(j);
            }
            pending.insert(i, deps);
        }

        let mut done = vec![false; self.stacks.len()];
        let mut order = Vec::with_capacity(self.stacks.len());
        while !pending.is_empty() {
            let ready = pending
                .iter()
                .find(|(_, deps)| deps.iter().all(|d| done[*d]))
                .map(|(i, _)| *i);
            match ready {
                Some(i) => {
                    pending.remove(&i);
                    done[i] = true;
                    order.push(&self.stacks[i]);
                }
                None => {
                    let stuck: Vec<String> = pending
                        .keys()
                        .map(|i| self.stacks[*i].reference().to_string())
                        .collect();
                    return Err(StackError::CircularDependency(stuck.join(" -> ")));
                }
            }
        }
        Ok(order)
    }

    /// Locate the owner of a resource consumed through `uses`.
    ///
    /// The stack itself is searched first, then each ancestor in turn, so a
    /// resource declared two or more levels up is still reachable.
    pub fn resolve_uses<'a>(
        &'a self,
        stack: &'a StackDescriptor,
        resource: &str,
    ) -> Result<(&'a StackDescriptor, &'a ResourceDescriptor)> {
        if let Some(found) = stack.find_resource(resource) {
            return Ok((stack, found));
        }
        for ancestor in self.ancestors(stack)? {
            if let Some(found) = ancestor.find_resource(resource) {
                return Ok((ancestor, found));
            }
        }
        Err(StackError::ResourceNotFound {
            stack: stack.reference().to_string(),
            resource: resource.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(name, "gcp-redis", serde_json::json!({"memorySizeGb": 1}))
    }

    #[test]
    fn test_parent_reference_uses_parent_env() {
        let preview = StackDescriptor::new("api", "pr-7").with_parent("base", Some("staging"));
        assert_eq!(preview.naming_env(), "staging");
        assert_eq!(
            preview.parent_reference(),
            Some(StackReference::new("base", "staging"))
        );

        let plain = StackDescriptor::new("api", "prod").with_parent("base", None);
        assert_eq!(plain.parent_reference(), Some(StackReference::new("base", "prod")));
    }

    #[test]
    fn test_resolve_uses_walks_two_levels_up() {
        let graph = StackGraph::new(vec![
            StackDescriptor::new("platform", "prod").with_resource(redis("cache")),
            StackDescriptor::new("team", "prod").with_parent("platform", None),
            StackDescriptor::new("api", "prod").with_parent("team", None),
        ]);
        let api = graph.get(&StackReference::new("api", "prod")).unwrap();

        let (owner, resource) = graph.resolve_uses(api, "cache").unwrap();
        assert_eq!(owner.name, "platform");
        assert_eq!(resource.name, "cache");

        let err = graph.resolve_uses(api, "missing").unwrap_err();
        assert!(matches!(err, StackError::ResourceNotFound { .. }));
    }

    #[test]
    fn test_execution_order_respects_prerequisites() {
        let graph = StackGraph::new(vec![
            StackDescriptor::new("api", "prod")
                .with_parent("base", None)
                .with_depends_on(DependsOnResource {
                    name: "orders".into(),
                    owner: "orders".into(),
                    resource: "db".into(),
                    environment: None,
                }),
            StackDescriptor::new("orders", "prod").with_parent("base", None),
            StackDescriptor::new("base", "prod"),
        ]);

        let order: Vec<String> = graph
            .execution_order()
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(order, vec!["base", "orders", "api"]);
    }

    #[test]
    fn test_execution_order_detects_cycles() {
        let graph = StackGraph::new(vec![
            StackDescriptor::new("a", "prod").with_parent("b", None),
            StackDescriptor::new("b", "prod").with_parent("a", None),
        ]);
        assert!(matches!(
            graph.execution_order(),
            Err(StackError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_execution_order_reports_unknown_parent() {
        let graph = StackGraph::new(vec![StackDescriptor::new("a", "prod").with_parent("ghost", None)]);
        let err = graph.execution_order().unwrap_err();
        assert!(matches!(err.root_cause(), StackError::StackNotFound(_)));
    }

    #[test]
    fn test_graph_deserializes_from_json() {
        let json = serde_json::json!({
            "stacks": [{
                "name": "api",
                "environment": "prod",
                "parent": {"stack": "base"},
                "dependsOnResources": [
                    {"name": "billing-db", "owner": "billing", "resource": "db"}
                ]
            }]
        });
        let graph: StackGraph = serde_json::from_value(json).unwrap();
        assert_eq!(graph.stacks[0].depends_on_resources[0].owner, "billing");
        assert_eq!(graph.stacks[0].parent.as_ref().unwrap().stack, "base");
    }
}
