//! Workload descriptors and workload shapes
//!
//! The concrete manifest a deployment target renders belongs to that target.
//! The core only needs a shape it can append containers and volumes to.

use crate::error::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Kind of workload shape a pre/post-processor is written against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShapeKind {
    /// Kubernetes pod template (GKE)
    #[default]
    KubernetesPod,
    /// Cloud Run service
    CloudRun,
}

impl fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeKind::KubernetesPod => write!(f, "kubernetes-pod"),
            ShapeKind::CloudRun => write!(f, "cloud-run"),
        }
    }
}

/// Mount of a volume inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub volume: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Container definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Values the deployment target must store as secrets
    #[serde(default)]
    pub secret_env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }
}

/// Where a volume's content comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum VolumeSource {
    EmptyDir,
    /// Secret volume; values are base64 encoded file contents
    Secret { data: BTreeMap<String, String> },
    /// Cloud Run's managed Cloud SQL connector volume
    CloudSql { instances: Vec<String> },
}

/// Volume definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    pub source: VolumeSource,
}

/// Pod template of a Kubernetes deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<VolumeSpec>,
}

/// Cloud Run service template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRunSpec {
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub max_instances: Option<u32>,
}

/// Mutable workload value pre-processors operate on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum WorkloadShape {
    KubernetesPod(PodSpec),
    CloudRun(CloudRunSpec),
}

impl WorkloadShape {
    pub fn empty(kind: ShapeKind) -> Self {
        match kind {
            ShapeKind::KubernetesPod => WorkloadShape::KubernetesPod(PodSpec::default()),
            ShapeKind::CloudRun => WorkloadShape::CloudRun(CloudRunSpec::default()),
        }
    }

    pub fn kind(&self) -> ShapeKind {
        match self {
            WorkloadShape::KubernetesPod(_) => ShapeKind::KubernetesPod,
            WorkloadShape::CloudRun(_) => ShapeKind::CloudRun,
        }
    }

    /// Fail unless the shape is of the expected kind
    pub fn expect_kind(&self, expected: ShapeKind) -> Result<()> {
        if self.kind() == expected {
            Ok(())
        } else {
            Err(StackError::ShapeMismatch {
                expected: expected.to_string(),
                actual: self.kind().to_string(),
            })
        }
    }

    pub fn containers(&self) -> &[ContainerSpec] {
        match self {
            WorkloadShape::KubernetesPod(pod) => &pod.containers,
            WorkloadShape::CloudRun(run) => &run.containers,
        }
    }

    pub fn containers_mut(&mut self) -> &mut Vec<ContainerSpec> {
        match self {
            WorkloadShape::KubernetesPod(pod) => &mut pod.containers,
            WorkloadShape::CloudRun(run) => &mut run.containers,
        }
    }

    pub fn volumes(&self) -> &[VolumeSpec] {
        match self {
            WorkloadShape::KubernetesPod(pod) => &pod.volumes,
            WorkloadShape::CloudRun(run) => &run.volumes,
        }
    }

    pub fn append_container(&mut self, container: ContainerSpec) {
        self.containers_mut().push(container);
    }

    pub fn append_volume(&mut self, volume: VolumeSpec) {
        match self {
            WorkloadShape::KubernetesPod(pod) => pod.volumes.push(volume),
            WorkloadShape::CloudRun(run) => run.volumes.push(volume),
        }
    }

    /// The first container, which carries the wired environment
    pub fn main_container_mut(&mut self) -> Option<&mut ContainerSpec> {
        self.containers_mut().first_mut()
    }

    pub fn find_container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers().iter().find(|c| c.name == name)
    }
}

/// Workload declared by a stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDescriptor {
    pub name: String,
    #[serde(default)]
    pub shape: ShapeKind,
    pub containers: Vec<ContainerSpec>,
    /// Extra variables for the main container; values may hold
    /// `${resource:..}` / `${dependency:..}` placeholders
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resources of this stack or its ancestors consumed directly
    #[serde(default)]
    pub uses: Vec<String>,
}

impl WorkloadDescriptor {
    pub fn new(name: impl Into<String>, shape: ShapeKind, container: ContainerSpec) -> Self {
        Self {
            name: name.into(),
            shape,
            containers: vec![container],
            env: BTreeMap::new(),
            uses: Vec::new(),
        }
    }

    pub fn with_uses(mut self, uses: &[&str]) -> Self {
        self.uses = uses.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Initial shape built from the declared containers
    pub fn to_shape(&self) -> WorkloadShape {
        let mut shape = WorkloadShape::empty(self.shape);
        for container in &self.containers {
            shape.append_container(container.clone());
        }
        shape
    }
}

/// One-shot job run to completion by the provisioning engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub name: String,
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<VolumeSpec>,
    /// Upper bound on the job's execution, independent of the stack deploy timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
