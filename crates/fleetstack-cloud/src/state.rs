//! State management for provisioned stacks
//!
//! Manages the `.fleetstack/state.json` file which records, per stack
//! instance, the resources provisioned for it and the exports it published.
//! The state manager is also the file-backed [`OutputBackend`] stacks import
//! each other's exports from.

use crate::error::{CloudError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetstack_core::{OutputBackend, ProvisionAction, ResolvedExport, StackError, StackReference};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

const STATE_VERSION: u32 = 1;
pub const DEFAULT_STATE_DIR: &str = ".fleetstack";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";

/// Global state containing all stack instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalState {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Stack instances indexed by "stack/env"
    pub stacks: BTreeMap<String, StackState>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            stacks: BTreeMap::new(),
        }
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_stack(&self, stack: &StackReference) -> Option<&StackState> {
        self.stacks.get(&stack.to_string())
    }

    /// Get or create the entry of a stack instance
    pub fn stack_mut(&mut self, stack: &StackReference) -> &mut StackState {
        self.updated_at = Utc::now();
        self.stacks
            .entry(stack.to_string())
            .or_insert_with(|| StackState::new(stack.clone()))
    }

    pub fn remove_stack(&mut self, stack: &StackReference) -> Option<StackState> {
        let result = self.stacks.remove(&stack.to_string());
        if result.is_some() {
            self.updated_at = Utc::now();
        }
        result
    }
}

/// State of one stack instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    pub stack: StackReference,

    /// Resources indexed by resource name
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,

    /// Published exports indexed by key
    #[serde(default)]
    pub exports: BTreeMap<String, ResolvedExport>,

    /// When the exports were last published
    pub published_at: Option<DateTime<Utc>>,
}

impl StackState {
    pub fn new(stack: StackReference) -> Self {
        Self {
            stack,
            resources: BTreeMap::new(),
            exports: BTreeMap::new(),
            published_at: None,
        }
    }
}

/// State of a single resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceState {
    /// Engine URN
    pub urn: String,

    /// Resource type tag
    pub resource_type: String,

    /// Derived name
    pub derived_name: String,

    /// How the resource came under management
    pub action: ProvisionAction,

    /// Current status
    pub status: ResourceStatus,

    /// When the resource was recorded
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn new(
        urn: impl Into<String>,
        resource_type: impl Into<String>,
        derived_name: impl Into<String>,
        action: ProvisionAction,
    ) -> Self {
        let now = Utc::now();
        Self {
            urn: urn.into(),
            resource_type: resource_type.into(),
            derived_name: derived_name.into(),
            action,
            status: ResourceStatus::Unknown,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }
}

/// Status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Resource is ready and exported
    Ready,
    /// Provisioning failed
    Error,
    /// Status is unknown
    Unknown,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Ready => write!(f, "ready"),
            ResourceStatus::Error => write!(f, "error"),
            ResourceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// State manager for reading/writing state files
#[derive(Debug, Clone)]
pub struct StateManager {
    /// Directory holding the state files
    state_dir: PathBuf,
    /// Serialises updates from within this process; the lock file guards
    /// against other processes
    updates: Arc<Mutex<()>>,
}

impl StateManager {
    /// State manager using `<project_root>/.fleetstack`
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self::with_state_dir(project_root.as_ref().join(DEFAULT_STATE_DIR))
    }

    pub fn with_state_dir(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
            updates: Arc::new(Mutex::new(())),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir.join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join(LOCK_FILE)
    }

    async fn ensure_state_dir(&self) -> Result<()> {
        if !self.state_dir.exists() {
            fs::create_dir_all(&self.state_dir).await?;
            tracing::debug!("Created state directory: {}", self.state_dir.display());
        }
        Ok(())
    }

    /// Load the current state
    pub async fn load(&self) -> Result<GlobalState> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found, returning empty state");
            return Ok(GlobalState::new());
        }

        let content = fs::read_to_string(&path).await?;
        let state: GlobalState = serde_json::from_str(&content)?;

        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "State file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state with {} stacks", state.stacks.len());
        Ok(state)
    }

    /// Save the state, keeping the previous file as backup
    pub async fn save(&self, state: &GlobalState) -> Result<()> {
        self.ensure_state_dir().await?;

        let path = self.state_path();
        let backup = self.backup_path();

        if path.exists() {
            fs::copy(&path, &backup).await?;
            tracing::debug!("Created state backup");
        }

        // Readers never observe a missing or half-written state file
        let staging = self.state_dir.join(format!("{}.tmp", STATE_FILE));
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&staging, content).await?;
        fs::rename(&staging, &path).await?;

        tracing::debug!("Saved state with {} stacks", state.stacks.len());
        Ok(())
    }

    /// Load, modify and save the state under the lock
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut GlobalState) -> Result<()>,
    {
        let _guard = self.updates.lock().await;
        let lock = self.acquire_lock().await?;
        let result = async {
            let mut state = self.load().await?;
            f(&mut state)?;
            self.save(&state).await
        }
        .await;
        lock.release().await?;
        result
    }

    /// Record the resources provisioned for a stack instance
    pub async fn record_resources(
        &self,
        stack: &StackReference,
        resources: Vec<(String, ResourceState)>,
    ) -> Result<()> {
        self.update(|state| {
            let entry = state.stack_mut(stack);
            for (name, resource) in resources {
                entry.resources.insert(name, resource);
            }
            Ok(())
        })
        .await
    }

    /// Acquire a lock for exclusive access
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        self.ensure_state_dir().await?;

        let lock_path = self.lock_path();

        if lock_path.exists() {
            let content = fs::read_to_string(&lock_path).await?;
            let lock_info: LockInfo = serde_json::from_str(&content)?;

            // Locks older than an hour are considered stale
            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < 1 {
                return Err(CloudError::LockError(format!(
                    "State is locked by {} since {}",
                    lock_info.holder, lock_info.acquired_at
                )));
            }

            tracing::warn!("Removing stale lock from {}", lock_info.holder);
        }

        let lock_info = LockInfo {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        };

        let content = serde_json::to_string_pretty(&lock_info)?;
        fs::write(&lock_path, content).await?;

        tracing::debug!("Acquired state lock");
        Ok(StateLock {
            lock_path,
            released: false,
        })
    }
}

#[async_trait]
impl OutputBackend for StateManager {
    fn name(&self) -> &str {
        "state-file"
    }

    async fn get_output(
        &self,
        stack: &StackReference,
        key: &str,
    ) -> fleetstack_core::Result<Option<ResolvedExport>> {
        let state = self.load().await.map_err(StackError::from)?;
        Ok(state
            .get_stack(stack)
            .and_then(|s| s.exports.get(key))
            .cloned())
    }

    async fn publish(
        &self,
        stack: &StackReference,
        exports: Vec<ResolvedExport>,
    ) -> fleetstack_core::Result<()> {
        let mut map = BTreeMap::new();
        for export in exports {
            if map.contains_key(&export.key) {
                return Err(StackError::ExportAlreadyWritten {
                    stack: stack.to_string(),
                    key: export.key,
                });
            }
            map.insert(export.key.clone(), export);
        }

        self.update(|state| {
            let entry = state.stack_mut(stack);
            entry.exports = map;
            entry.published_at = Some(Utc::now());
            Ok(())
        })
        .await
        .map_err(StackError::from)
    }

    async fn list_outputs(&self, stack: &StackReference) -> fleetstack_core::Result<Vec<ResolvedExport>> {
        let state = self.load().await.map_err(StackError::from)?;
        Ok(state
            .get_stack(stack)
            .map(|s| s.exports.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Lock information
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for state lock
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released state lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released && self.lock_path.exists() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
