//! Stack export store
//!
//! Resources publish their connection data (hosts, ports, credentials) as
//! exports of the stack that owns them. During a deploy exports are staged in
//! a [`StackExportStore`]; they reach the [`OutputBackend`] only after every
//! value resolved, so an aborted deploy never leaves half-written exports.

use crate::deferred::Deferred;
use crate::error::{Result, StackError};
use crate::model::{ResourceExport, ResourceOutput, StackReference};
use async_trait::async_trait;
use futures_util::future;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// An export whose value is known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedExport {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

impl ResolvedExport {
    pub fn new(key: impl Into<String>, value: impl Into<String>, secret: bool) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            secret,
        }
    }
}

/// Persistent store of published stack exports.
///
/// Implemented by the provisioning engine's state store.
#[async_trait]
pub trait OutputBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Read one export of a stack instance
    async fn get_output(&self, stack: &StackReference, key: &str) -> Result<Option<ResolvedExport>>;

    /// Replace the exports of a stack instance with the result of a deploy
    async fn publish(&self, stack: &StackReference, exports: Vec<ResolvedExport>) -> Result<()>;

    /// All exports of a stack instance, ordered by key
    async fn list_outputs(&self, stack: &StackReference) -> Result<Vec<ResolvedExport>>;
}

/// Read an export of another stack.
///
/// Absent and blank values are hard errors: a declared consumer that cannot
/// resolve its producer's value is a deploy-time bug. Reading a secret export
/// with `secret = false` is refused so secrets never end up in plain values.
pub async fn import(
    backend: &dyn OutputBackend,
    owner: &StackReference,
    key: &str,
    secret: bool,
) -> Result<String> {
    let export = backend
        .get_output(owner, key)
        .await?
        .ok_or_else(|| StackError::ExportNotFound {
            stack: owner.to_string(),
            key: key.to_string(),
        })?;

    if export.value.trim().is_empty() {
        return Err(StackError::ExportEmpty {
            stack: owner.to_string(),
            key: key.to_string(),
        });
    }

    if export.secret && !secret {
        return Err(StackError::SecretExposure {
            stack: owner.to_string(),
            key: key.to_string(),
        });
    }

    tracing::debug!(stack = %owner, key = %key, secret, "Imported export");
    Ok(export.value)
}

/// Exports staged by one stack during a deploy
#[derive(Debug)]
pub struct StackExportStore {
    stack: StackReference,
    entries: Mutex<Vec<ResourceExport>>,
}

impl StackExportStore {
    pub fn new(stack: StackReference) -> Self {
        Self {
            stack,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn stack(&self) -> &StackReference {
        &self.stack
    }

    /// Stage one export; every key can be written once
    pub fn export(&self, key: impl Into<String>, value: Deferred<String>, secret: bool) -> Result<()> {
        let key = key.into();
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.key == key) {
            return Err(StackError::ExportAlreadyWritten {
                stack: self.stack.to_string(),
                key,
            });
        }
        entries.push(ResourceExport { key, value, secret });
        Ok(())
    }

    /// Stage all exports of a provisioned resource, or none of them
    pub fn export_resource(&self, output: &ResourceOutput) -> Result<()> {
        let mut entries = self.entries.lock();
        let mut seen: BTreeSet<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        for export in &output.exports {
            if !seen.insert(export.key.as_str()) {
                return Err(StackError::ExportAlreadyWritten {
                    stack: self.stack.to_string(),
                    key: export.key.clone(),
                });
            }
        }
        entries.extend(output.exports.iter().cloned());
        Ok(())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Resolve every staged value
    pub async fn resolve(&self) -> Result<Vec<ResolvedExport>> {
        let entries: Vec<ResourceExport> = self.entries.lock().clone();
        let resolved = future::try_join_all(entries.into_iter().map(|entry| async move {
            let value = entry.value.resolve().await.map_err(|e| {
                e.context(format!("resolving export '{}'", entry.key))
            })?;
            Ok::<_, StackError>(ResolvedExport {
                key: entry.key,
                value,
                secret: entry.secret,
            })
        }))
        .await?;
        Ok(resolved)
    }

    /// Resolve and publish the staged exports
    pub async fn commit(&self, backend: &dyn OutputBackend) -> Result<Vec<ResolvedExport>> {
        let resolved = self.resolve().await?;
        backend.publish(&self.stack, resolved.clone()).await?;
        tracing::info!(
            stack = %self.stack,
            exports = resolved.len(),
            backend = backend.name(),
            "Published stack exports"
        );
        Ok(resolved)
    }
}

/// In-memory output backend
#[derive(Debug, Default)]
pub struct MemoryOutputBackend {
    stacks: RwLock<HashMap<StackReference, BTreeMap<String, ResolvedExport>>>,
}

impl MemoryOutputBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed exports of a stack that is not part of the current run
    pub fn seed(&self, stack: StackReference, exports: Vec<ResolvedExport>) {
        let map = exports.into_iter().map(|e| (e.key.clone(), e)).collect();
        self.stacks.write().insert(stack, map);
    }

    pub fn contains_stack(&self, stack: &StackReference) -> bool {
        self.stacks.read().contains_key(stack)
    }
}

#[async_trait]
impl OutputBackend for MemoryOutputBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_output(&self, stack: &StackReference, key: &str) -> Result<Option<ResolvedExport>> {
        Ok(self
            .stacks
            .read()
            .get(stack)
            .and_then(|exports| exports.get(key))
            .cloned())
    }

    async fn publish(&self, stack: &StackReference, exports: Vec<ResolvedExport>) -> Result<()> {
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
        self.stacks.write().insert(stack.clone(), map);
        Ok(())
    }

    async fn list_outputs(&self, stack: &StackReference) -> Result<Vec<ResolvedExport>> {
        Ok(self
            .stacks
            .read()
            .get(stack)
            .map(|exports| exports.values().cloned().collect())
            .unwrap_or_default())
    }
}
