//! Provision context
//!
//! Everything a provisioning function or compute processor may touch: the
//! engine, the export backend, tool settings and the abort signal.

use crate::cancel::CancellationSignal;
use fleetstack_cloud::{LiveResource, ProvisionedResource, ProvisioningEngine, ResourceRequest};
use fleetstack_config::Settings;
use fleetstack_core::{OutputBackend, Result, StackError, StackReference};
use std::sync::Arc;

#[derive(Clone)]
pub struct ProvisionContext {
    pub engine: Arc<dyn ProvisioningEngine>,
    pub backend: Arc<dyn OutputBackend>,
    pub settings: Arc<Settings>,
    pub cancel: CancellationSignal,
}

impl std::fmt::Debug for ProvisionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionContext")
            .field("engine", &self.engine.name())
            .field("backend", &self.backend.name())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ProvisionContext {
    pub fn new(
        engine: Arc<dyn ProvisioningEngine>,
        backend: Arc<dyn OutputBackend>,
        settings: Settings,
    ) -> Self {
        Self {
            engine,
            backend,
            settings: Arc::new(settings),
            cancel: CancellationSignal::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn create(&self, request: ResourceRequest) -> Result<ProvisionedResource> {
        tracing::debug!(kind = %request.kind, name = %request.external_name, "Creating resource");
        self.cancel
            .guard(async { self.engine.create(request).await.map_err(StackError::from) })
            .await
    }

    pub async fn adopt(&self, request: ResourceRequest) -> Result<ProvisionedResource> {
        tracing::debug!(
            kind = %request.kind,
            import_id = request.import_id.as_deref().unwrap_or_default(),
            "Adopting resource"
        );
        self.cancel
            .guard(async { self.engine.adopt(request).await.map_err(StackError::from) })
            .await
    }

    /// Live configuration of an object about to be adopted
    pub async fn lookup_required(
        &self,
        kind: &str,
        external_id: &str,
        region: Option<&str>,
    ) -> Result<LiveResource> {
        let live = self
            .cancel
            .guard(async {
                self.engine
                    .lookup(kind, external_id, region)
                    .await
                    .map_err(StackError::from)
            })
            .await?;
        live.ok_or_else(|| StackError::Lookup {
            resource_type: kind.to_string(),
            external_id: match region {
                Some(region) => format!("{} in {}", external_id, region),
                None => external_id.to_string(),
            },
        })
    }

    /// Read an export of `owner`
    pub async fn import(&self, owner: &StackReference, key: &str, secret: bool) -> Result<String> {
        self.cancel
            .guard(fleetstack_core::import(self.backend.as_ref(), owner, key, secret))
            .await
    }
}
