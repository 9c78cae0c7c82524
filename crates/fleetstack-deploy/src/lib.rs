//! FleetStack Deploy
//!
//! Provisions the resources of a stack graph, publishes their exports and
//! wires consumers' workloads with the values they import.
//!
//! # Components
//!
//! - [`Registry`]: provisioning functions and compute processors by type tag
//! - [`ProvisionContext`]: engine, export backend, settings and cancellation
//!   handed to every provisioning function
//! - [`resources`]: built-in resource types (Cloud SQL Postgres, Memorystore
//!   Redis, Cloud Storage, Pub/Sub, GKE)
//! - [`sidecar`]: per-consumer database credentials, proxy sidecar, init job
//! - [`Deployer`]: validation, planning and stack orchestration
//!
//! ```text
//!            StackGraph
//!                │
//!        ┌───────▼────────┐   plan()   ┌────────────┐
//!        │    Deployer    ├───────────►│ DeployPlan │
//!        └───────┬────────┘            └────────────┘
//!                │ deploy(), stack by stack
//!   ┌────────────▼─────────────┐      ┌──────────────────┐
//!   │ ProvisioningFunction     │─────►│ StackExportStore │──► OutputBackend
//!   │   (Create / Adopt)       │      └──────────────────┘          │
//!   └──────────────────────────┘                                  │ import
//!   ┌──────────────────────────┐      ┌──────────────────┐        │
//!   │ ComputeProcessor         │◄─────┤ consumer stack   │◄───────┘
//!   │   └─ Collector ──────────┼─────►│ workload shape   │──► engine
//!   └──────────────────────────┘      └──────────────────┘
//! ```

pub mod assembly;
pub mod cancel;
pub mod context;
pub mod orchestrator;
pub mod plan;
pub mod registry;
pub mod resources;
pub mod sidecar;

pub use assembly::{AssembledWorkload, HandleIndex};
pub use cancel::CancellationSignal;
pub use context::ProvisionContext;
pub use orchestrator::{DeployReport, Deployer, ResourceSummary, StackOutcome, StackReport};
pub use plan::{DeployPlan, PlanSummary, PlannedConsumer, PlannedResource, StackPlan};
pub use registry::{
    ComputeProcessor, ExportField, ProcessParams, ProvisionParams, ProvisioningFunction, Registry,
};
