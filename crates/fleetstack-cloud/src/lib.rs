//! FleetStack Cloud
//!
//! Boundary to the provisioning engine that talks to cloud APIs.
//!
//! # Components
//!
//! - [`ProvisioningEngine`]: create / adopt / lookup resources, deploy
//!   workloads, run one-shot jobs
//! - [`StateManager`]: `.fleetstack/state.json` with backup and lock file,
//!   doubling as the file-backed export store
//! - [`MemoryEngine`]: simulated engine for tests and `--simulate` runs
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            fleetstack-deploy             │
//! └───────────────┬──────────────────────────┘
//!                 │ trait ProvisioningEngine
//! ┌───────────────▼───────────┐ ┌────────────┐
//! │ MemoryEngine / external   │ │StateManager│
//! │ engine                    │ │(exports)   │
//! └───────────────────────────┘ └────────────┘
//! ```

pub mod engine;
pub mod error;
pub mod memory;
pub mod state;

// Re-exports
pub use engine::{
    attribute_string, Attributes, JobOutcome, LiveResource, ProvisionedResource,
    ProvisioningEngine, ResourceRequest, RetryConfig, RANDOM_PASSWORD_KIND,
};
pub use error::{CloudError, Result};
pub use memory::{CapturedCall, DeployedWorkloadRecord, ManagedResource, MemoryEngine};
pub use state::{
    GlobalState, ResourceState, ResourceStatus, StackState, StateLock, StateManager,
    DEFAULT_STATE_DIR,
};
