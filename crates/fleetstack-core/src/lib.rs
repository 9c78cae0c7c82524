//! FleetStack Core
//!
//! Building blocks of stack composition: deterministic naming, deferred
//! values, stack exports and the compute context a workload is wired with.
//!
//! ```text
//! ┌────────────────────────┐      ┌────────────────────────┐
//! │  owner stack           │      │  consumer stack        │
//! │  provisioning function │      │  compute processor     │
//! │    └─ ResourceOutput   │      │    ├─ import()         │
//! │        └─ exports ─────┼──────┼──► └─ ComputeContext-  │
//! │  StackExportStore      │      │        Collector       │
//! └───────────┬────────────┘      └────────────────────────┘
//!             │ commit
//!      ┌──────▼────────┐
//!      │ OutputBackend │
//!      └───────────────┘
//! ```

pub mod collector;
pub mod deferred;
pub mod error;
pub mod export;
pub mod model;
pub mod naming;

pub use collector::{
    CollectedContext, ComputeContextCollector, DeployedWorkload, EnvVariable, OrderKey,
    TemplateFields, TemplateValue,
};
pub use deferred::Deferred;
pub use error::{Result, ResultExt, StackError};
pub use export::{import, MemoryOutputBackend, OutputBackend, ResolvedExport, StackExportStore};
pub use model::*;
pub use naming::{
    consumer_identity, derive_name, export_key, naming_env, validate_name_part, NameRules,
    NAME_SEPARATOR,
};
