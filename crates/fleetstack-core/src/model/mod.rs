//! Stack, resource and workload models
//!
//! Descriptors arrive pre-parsed from the configuration layer; nothing here
//! talks to a cloud API.

mod resource;
mod stack;
mod workload;

// Re-exports
pub use resource::*;
pub use stack::*;
pub use workload::*;
