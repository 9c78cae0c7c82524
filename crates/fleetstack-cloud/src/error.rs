//! Provisioning engine error types

use fleetstack_core::StackError;
use thiserror::Error;

/// Provisioning engine errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource already exists: {0}")]
    ResourceAlreadyExists(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Job execution failed: {0}")]
    JobFailed(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Engine failures reach the stack orchestrator as transient provisioning
/// errors; retrying is the engine's business.
impl From<CloudError> for StackError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::Timeout(what) => StackError::Timeout(what),
            other => StackError::TransientProvisioning(other.to_string()),
        }
    }
}
