//! Stack provisioning error types

use thiserror::Error;

/// Errors raised while provisioning stacks and wiring their resources.
///
/// The type is `Clone` so that a failure can be observed by every consumer of
/// a shared [`Deferred`](crate::Deferred) value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("Invalid configuration for '{resource}': {message}")]
    Config { resource: String, message: String },

    #[error("Cannot adopt {resource_type} '{external_id}': no such object exists")]
    Lookup {
        resource_type: String,
        external_id: String,
    },

    #[error("Export '{key}' not found in stack '{stack}'")]
    ExportNotFound { stack: String, key: String },

    #[error("Export '{key}' in stack '{stack}' is empty")]
    ExportEmpty { stack: String, key: String },

    #[error("Export '{key}' was already written in stack '{stack}'")]
    ExportAlreadyWritten { stack: String, key: String },

    #[error("Export '{key}' in stack '{stack}' is secret and cannot be read as a plain value")]
    SecretExposure { stack: String, key: String },

    #[error("Workload shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    #[error("Provisioning engine error: {0}")]
    TransientProvisioning(String),

    #[error("No provisioning function registered for resource type '{0}'")]
    UnknownResourceType(String),

    #[error("No compute processor registered for resource type '{0}'")]
    NoComputeProcessor(String),

    #[error("Stack not found: {0}")]
    StackNotFound(String),

    #[error("Resource '{resource}' not found in stack '{stack}' or its ancestors")]
    ResourceNotFound { stack: String, resource: String },

    #[error("Circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("Init job '{job}' failed: {message}")]
    InitJobFailed { job: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StackError>,
    },
}

impl StackError {
    pub fn config(resource: impl Into<String>, message: impl Into<String>) -> Self {
        StackError::Config {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Wrap this error with a human readable context line
    pub fn context(self, context: impl Into<String>) -> Self {
        StackError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping every `Context` wrapper
    pub fn root_cause(&self) -> &StackError {
        let mut current = self;
        while let StackError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Context lines from the outermost wrapper inwards
    pub fn context_chain(&self) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut current = self;
        while let StackError::Context { context, source } = current {
            chain.push(context.as_str());
            current = source;
        }
        chain
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), StackError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, StackError>;

/// Attach context to the error side of a `Result`
pub trait ResultExt<T> {
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}
