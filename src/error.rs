//! Error types for the Cluster Storage Orchestrator
//!
//! Every layer (layout resolution, host fan-out, datastore provisioning,
//! archive packaging and the orchestrator itself) reports failures through
//! this single enum so the calling tier can decide what to do with them.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    /// A host or the process is missing required configuration, e.g. a host
    /// without a software iSCSI adapter.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    #[error("Cluster did not converge on '{what}' within {waited:?}")]
    ConvergenceTimeout { what: String, waited: Duration },

    #[error("Host {host} failed to {action}: {source}")]
    HostAction {
        host: String,
        action: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Datastore {datastore} failed after reaching stage {stage}: {source}")]
    Provisioning {
        datastore: String,
        stage: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Hypervisor Errors
    // =========================================================================
    #[error("Remote session fault: {0}")]
    RemoteSessionFault(String),

    #[error("Resource busy: {resource} - {reason}")]
    ResourceBusy { resource: String, reason: String },

    #[error("Unsupported protocol '{protocol}' for {operation}")]
    UnsupportedProtocol { protocol: String, operation: String },

    // =========================================================================
    // Operation Context
    // =========================================================================
    #[error("{operation} failed: {source}")]
    Operation {
        operation: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("Invalid datastore path: {0}")]
    PathParse(String),

    #[error("Descriptor parse error: {0}")]
    DescriptorParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the calling tier should take for a failed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-issue the whole command later
    RetryCommand,
    /// Re-establish the hypervisor session, then re-issue the command
    Reconnect,
    /// Do not retry, the command cannot succeed as issued
    Abort,
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Wrap this error with the name of the operation that was running
    pub fn in_operation(self, operation: impl Into<String>) -> Self {
        Error::Operation {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Operation { source, .. }
            | Error::HostAction { source, .. }
            | Error::Provisioning { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Determine what action the caller should take for this error
    pub fn action(&self) -> ErrorAction {
        match self.root_cause() {
            Error::RemoteSessionFault(_) => ErrorAction::Reconnect,

            // The cluster may still converge, or the resource may free up
            Error::ConvergenceTimeout { .. }
            | Error::ResourceBusy { .. }
            | Error::Io(_) => ErrorAction::RetryCommand,

            Error::Configuration(_)
            | Error::Validation(_)
            | Error::UnsupportedProtocol { .. }
            | Error::PathParse(_)
            | Error::DescriptorParse(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::Abort,

            _ => ErrorAction::RetryCommand,
        }
    }

    /// Check if the caller may retry this command
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::Abort)
    }

    /// Check if the hypervisor session behind this error is no longer usable
    pub fn is_session_fault(&self) -> bool {
        matches!(self.root_cause(), Error::RemoteSessionFault(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Error::NotFound { .. })
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;

/// Attach operation context to a `Result`
pub trait ResultExt<T> {
    fn in_operation(self, operation: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn in_operation(self, operation: &str) -> Result<T> {
        self.map_err(|e| e.in_operation(operation))
    }
}
