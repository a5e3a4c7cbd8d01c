use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HvnodeError {
    #[error("Management backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Integrity check failed for image {version}: expected checksum {expected}, got {actual}")]
    Integrity {
        version: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid image file {path:?}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("Could not stage image {version} ({path:?}): {reason}")]
    Staging {
        version: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Could not create host '{machine}': {details}")]
    Provisioning { machine: String, details: String },

    #[error("Backend interface error during '{operation}': {details}")]
    Interface { operation: String, details: String },

    #[error("Failed to obtain an IP address for '{machine}' after {attempts} attempts")]
    IpAcquisitionTimeout { machine: String, attempts: u32 },

    #[error("Failed to rename host '{machine}' after {attempts} attempts: {last_error}")]
    RenameTimeout {
        machine: String,
        attempts: u32,
        #[source]
        last_error: Box<HvnodeError>,
    },

    #[error("Backend operation '{operation}' failed: {message}")]
    BackendOperation { operation: String, message: String },

    #[error("Command '{command}' failed on '{machine}': {details}")]
    CommandFailed {
        command: String,
        machine: String,
        details: String,
    },

    #[error("Command '{command}' not implemented")]
    CommandNotImplemented { command: String },

    #[error("Cleanup of '{resource}' incomplete: {}", .failures.join("; "))]
    CleanupFailed {
        resource: String,
        failures: Vec<String>,
    },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type HvnodeResult<T> = std::result::Result<T, HvnodeError>;

impl HvnodeError {
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        HvnodeError::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn provisioning(machine: impl Into<String>, details: impl Into<String>) -> Self {
        HvnodeError::Provisioning {
            machine: machine.into(),
            details: details.into(),
        }
    }

    pub fn interface(operation: impl Into<String>, details: impl Into<String>) -> Self {
        HvnodeError::Interface {
            operation: operation.into(),
            details: details.into(),
        }
    }

    pub fn backend_operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        HvnodeError::BackendOperation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        HvnodeError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        HvnodeError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HvnodeError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Transient failures that a bounded retry loop may try again.
    ///
    /// Integrity and format errors are never retryable: a payload that failed
    /// verification once will fail it again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HvnodeError::BackendOperation { .. }
                | HvnodeError::CommandFailed { .. }
                | HvnodeError::Http(_)
        )
    }

    /// Errors that machine creation downgrades to warnings.
    pub fn is_caveat(&self) -> bool {
        matches!(
            self,
            HvnodeError::IpAcquisitionTimeout { .. } | HvnodeError::RenameTimeout { .. }
        )
    }
}

impl From<reqwest::Error> for HvnodeError {
    fn from(err: reqwest::Error) -> Self {
        HvnodeError::Http(err.to_string())
    }
}

impl From<toml::de::Error> for HvnodeError {
    fn from(err: toml::de::Error) -> Self {
        HvnodeError::ConfigError(format!("Invalid TOML: {}", err))
    }
}
