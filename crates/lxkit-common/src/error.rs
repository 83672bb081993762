//! Unified error types for the lxkit workspace.
//!
//! Every fallible operation in the workspace returns [`LxkitError`]. Errors
//! coming from the kernel keep their OS errno so callers can tell a timeout
//! apart from a fatal backend failure.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::ContainerState;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum LxkitError {
    /// A container, template, or file does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A container with this name is already defined.
    #[error("container already defined: {name}")]
    AlreadyExists {
        /// Name of the existing container.
        name: String,
    },

    /// The operation is not valid for the container's current state.
    #[error("cannot {operation} container {name} while it is {state}")]
    InvalidState {
        /// Container name.
        name: String,
        /// State observed when the operation was rejected.
        state: ContainerState,
        /// Operation that was rejected.
        operation: &'static str,
    },

    /// The process lacks the privilege required for the operation.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// The isolation backend failed. The OS errno, if any, is kept in `source`.
    #[error("backend failed to {operation}: {source}")]
    Backend {
        /// Backend operation that failed.
        operation: &'static str,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A state transition did not complete before the deadline.
    #[error("container {name} did not reach {target} within {waited:?}")]
    Timeout {
        /// Container name.
        name: String,
        /// State that was waited for.
        target: ContainerState,
        /// Time spent waiting.
        waited: Duration,
    },

    /// An argument was rejected before reaching the backend.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the rejected argument.
        message: String,
    },

    /// A configuration file or value is malformed.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl LxkitError {
    /// Builds an [`LxkitError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds an [`LxkitError::Backend`] from an OS error.
    pub fn backend(operation: &'static str, source: std::io::Error) -> Self {
        Self::Backend { operation, source }
    }

    /// Returns the OS errno preserved by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Backend { source, .. } | Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Returns whether this error is a [`LxkitError::Timeout`].
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, LxkitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_preserves_errno() {
        let err = LxkitError::backend("start", std::io::Error::from_raw_os_error(12));
        assert_eq!(err.errno(), Some(12));
        assert!(err.to_string().contains("start"));
    }

    #[test]
    fn errors_without_os_source_have_no_errno() {
        let err = LxkitError::AlreadyExists {
            name: "web".into(),
        };
        assert_eq!(err.errno(), None);
        assert!(!err.is_timeout());
    }

    #[test]
    fn invalid_state_message_names_operation_and_state() {
        let err = LxkitError::InvalidState {
            name: "db".into(),
            state: ContainerState::Running,
            operation: "destroy",
        };
        assert_eq!(
            err.to_string(),
            "cannot destroy container db while it is RUNNING"
        );
    }
}
