//! Unified error types for the DAOS CSI driver.
//!
//! Every failure carries enough context to be logged on its own and maps
//! onto exactly one CSI status [`Code`] through [`CsiError::code`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CSI status codes surfaced to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    /// The request is malformed or the volume cannot be used as asked.
    InvalidArgument,
    /// A requested object does not exist.
    NotFound,
    /// Another operation holds the target; retry later.
    Aborted,
    /// The filesystem daemon ran out of resources.
    ResourceExhausted,
    /// Any unexpected syscall, filesystem, or handoff failure.
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::Aborted => "Aborted",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CsiError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A request field is missing or malformed.
    #[error("{message}")]
    InvalidArgument {
        /// Description of the offending field.
        message: String,
    },

    /// The target path does not follow the kubelet layout.
    #[error("target path {path} does not contain pod id and volume name: {reason}")]
    InvalidTargetPath {
        /// Offending path.
        path: String,
        /// Which structural rule failed.
        reason: &'static str,
    },

    /// The volume id is not a `<pool>/<container>` pair.
    #[error("invalid volume id {id:?}: {reason}")]
    InvalidVolumeId {
        /// Offending volume id.
        id: String,
        /// Which grammar rule failed.
        reason: &'static str,
    },

    /// Another publish or unpublish owns this target path.
    #[error("an operation with the given volume target path {target} already exists")]
    OperationInProgress {
        /// Locked target path.
        target: String,
    },

    /// The sidecar reported a usage error on a previous run.
    #[error("the sidecar container failed with error: {message}")]
    SidecarUsage {
        /// Text recovered from the error marker.
        message: String,
    },

    /// The filesystem daemon was killed, typically by resource limits.
    #[error("the sidecar container failed with error: {message}")]
    SidecarKilled {
        /// Text recovered from the error marker.
        message: String,
    },

    /// The sidecar failed for any other reason.
    #[error("the sidecar container failed with error: {message}")]
    SidecarFailed {
        /// Text recovered from the error marker.
        message: String,
    },

    /// A mount or unmount syscall failed.
    #[error("{operation} failed for {target}: {message}")]
    Mount {
        /// `mount`, `unmount`, or `open`.
        operation: &'static str,
        /// Path the syscall was issued against.
        target: PathBuf,
        /// Underlying error text.
        message: String,
    },

    /// Setting up or running the descriptor handoff failed.
    #[error("handoff failed at {path}: {message}")]
    Handoff {
        /// Staging directory or socket involved.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CsiError {
    /// Returns the CSI status code this error is reported with.
    pub const fn code(&self) -> Code {
        match self {
            Self::InvalidArgument { .. }
            | Self::InvalidTargetPath { .. }
            | Self::InvalidVolumeId { .. }
            | Self::SidecarUsage { .. } => Code::InvalidArgument,
            Self::OperationInProgress { .. } => Code::Aborted,
            Self::SidecarKilled { .. } => Code::ResourceExhausted,
            Self::NotFound { .. } => Code::NotFound,
            Self::Io { .. }
            | Self::Config { .. }
            | Self::SidecarFailed { .. }
            | Self::Mount { .. }
            | Self::Handoff { .. }
            | Self::Serialization { .. } => Code::Internal,
        }
    }

    /// Shorthand for [`CsiError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CsiError>;
