//! Error types for the PVE CSI driver
//!
//! Every failure in the driver, the cluster pool and the migration tool is
//! expressed as an [`Error`]. Each variant maps onto one protocol status
//! class via [`Error::code`], which is what the RPC layer reports to the
//! container orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid volume id {id:?}: {reason}")]
    InvalidVolumeId { id: String, reason: String },

    #[error("{0} is not implemented")]
    Unimplemented(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    #[error("No clusters configured")]
    ClustersNotFound,

    #[error("Region not found: {region}")]
    RegionNotFound { region: String },

    #[error("Cluster API error ({region}): {reason}")]
    ClusterApi {
        region: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("Task {upid} failed: {status}")]
    TaskFailed { upid: String, status: String },

    #[error("Timeout waiting for {action} on {resource}")]
    Timeout { action: String, resource: String },

    // =========================================================================
    // Node Errors
    // =========================================================================
    #[error("Mount failed at {path}: {reason}")]
    Mount { path: String, reason: String },

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol status class reported for a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    Conflict,
    FailedPrecondition,
    PermissionDenied,
    Unimplemented,
    Internal,
    Unavailable,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatusCode::InvalidArgument => "InvalidArgument",
            StatusCode::NotFound => "NotFound",
            StatusCode::Conflict => "Conflict",
            StatusCode::FailedPrecondition => "FailedPrecondition",
            StatusCode::PermissionDenied => "PermissionDenied",
            StatusCode::Unimplemented => "Unimplemented",
            StatusCode::Internal => "Internal",
            StatusCode::Unavailable => "Unavailable",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Shorthand for [`Error::ResourceNotFound`]
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Status class of this error
    pub fn code(&self) -> StatusCode {
        match self {
            Error::InvalidArgument(_) | Error::InvalidVolumeId { .. } => {
                StatusCode::InvalidArgument
            }

            Error::ResourceNotFound { .. }
            | Error::RegionNotFound { .. }
            | Error::ClustersNotFound
            | Error::DeviceNotFound { .. } => StatusCode::NotFound,

            Error::Conflict(_) | Error::ResourceExists { .. } => StatusCode::Conflict,

            Error::FailedPrecondition(_) => StatusCode::FailedPrecondition,
            Error::PermissionDenied(_) => StatusCode::PermissionDenied,
            Error::Unimplemented(_) => StatusCode::Unimplemented,

            // Transport failures towards a cluster may heal on retry
            Error::Http(_) | Error::Timeout { .. } => StatusCode::Unavailable,

            Error::Internal(_)
            | Error::Configuration(_)
            | Error::ClusterApi { .. }
            | Error::TaskFailed { .. }
            | Error::Mount { .. }
            | Error::Kube(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::Io(_) => StatusCode::Internal,
        }
    }

    /// True for errors the caller caused through bad arguments or missing
    /// permissions; the CLI prints usage for these.
    pub fn is_usage(&self) -> bool {
        matches!(
            self.code(),
            StatusCode::InvalidArgument | StatusCode::PermissionDenied
        )
    }

    /// True when the error means the addressed object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            Error::ClusterApi { status, .. } => *status == Some(404),
            other => other.code() == StatusCode::NotFound,
        }
    }

    /// True when the hypervisor rejected the call's parameters, which is
    /// how it reports a storage that does not exist on the addressed node.
    pub fn is_parameter_verification(&self) -> bool {
        match self {
            Error::ClusterApi { reason, .. } => reason
                .to_lowercase()
                .contains("parameter verification failed"),
            _ => false,
        }
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;
