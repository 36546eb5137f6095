//! Error types for volume connectors
//!
//! Every public operation returns [`ConnectorError`]. Callers that need to
//! react differently to "bad request", "volume unreachable" and "host
//! misconfigured" should match on [`ConnectorError::kind`] rather than on
//! individual variants.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::executor::ExecError;

/// Coarse classification of a [`ConnectorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or incomplete connection properties.
    BadRequest,
    /// No connector exists for the requested protocol.
    Unsupported,
    /// The volume did not show up (or go away) within the bounded wait.
    Unreachable,
    /// Host tooling or hardware is missing or refused the operation.
    HostMisconfigured,
    /// Anything else.
    Internal,
}

/// Unified error type for connector operations
#[derive(Error, Debug)]
pub enum ConnectorError {
    // =========================================================================
    // Caller errors
    // =========================================================================
    #[error("invalid connection properties for {protocol}: {reason}")]
    InvalidProperties { protocol: String, reason: String },

    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),

    // =========================================================================
    // Discovery errors
    // =========================================================================
    #[error("device for {identifier} not found after {attempts} attempts ({elapsed:?})")]
    DeviceNotFound {
        identifier: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("no volume paths found on this host for {0}")]
    VolumePathsNotFound(String),

    #[error("no Fibre Channel host adapters found")]
    NoFibreChannelHosts,

    // =========================================================================
    // Host command errors
    // =========================================================================
    #[error(transparent)]
    Command(#[from] ExecError),

    // =========================================================================
    // Locking errors
    // =========================================================================
    #[error("timed out after {waited:?} waiting for lock '{key}'")]
    LockTimeout { key: String, waited: Duration },

    #[error("lock '{key}' could not be taken: {source}")]
    Lock {
        key: String,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Cleanup errors
    // =========================================================================
    #[error("devices still present after disconnect: {remaining:?}")]
    CleanupUnconfirmed { remaining: Vec<PathBuf> },

    // =========================================================================
    // Plumbing
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConnectorError {
    /// Shorthand for a validation failure.
    pub fn invalid(protocol: impl ToString, reason: impl Into<String>) -> Self {
        ConnectorError::InvalidProperties {
            protocol: protocol.to_string(),
            reason: reason.into(),
        }
    }

    /// Classify the error for callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::InvalidProperties { .. } => ErrorKind::BadRequest,
            ConnectorError::UnsupportedProtocol(_) => ErrorKind::Unsupported,
            ConnectorError::DeviceNotFound { .. }
            | ConnectorError::VolumePathsNotFound(_)
            | ConnectorError::CleanupUnconfirmed { .. } => ErrorKind::Unreachable,
            ConnectorError::NoFibreChannelHosts => ErrorKind::HostMisconfigured,
            ConnectorError::Command(_) => ErrorKind::HostMisconfigured,
            ConnectorError::LockTimeout { .. } | ConnectorError::Lock { .. } => {
                ErrorKind::Internal
            }
            ConnectorError::Io(_) | ConnectorError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Short label used for metrics.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::HostMisconfigured => "host_misconfigured",
            ErrorKind::Internal => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
