//! Error taxonomy for the daemon core.
//!
//! None of these terminate the process. The event loop logs them, tells
//! watching clients where relevant, and keeps running.

use std::time::Duration;
use thiserror::Error;

/// Failures raised by a compositor backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// No supported compositor found in the environment.
    #[error("no supported compositor detected")]
    Detection,

    /// The compositor socket could not be reached.
    #[error("compositor socket unavailable: {0}")]
    Unavailable(String),

    /// A reply or event could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The compositor refused the requested configuration.
    #[error("compositor rejected configuration: {0}")]
    Apply(String),

    /// Socket I/O did not finish in time.
    #[error("compositor did not answer within {0:?}")]
    Timeout(Duration),
}

impl BackendError {
    /// True for errors that mean the compositor cannot be reached. A query
    /// that timed out counts.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Detection | Self::Timeout(_)
        )
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// No stored profile is fully satisfied by the connected monitors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no stored profile matches the connected monitors")]
pub struct MatchNotFound;

/// Some workspaces could not be reassigned.
#[derive(Error, Debug)]
#[error("failed to move {} workspace(s): {}", .failures.len(), .failures.join("; "))]
pub struct MigrationError {
    pub failures: Vec<String>,
}

impl From<BackendError> for common::MoniqueError {
    fn from(e: BackendError) -> Self {
        Self::Backend(e.to_string())
    }
}
