use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::Label;

/// Error type for configuration, persistence, and run-aborting collaborator failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A collaborator reported itself unavailable; the run was aborted.
    #[error("collaborator '{collaborator}' is unavailable: {reason}")]
    CollaboratorUnavailable {
        /// Which collaborator, e.g. `text_generator`.
        collaborator: &'static str,
        /// The collaborator's own explanation.
        reason: String,
    },
    /// Pattern cache read or write failed.
    #[error("pattern cache failure: {0}")]
    PatternCache(String),
    /// Audit log read or write failed.
    #[error("audit log failure: {0}")]
    Audit(String),
    /// DemoSet artifact could not be written or read.
    #[error("artifact failure: {0}")]
    Artifact(String),
    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// JSON encoding or decoding error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A candidate would keep its seed's label.
    #[error("candidate target label '{0}' equals its original label")]
    SameLabel(Label),
}

/// Failure of a single call into an external collaborator.
///
/// `Failed` and `Timeout` are per-call and recoverable; `Unavailable` means the
/// collaborator itself is gone and the run must stop.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CapabilityError {
    /// The call failed; retry or score 0.
    #[error("call failed: {0}")]
    Failed(String),
    /// The call did not finish in time.
    #[error("call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The collaborator is gone; abort the run.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    /// True when the error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CapabilityError::Unavailable(_))
    }

    /// Convert a fatal collaborator error into the run-level error.
    pub fn into_pipeline(self, collaborator: &'static str) -> PipelineError {
        PipelineError::CollaboratorUnavailable {
            collaborator,
            reason: self.to_string(),
        }
    }
}
