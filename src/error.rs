//! Error taxonomy shared by the limiter, the external caller and the queue.
use thiserror::Error;

use crate::types::job::JobId;

/// A single failed call to the external AI service.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExternalError {
    /// The service explicitly signalled that our quota is used up.
    #[error("throttled by external service: {0}")]
    Throttled(String),
    /// Anything else: network trouble, 5xx, malformed responses.
    #[error("external service error: {0}")]
    Transient(String),
}

impl ExternalError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }
}

/// Returned by [`crate::caller::ExternalCaller`] once the retry budget is
/// spent without a successful attempt.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{operation} failed after {attempts} attempts: {last}")]
pub struct ExternalCallExhausted {
    pub operation: &'static str,
    pub attempts: u32,
    #[source]
    pub last: ExternalError,
}

/// Failure of a collaborator that is not the rate-limited AI service, such as
/// blob storage or the item store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Terminal failure recorded on a job.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JobFailure {
    /// The job used its whole retry budget without completing.
    #[error("retry budget exhausted: {0}")]
    RetryExhausted(String),
    /// External work succeeded but saving the finished item did not.
    #[error("persisting item failed: {0}")]
    Persistence(String),
}

impl JobFailure {
    /// Short machine-friendly name, used in status payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RetryExhausted(_) => "retry-exhausted",
            Self::Persistence(_) => "persistence",
        }
    }
}

/// Submissions rejected before anything is queued.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SubmitError {
    #[error("missing owner id")]
    MissingOwner,
    #[error("no image uploaded")]
    EmptyImage,
    #[error("image of {size} bytes exceeds the {max} byte limit")]
    ImageTooLarge { size: usize, max: usize },
    #[error("queue is shutting down")]
    ShuttingDown,
}

#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum StatusError {
    #[error("no job with id {0}")]
    NotFound(JobId),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
