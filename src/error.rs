//! Error types shared across admission, threat scoring, and the deferred queue.

use std::time::Duration;

/// Rejected configuration. Surfaced at setup time and never retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A limit that must be positive was zero or negative.
    #[error("{field} must be > 0 (got {value})")]
    NonPositive {
        /// Dotted path of the offending field.
        field: String,
        /// Value provided by the caller.
        value: f64,
    },
    /// A factor fell outside its allowed range.
    #[error("{field} must be within [{min}, {max}] (got {value})")]
    OutOfRange {
        /// Dotted path of the offending field.
        field: String,
        /// Value provided by the caller.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },
    /// Business-hours window does not describe a forward range within a day.
    #[error("business hours window {start}..{end} is invalid")]
    InvalidBusinessHours {
        /// Start hour (inclusive).
        start: u32,
        /// End hour (exclusive).
        end: u32,
    },
    /// A collaborator required to build a component was not supplied.
    #[error("missing {0}")]
    Missing(&'static str),
}

/// Failure talking to the shared atomic store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the operation did not complete.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store replied with data the caller could not interpret.
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

/// Failure resolving tenant metadata from the external directory.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("tenant directory: {0}")]
pub struct DirectoryError(pub String);

/// Failure querying an IP reputation source.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("reputation lookup: {0}")]
pub struct ReputationError(pub String);

/// A stored queue payload that cannot be decoded.
#[derive(thiserror::Error, Debug)]
#[error("invalid queue entry: {0}")]
pub struct InvalidQueueEntry(#[from] pub serde_json::Error);

/// Errors from the deferred queue.
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    /// Shared store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Entry could not be encoded or decoded.
    #[error(transparent)]
    Invalid(#[from] InvalidQueueEntry),
}

/// Failure replaying a deferred request downstream.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The executor did not answer within the per-call timeout.
    #[error("replay timed out after {0:?}")]
    Timeout(Duration),
    /// The downstream answered with a status treated as failure.
    #[error("downstream returned status {0}")]
    Status(u16),
    /// Transport or executor failure.
    #[error("executor failed: {0}")]
    Failed(String),
}

/// Failure writing to an audit sink.
#[derive(thiserror::Error, Debug)]
pub enum AuditError {
    /// I/O failure in a file-backed sink.
    #[error("audit io: {0}")]
    Io(#[from] std::io::Error),
    /// Event could not be serialized.
    #[error("audit encode: {0}")]
    Encode(#[from] serde_json::Error),
    /// Any other sink-specific failure.
    #[error("audit: {0}")]
    Other(String),
}

/// Errors returned by [`crate::AdmissionController::admit`].
///
/// Store outages never appear here: they fail open inside the decision.
#[derive(thiserror::Error, Debug)]
pub enum AdmissionError {
    /// Tenant directory lookup failed while classifying the request.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// Live configuration became invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
