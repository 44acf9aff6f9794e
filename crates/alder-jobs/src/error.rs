//! Error types for the job queue core.

use alder_core::{BrokerError, CacheError, StoreError};
use snafu::Snafu;

/// Result type for job operations.
pub type Result<T, E = JobError> = std::result::Result<T, E>;

/// Errors that can occur in the job system.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum JobError {
    /// The job type is not in the registered set.
    #[snafu(display("unknown job type: {job_type}"))]
    UnknownJobType {
        /// The unregistered type.
        job_type: String,
    },

    /// The requested retry budget is outside the allowed range.
    #[snafu(display("max_retries {requested} exceeds the limit of {limit}"))]
    InvalidMaxRetries {
        /// Requested budget.
        requested: u32,
        /// Maximum allowed budget.
        limit: u32,
    },

    /// A payload was provided that is not a JSON object.
    #[snafu(display("payload must be a JSON object"))]
    PayloadNotObject,

    /// A cron expression failed validation.
    #[snafu(display("invalid cron expression {expression:?}: {reason}"))]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Job not found in the metadata store.
    #[snafu(display("job not found: {id}"))]
    JobNotFound {
        /// Job ID that was not found.
        id: String,
    },

    /// Schedule not found in the metadata store.
    #[snafu(display("schedule not found: {id}"))]
    ScheduleNotFound {
        /// Schedule ID that was not found.
        id: String,
    },

    /// A conditional update kept losing races and gave up.
    #[snafu(display("gave up updating job {id} after {attempts} contended attempts"))]
    UpdateContention {
        /// Job ID.
        id: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Metadata store failure.
    #[snafu(display("metadata store error: {source}"))]
    Store {
        /// Source error.
        source: StoreError,
    },

    /// Message broker failure.
    #[snafu(display("message broker error: {source}"))]
    Broker {
        /// Source error.
        source: BrokerError,
    },

    /// Status cache failure.
    #[snafu(display("status cache error: {source}"))]
    Cache {
        /// Source error.
        source: CacheError,
    },

    /// Envelope encoding or decoding failure.
    #[snafu(display("envelope codec error: {source}"))]
    Codec {
        /// Source error.
        source: serde_json::Error,
    },
}

/// Error kinds for categorizing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobErrorKind {
    /// Temporary infrastructure error; the operation may be retried.
    Temporary,
    /// Permanent error; retrying will not help.
    Permanent,
    /// The caller supplied invalid input.
    InvalidInput,
}

impl JobError {
    /// Get the error kind for retry decisions in connection loops.
    pub fn kind(&self) -> JobErrorKind {
        match self {
            Self::UnknownJobType { .. }
            | Self::InvalidMaxRetries { .. }
            | Self::PayloadNotObject
            | Self::InvalidCron { .. } => JobErrorKind::InvalidInput,
            Self::JobNotFound { .. }
            | Self::ScheduleNotFound { .. }
            | Self::Codec { .. } => JobErrorKind::Permanent,
            Self::UpdateContention { .. }
            | Self::Store { .. }
            | Self::Broker { .. }
            | Self::Cache { .. } => JobErrorKind::Temporary,
        }
    }

    /// Check if the error is worth retrying at the caller.
    pub fn is_retryable(&self) -> bool {
        self.kind() == JobErrorKind::Temporary
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        Self::Store { source: err }
    }
}

impl From<BrokerError> for JobError {
    fn from(err: BrokerError) -> Self {
        Self::Broker { source: err }
    }
}

impl From<CacheError> for JobError {
    fn from(err: CacheError) -> Self {
        Self::Cache { source: err }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec { source: err }
    }
}
