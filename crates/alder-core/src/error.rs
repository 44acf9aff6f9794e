//! Error types surfaced by the collaborator seams.

use snafu::Snafu;

/// Errors from the metadata store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[snafu(context(suffix(StoreSnafu)))]
pub enum StoreError {
    /// The requested record does not exist.
    #[snafu(display("record not found: {what}"))]
    NotFound {
        /// Description of the missing record.
        what: String,
    },

    /// A conditional write lost the race: the row changed since it was read.
    #[snafu(display("version conflict on {what}: expected {expected}, found {found}"))]
    VersionConflict {
        /// The row that conflicted.
        what: String,
        /// Version the writer expected.
        expected: u64,
        /// Version actually stored.
        found: u64,
    },

    /// A uniqueness constraint was violated.
    #[snafu(display("duplicate record: {what}"))]
    Duplicate {
        /// Description of the conflicting record.
        what: String,
    },

    /// The store could not be reached or the operation failed mid-flight.
    #[snafu(display("metadata store unavailable: {reason}"))]
    Unavailable {
        /// Underlying failure description.
        reason: String,
    },
}

/// Errors from the message broker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[snafu(context(suffix(BrokerSnafu)))]
pub enum BrokerError {
    /// The target queue has not been declared.
    #[snafu(display("unknown queue: {queue}"))]
    UnknownQueue {
        /// Queue name that was addressed.
        queue: String,
    },

    /// The receipt does not correspond to an in-flight delivery. Usually a
    /// double-acknowledgement.
    #[snafu(display("stale receipt: {receipt}"))]
    StaleReceipt {
        /// The offending receipt.
        receipt: u64,
    },

    /// The broker could not be reached or the operation failed mid-flight.
    #[snafu(display("message broker unavailable: {reason}"))]
    Unavailable {
        /// Underlying failure description.
        reason: String,
    },
}

/// Errors from the status cache.
///
/// The cache is best-effort: callers are expected to log these and carry on.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[snafu(context(suffix(CacheSnafu)))]
pub enum CacheError {
    /// The cache could not be reached or the operation failed mid-flight.
    #[snafu(display("status cache unavailable: {reason}"))]
    Unavailable {
        /// Underlying failure description.
        reason: String,
    },
}
