//! Data model and collaborator seams for the alder job queue.
//!
//! This crate defines the persistent records of the job system (jobs, retry
//! attempts, dead letters, recurring schedules), the canonical message
//! envelope, and the three seams the core components depend on:
//!
//! - [`MetadataStore`] — the durable source of truth for every record.
//! - [`MessageBroker`] — priority queues with delayed re-delivery and a
//!   dead-letter route for poison messages.
//! - [`StatusCache`] — a fast-read mirror of job status plus ephemeral
//!   worker heartbeats.
//!
//! All three seams ship with in-memory implementations ([`MemoryMetadataStore`],
//! [`MemoryBroker`], [`MemoryStatusCache`]) that honour the same contracts as
//! their networked counterparts. They back the test suite and are good enough
//! for single-process deployments.

#![warn(missing_docs)]

mod envelope;
mod error;
mod inmemory;
mod traits;
mod types;

pub use envelope::{Envelope, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE};
pub use error::{BrokerError, CacheError, StoreError};
pub use inmemory::{MemoryBroker, MemoryMetadataStore, MemoryStatusCache};
pub use traits::{
    Delivery, FailureWrite, MessageBroker, MetadataStore, PublishOptions, StatusCache,
};
pub use types::{
    DeadLetter, JobId, JobRecord, JobStatus, Priority, QueueBreakdown, RetryAttempt, ScheduleId,
    ScheduleRecord, StatusCounts,
};
