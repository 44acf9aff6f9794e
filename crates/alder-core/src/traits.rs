//! The three collaborator seams of the job system.
//!
//! The core components are written against these traits rather than any
//! concrete backend. Production deployments bind them to a relational
//! database, an AMQP broker, and a TTL cache; tests and single-process
//! deployments use the in-memory implementations in [`crate::inmemory`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{BrokerError, CacheError, StoreError};
use crate::types::{
    DeadLetter, JobId, JobRecord, JobStatus, QueueBreakdown, RetryAttempt, ScheduleId,
    ScheduleRecord, StatusCounts,
};

/// One atomic write covering a failure decision: the job row update, an
/// optional retry-attempt insert, and an optional dead-letter insert. The
/// store applies all parts in a single transaction so the attempt history
/// and the job row never drift apart.
#[derive(Debug, Clone)]
pub struct FailureWrite {
    /// The job row as it should read after the write. Its `version` must be
    /// `expected_version + 1`.
    pub job: JobRecord,
    /// Version of the job row the decision was computed against.
    pub expected_version: u64,
    /// Attempt row to insert, when the failure consumed retry budget.
    pub attempt: Option<RetryAttempt>,
    /// Quarantine record to insert, when the decision was terminal.
    pub dead_letter: Option<DeadLetter>,
}

/// Durable source of truth for every job, attempt, dead letter, and
/// schedule.
///
/// Each method is atomic; `update_job` and `record_failure` are additionally
/// conditional on the version the caller read, which is how concurrent
/// state transitions on the same job serialize.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a new job row.
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// Fetch a job row by id.
    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Conditionally replace a job row. Fails with
    /// [`StoreError::VersionConflict`] when the stored version differs from
    /// `expected_version`.
    async fn update_job(&self, job: &JobRecord, expected_version: u64) -> Result<(), StoreError>;

    /// Apply a failure decision atomically. See [`FailureWrite`].
    async fn record_failure(&self, write: FailureWrite) -> Result<(), StoreError>;

    /// All retry attempts for a job, in attempt order.
    async fn attempts(&self, job_id: JobId) -> Result<Vec<RetryAttempt>, StoreError>;

    /// The dead-letter record for a job, if quarantined.
    async fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetter>, StoreError>;

    /// Total number of dead-letter records.
    async fn dead_letter_count(&self) -> Result<u64, StoreError>;

    /// Job counts grouped by status.
    async fn status_counts(&self) -> Result<StatusCounts, StoreError>;

    /// Pending-job counts grouped by priority.
    async fn pending_by_priority(&self) -> Result<QueueBreakdown, StoreError>;

    /// Retrying jobs whose recorded `next_retry_at` passed before `cutoff`,
    /// oldest first. These are candidates for republication: their delayed
    /// message should have been consumed by now.
    async fn stale_retrying(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Pending jobs that should be on a queue but may not be: rows whose
    /// `scheduled_for` has passed `now`, or undeferred rows created before
    /// `cutoff` (the submit-then-crash gap). Oldest first.
    async fn stale_pending(
        &self,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Persist a new schedule. Names are unique.
    async fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError>;

    /// Fetch a schedule by id.
    async fn schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>, StoreError>;

    /// All schedules, in creation order.
    async fn schedules(&self) -> Result<Vec<ScheduleRecord>, StoreError>;

    /// Active schedules with `next_run_at <= now`, ascending by
    /// `next_run_at` then id.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError>;

    /// Replace a schedule row.
    async fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError>;

    /// Try to acquire or refresh a named lease. Returns `true` when `owner`
    /// holds the lease for `ttl` past `now`; `false` when another live
    /// holder exists. Used to keep a single scheduler instance active.
    async fn try_acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Options attached to a published message. Messages are always persistent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Broker-level message priority; biases ordering within a queue.
    pub priority: u8,
    /// Hold the message and make it visible only after this delay.
    pub delay: Option<Duration>,
}

/// A message handed to a consumer. The receipt stays valid until the
/// delivery is acknowledged or rejected.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Opaque receipt used to ack or reject this delivery.
    pub receipt: u64,
    /// Queue the message was consumed from.
    pub queue: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// Broker priority the message was published with.
    pub priority: u8,
    /// Whether this message has been delivered before.
    pub redelivered: bool,
}

/// Priority queues with at-least-once delivery, delayed re-delivery, and a
/// dead-letter route for rejected messages.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare the queue topology: the three priority queues plus the
    /// dead-letter exchange and its queue. Idempotent.
    async fn declare_topology(&self) -> Result<(), BrokerError>;

    /// Publish a persistent message to a queue.
    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Receive at most one message from the given queues, scanning them in
    /// order. Waits up to `wait` for a message to become visible before
    /// returning `None`.
    async fn dequeue(
        &self,
        queues: &[&str],
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge a delivery, removing it permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject a delivery. With `requeue` the message returns to its queue
    /// for another consumer; without it the message routes to the
    /// dead-letter queue.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Number of visible messages on a queue.
    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError>;
}

/// Fast-read mirror of job status and ephemeral worker liveness.
///
/// Everything here is best-effort and eventually consistent with the
/// metadata store; a stale or missing entry never changes lifecycle
/// behaviour.
#[async_trait]
pub trait StatusCache: Send + Sync {
    /// Mirror a job's status under a TTL.
    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Read a mirrored status, if present and unexpired.
    async fn status(&self, job_id: JobId) -> Result<Option<JobStatus>, CacheError>;

    /// Advertise worker liveness under a TTL. Refreshed periodically while
    /// the worker runs; absence means the worker is presumed dead.
    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Ids of workers with a live heartbeat.
    async fn active_workers(&self) -> Result<Vec<String>, CacheError>;
}

#[async_trait]
impl<T: MetadataStore + ?Sized> MetadataStore for Arc<T> {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        (**self).insert_job(job).await
    }

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        (**self).job(id).await
    }

    async fn update_job(&self, job: &JobRecord, expected_version: u64) -> Result<(), StoreError> {
        (**self).update_job(job, expected_version).await
    }

    async fn record_failure(&self, write: FailureWrite) -> Result<(), StoreError> {
        (**self).record_failure(write).await
    }

    async fn attempts(&self, job_id: JobId) -> Result<Vec<RetryAttempt>, StoreError> {
        (**self).attempts(job_id).await
    }

    async fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetter>, StoreError> {
        (**self).dead_letter(job_id).await
    }

    async fn dead_letter_count(&self) -> Result<u64, StoreError> {
        (**self).dead_letter_count().await
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        (**self).status_counts().await
    }

    async fn pending_by_priority(&self) -> Result<QueueBreakdown, StoreError> {
        (**self).pending_by_priority().await
    }

    async fn stale_retrying(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        (**self).stale_retrying(cutoff, limit).await
    }

    async fn stale_pending(
        &self,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        (**self).stale_pending(now, cutoff, limit).await
    }

    async fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError> {
        (**self).insert_schedule(schedule).await
    }

    async fn schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>, StoreError> {
        (**self).schedule(id).await
    }

    async fn schedules(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        (**self).schedules().await
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError> {
        (**self).due_schedules(now).await
    }

    async fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError> {
        (**self).update_schedule(schedule).await
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).try_acquire_lease(name, owner, ttl, now).await
    }
}

#[async_trait]
impl<T: MessageBroker + ?Sized> MessageBroker for Arc<T> {
    async fn declare_topology(&self) -> Result<(), BrokerError> {
        (**self).declare_topology().await
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        (**self).publish(queue, body, options).await
    }

    async fn dequeue(
        &self,
        queues: &[&str],
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        (**self).dequeue(queues, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        (**self).reject(delivery, requeue).await
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        (**self).queue_depth(queue).await
    }
}

#[async_trait]
impl<T: StatusCache + ?Sized> StatusCache for Arc<T> {
    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        (**self).set_status(job_id, status, ttl).await
    }

    async fn status(&self, job_id: JobId) -> Result<Option<JobStatus>, CacheError> {
        (**self).status(job_id).await
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), CacheError> {
        (**self).heartbeat(worker_id, ttl).await
    }

    async fn active_workers(&self) -> Result<Vec<String>, CacheError> {
        (**self).active_workers().await
    }
}
