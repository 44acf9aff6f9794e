//! Persistent record types for the job system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier for a job, allocated at submission time so the client
/// can know it before any worker has seen the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for a recurring schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScheduleId(Uuid);

impl ScheduleId {
    /// Allocate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job in the system.
///
/// `Completed`, `Failed`, and `Cancelled` are absorbing: once a job reaches
/// one of them, no further transition is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and persisted, waiting to be picked up.
    Pending,
    /// Currently executing on a worker.
    Running,
    /// Failed at least once; a delayed re-delivery is in flight.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Exhausted its retry budget (or was poisoned) and is quarantined.
    Failed,
    /// Cancelled before reaching a natural terminal state.
    Cancelled,
}

impl JobStatus {
    /// Whether the status is terminal (absorbing).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable lowercase name, used for cache mirrors and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Dispatched before everything else.
    High,
    /// The default tier.
    #[default]
    Medium,
    /// Dispatched only when the other tiers are drained.
    Low,
}

impl Priority {
    /// All priorities, highest first. Consumers poll queues in this order.
    pub fn all_ordered() -> [Priority; 3] {
        [Self::High, Self::Medium, Self::Low]
    }

    /// Name of the broker queue serving this tier.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::High => "jobs.high",
            Self::Medium => "jobs.medium",
            Self::Low => "jobs.low",
        }
    }

    /// Numeric message priority attached to published messages.
    pub fn broker_priority(&self) -> u8 {
        match self {
            Self::High => 10,
            Self::Medium => 5,
            Self::Low => 1,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => f.write_str("high"),
            Self::Medium => f.write_str("medium"),
            Self::Low => f.write_str("low"),
        }
    }
}

/// The durable record of a job, one row per submission.
///
/// `version` is a monotonic counter used for optimistic concurrency: every
/// state transition reads the row, applies its precondition, and writes back
/// with `version + 1` conditioned on the version it read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job ID.
    pub id: JobId,
    /// Registered kind, used to route to a handler.
    pub job_type: String,
    /// Dispatch priority.
    pub priority: Priority,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Opaque payload, interpreted only by the handler for `job_type`.
    pub payload: Map<String, Value>,
    /// Maximum number of retries before quarantine.
    pub max_retries: u32,
    /// Retries consumed so far. Never exceeds `max_retries`.
    pub retry_count: u32,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// First time the job entered `Running`, if it ever has.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached `Completed` or `Failed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the job may dispatch, if deferred at submission.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Last worker that executed the job.
    pub worker_id: Option<String>,
    /// Most recent failure message.
    pub error_message: Option<String>,
    /// Optimistic-concurrency version.
    pub version: u64,
}

/// One row per failed dispatch of a job; `attempt_number` is 1-based and
/// strictly monotonic per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Job this attempt belongs to.
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// When the attempt began executing.
    pub started_at: DateTime<Utc>,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Failure message.
    pub error_message: String,
    /// Stack trace or equivalent diagnostic, when available.
    pub error_traceback: Option<String>,
    /// When the follow-up attempt becomes due. `None` when no retry was
    /// scheduled for this attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Quarantine record for a permanently failed job. At most one per job, and
/// present exactly when the job's status is `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Job this record quarantines.
    pub job_id: JobId,
    /// Kind of the failed job.
    pub job_type: String,
    /// Original payload, kept for inspection and manual redrive.
    pub payload: Map<String, Value>,
    /// Number of retries the job consumed before quarantine.
    pub total_attempts: u32,
    /// When the first execution began.
    pub first_attempt_at: DateTime<Utc>,
    /// When the quarantine decision was made.
    pub final_failure_at: DateTime<Utc>,
    /// The error that triggered quarantine.
    pub failure_reason: String,
    /// Every recorded attempt's error message, in attempt order.
    pub all_error_messages: Vec<String>,
}

/// A recurring job template driven by a cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecord {
    /// Unique schedule ID.
    pub id: ScheduleId,
    /// Human-readable unique name.
    pub name: String,
    /// Kind of job each firing emits.
    pub job_type: String,
    /// 5-field POSIX cron expression, evaluated in UTC.
    pub cron_expression: String,
    /// Payload attached to every emitted job.
    pub payload: Map<String, Value>,
    /// Priority of emitted jobs.
    pub priority: Priority,
    /// Whether the schedule currently fires.
    pub is_active: bool,
    /// Last time the schedule fired.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due instant. Always strictly in the future for an active
    /// schedule immediately after a scheduler pass.
    pub next_run_at: DateTime<Utc>,
    /// When the schedule was created.
    pub created_at: DateTime<Utc>,
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Jobs in `Pending`.
    pub pending: u64,
    /// Jobs in `Running`.
    pub running: u64,
    /// Jobs in `Retrying`.
    pub retrying: u64,
    /// Jobs in `Completed`.
    pub completed: u64,
    /// Jobs in `Failed`.
    pub failed: u64,
    /// Jobs in `Cancelled`.
    pub cancelled: u64,
}

impl StatusCounts {
    /// Total number of jobs across all statuses.
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.retrying + self.completed + self.failed + self.cancelled
    }
}

/// Per-priority counts, used for queue breakdowns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBreakdown {
    /// High tier.
    pub high: u64,
    /// Medium tier.
    pub medium: u64,
    /// Low tier.
    pub low: u64,
}

impl QueueBreakdown {
    /// Count for a given priority.
    pub fn get(&self, priority: Priority) -> u64 {
        match priority {
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
        }
    }

    /// Mutable count for a given priority.
    pub fn get_mut(&mut self, priority: Priority) -> &mut u64 {
        match priority {
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }
}
