//! Job lifecycle manager: submission and the state machine.
//!
//! The lifecycle manager is the sole writer of job rows outside the retry
//! controller. Every transition is a read-check-write against the metadata
//! store, conditional on the version that was read, so duplicate deliveries
//! and racing writers serialize cleanly. Effects are ordered store → cache
//! (best effort) → broker; the cache never gates correctness and a broker
//! failure after the store commit leaves a pending row for the reconciler.

use std::sync::Arc;
use std::time::Duration;

use alder_core::{
    Envelope, JobId, JobRecord, JobStatus, MessageBroker, MetadataStore, PublishOptions,
    StatusCache, StoreError,
};
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{JobError, Result};
use crate::handler::TypeRegistry;
use crate::job::JobSpec;

/// Hard ceiling on any job's retry budget.
pub const MAX_RETRIES_LIMIT: u32 = 25;

/// Configuration for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// TTL on cached status mirrors.
    pub status_ttl: Duration,
    /// Retry budget applied when a submission does not specify one.
    pub default_max_retries: u32,
    /// Attempts made on a contended conditional update before giving up.
    pub update_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            status_ttl: Duration::from_secs(3600),
            default_max_retries: 3,
            update_attempts: 3,
        }
    }
}

/// Outcome of a state-transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The transition was applied.
    Applied,
    /// The precondition did not hold; nothing was written. Carries the
    /// status observed at the time.
    Ignored(JobStatus),
    /// No row exists for this id. Scheduler emissions run without one.
    MissingRow,
}

/// Enforces the job state machine and owns the submission path.
pub struct Lifecycle {
    store: Arc<dyn MetadataStore>,
    broker: Arc<dyn MessageBroker>,
    cache: Arc<dyn StatusCache>,
    registry: TypeRegistry,
    config: LifecycleConfig,
    initialized: RwLock<bool>,
}

impl Lifecycle {
    /// Create a lifecycle manager with default configuration.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        broker: Arc<dyn MessageBroker>,
        cache: Arc<dyn StatusCache>,
        registry: TypeRegistry,
    ) -> Self {
        Self::with_config(store, broker, cache, registry, LifecycleConfig::default())
    }

    /// Create a lifecycle manager with custom configuration.
    pub fn with_config(
        store: Arc<dyn MetadataStore>,
        broker: Arc<dyn MessageBroker>,
        cache: Arc<dyn StatusCache>,
        registry: TypeRegistry,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            broker,
            cache,
            registry,
            config,
            initialized: RwLock::new(false),
        }
    }

    /// Ensure the broker topology exists (lazy, once per process).
    async fn ensure_initialized(&self) -> Result<()> {
        if *self.initialized.read().await {
            return Ok(());
        }
        let mut initialized = self.initialized.write().await;
        if !*initialized {
            self.broker.declare_topology().await?;
            *initialized = true;
        }
        Ok(())
    }

    /// Submit a new job.
    ///
    /// Validates the specification, persists the row, mirrors the status to
    /// the cache, and publishes the dispatch message unless `scheduled_for`
    /// lies in the future. Returns the allocated id; on a broker failure the
    /// row is already durable and the error is surfaced so the caller may
    /// retry or lean on the reconciler.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        if !self.registry.contains(&spec.job_type) {
            return Err(JobError::UnknownJobType {
                job_type: spec.job_type,
            });
        }
        let max_retries = spec.max_retries.unwrap_or(self.config.default_max_retries);
        if max_retries > MAX_RETRIES_LIMIT {
            return Err(JobError::InvalidMaxRetries {
                requested: max_retries,
                limit: MAX_RETRIES_LIMIT,
            });
        }

        self.ensure_initialized().await?;

        let now = Utc::now();
        let job = JobRecord {
            id: JobId::new(),
            job_type: spec.job_type,
            priority: spec.priority,
            status: JobStatus::Pending,
            payload: spec.payload,
            max_retries,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            scheduled_for: spec.scheduled_for,
            worker_id: None,
            error_message: None,
            version: 0,
        };

        self.store.insert_job(&job).await?;
        self.mirror_status(&job).await;

        let deferred = job.scheduled_for.is_some_and(|at| at > now);
        if deferred {
            info!(
                job_id = %job.id,
                scheduled_for = ?job.scheduled_for,
                "job deferred; it will dispatch when its time arrives"
            );
        } else {
            self.publish_job(&job, None).await?;
        }

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            "job submitted"
        );
        Ok(job.id)
    }

    /// Transition a job to `Running` on behalf of a worker.
    ///
    /// Allowed from `Pending` and `Retrying`. A duplicate delivery for a job
    /// already terminal (or already running) is absorbed and reported via
    /// the outcome rather than an error.
    pub async fn mark_running(&self, id: JobId, worker_id: &str) -> Result<MarkOutcome> {
        assert!(!worker_id.is_empty(), "worker_id must not be empty");

        let worker_id = worker_id.to_string();
        let outcome = self
            .transition(id, "mark_running", move |job| match job.status {
                JobStatus::Pending | JobStatus::Retrying => {
                    job.status = JobStatus::Running;
                    if job.started_at.is_none() {
                        job.started_at = Some(Utc::now());
                    }
                    job.worker_id = Some(worker_id.clone());
                    true
                }
                _ => false,
            })
            .await?;
        Ok(outcome)
    }

    /// Transition a job from `Running` to `Completed`.
    pub async fn mark_completed(&self, id: JobId) -> Result<MarkOutcome> {
        self.transition(id, "mark_completed", |job| match job.status {
            JobStatus::Running => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.error_message = None;
                true
            }
            _ => false,
        })
        .await
    }

    /// Cancel a job. Idempotent; allowed from `Pending`, `Retrying`, and
    /// `Running`. A worker that later receives the job's message observes
    /// the terminal status and acknowledges without executing.
    pub async fn mark_cancelled(&self, id: JobId) -> Result<MarkOutcome> {
        let outcome = self
            .transition(id, "mark_cancelled", |job| match job.status {
                JobStatus::Pending | JobStatus::Retrying | JobStatus::Running => {
                    job.status = JobStatus::Cancelled;
                    job.worker_id = None;
                    true
                }
                _ => false,
            })
            .await?;
        if let MarkOutcome::Ignored(JobStatus::Cancelled) = outcome {
            debug!(job_id = %id, "job already cancelled");
        }
        Ok(outcome)
    }

    /// Fetch a job row, failing when it does not exist.
    pub async fn job(&self, id: JobId) -> Result<JobRecord> {
        self.store
            .job(id)
            .await?
            .ok_or_else(|| JobError::JobNotFound { id: id.to_string() })
    }

    /// Authoritative status read from the metadata store.
    pub async fn status(&self, id: JobId) -> Result<JobStatus> {
        Ok(self.job(id).await?.status)
    }

    /// Publish a job's dispatch message to its priority queue.
    pub(crate) async fn publish_job(&self, job: &JobRecord, delay: Option<Duration>) -> Result<()> {
        self.ensure_initialized().await?;
        let body = Envelope::for_job(job).to_bytes()?;
        self.broker
            .publish(
                job.priority.queue_name(),
                body,
                PublishOptions {
                    priority: job.priority.broker_priority(),
                    delay,
                },
            )
            .await?;
        Ok(())
    }

    /// Write the status mirror, logging and carrying on if the cache is
    /// down.
    async fn mirror_status(&self, job: &JobRecord) {
        if let Err(error) = self
            .cache
            .set_status(job.id, job.status, self.config.status_ttl)
            .await
        {
            warn!(job_id = %job.id, %error, "failed to mirror job status to cache");
        }
    }

    /// Read-check-write loop shared by the transitions. The closure applies
    /// the precondition and mutation, returning whether anything changed.
    async fn transition<F>(
        &self,
        id: JobId,
        operation: &'static str,
        mut apply: F,
    ) -> Result<MarkOutcome>
    where
        F: FnMut(&mut JobRecord) -> bool,
    {
        let mut attempt = 0;
        loop {
            let Some(mut job) = self.store.job(id).await? else {
                debug!(job_id = %id, operation, "no metadata row for this id");
                return Ok(MarkOutcome::MissingRow);
            };
            let expected = job.version;

            if !apply(&mut job) {
                warn!(
                    job_id = %id,
                    status = %job.status,
                    operation,
                    "ignoring out-of-order transition"
                );
                return Ok(MarkOutcome::Ignored(job.status));
            }
            job.version = expected + 1;

            match self.store.update_job(&job, expected).await {
                Ok(()) => {
                    self.mirror_status(&job).await;
                    debug!(job_id = %id, status = %job.status, operation, "transition applied");
                    return Ok(MarkOutcome::Applied);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    attempt += 1;
                    if attempt >= self.config.update_attempts {
                        return Err(JobError::UpdateContention {
                            id: id.to_string(),
                            attempts: attempt,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
