//! Retry controller: decides retry versus quarantine on every failure.
//!
//! The controller is the sole writer of retry-attempt and dead-letter rows.
//! Each decision commits as one conditional store write covering the job
//! row, the attempt history, and (on quarantine) the dead-letter record, so
//! the three never drift apart. The delayed re-publish happens only after
//! the commit; when it fails, the job sits in `Retrying` until the
//! reconciler republishes it.

use std::sync::Arc;
use std::time::Duration;

use alder_core::{
    DeadLetter, Envelope, FailureWrite, JobId, JobRecord, JobStatus, MessageBroker, MetadataStore,
    PublishOptions, RetryAttempt, StoreError,
};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::error::{JobError, Result};
use crate::handler::HandlerFailure;
use crate::policy::{backoff_delay, RetryPolicies, RetryPolicy};

/// Attempts made on a contended failure write before giving up.
const WRITE_ATTEMPTS: u32 = 3;

/// What the controller decided for a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// A delayed re-delivery was scheduled.
    Retried {
        /// Attempt number that was recorded.
        attempt: u32,
        /// Computed backoff delay.
        delay: Duration,
        /// When the retry becomes due.
        next_retry_at: DateTime<Utc>,
    },
    /// The job was quarantined with a dead-letter record.
    Quarantined {
        /// Retries the job had consumed at quarantine time.
        total_attempts: u32,
    },
    /// The job was already terminal; the failure came from a stale message
    /// and was discarded.
    Stale(JobStatus),
}

/// Decides retry versus quarantine and records the audit trail.
pub struct RetryController {
    store: Arc<dyn MetadataStore>,
    broker: Arc<dyn MessageBroker>,
    policies: RetryPolicies,
}

impl RetryController {
    /// Create a controller over the given collaborators and policy table.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        broker: Arc<dyn MessageBroker>,
        policies: RetryPolicies,
    ) -> Self {
        Self {
            store,
            broker,
            policies,
        }
    }

    /// Handle a handler failure for a job.
    ///
    /// Loads the job, increments the retry count when budget remains, and
    /// either schedules a delayed re-delivery or quarantines. Stale
    /// failures against terminal jobs are discarded.
    pub async fn handle_failure(
        &self,
        job_id: JobId,
        failure: &HandlerFailure,
    ) -> Result<Disposition> {
        self.decide(job_id, &failure.message, failure.trace.as_deref(), false)
            .await
    }

    /// Quarantine a job that received a poison message (undecodable payload
    /// or unregistered type). No retry is considered; the decode error is
    /// recorded as an attempt only when the budget permits the increment.
    pub async fn quarantine_poison(&self, job_id: JobId, reason: &str) -> Result<Disposition> {
        self.decide(job_id, reason, None, true).await
    }

    async fn decide(
        &self,
        job_id: JobId,
        message: &str,
        trace: Option<&str>,
        force_quarantine: bool,
    ) -> Result<Disposition> {
        let mut write_attempt = 0;
        loop {
            let job = self
                .store
                .job(job_id)
                .await?
                .ok_or_else(|| JobError::JobNotFound {
                    id: job_id.to_string(),
                })?;

            if job.status.is_terminal() {
                info!(
                    job_id = %job_id,
                    status = %job.status,
                    "discarding failure for terminal job (stale message)"
                );
                return Ok(Disposition::Stale(job.status));
            }

            let now = Utc::now();
            let candidate = job.retry_count + 1;
            let policy = self.policies.get(&job.job_type);
            let budget_remains = policy.is_some() && candidate <= job.max_retries;

            let decision = match policy {
                Some(policy) if budget_remains && !force_quarantine => {
                    self.prepare_retry(&job, candidate, policy, message, trace, now)
                }
                _ => {
                    self.prepare_quarantine(&job, candidate, message, trace, now, budget_remains)
                        .await?
                }
            };

            match self.store.record_failure(decision.write.clone()).await {
                Ok(()) => {
                    return self.finish(decision).await;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    write_attempt += 1;
                    if write_attempt >= WRITE_ATTEMPTS {
                        return Err(JobError::UpdateContention {
                            id: job_id.to_string(),
                            attempts: write_attempt,
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(10 * write_attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn prepare_retry(
        &self,
        job: &JobRecord,
        attempt: u32,
        policy: &RetryPolicy,
        message: &str,
        trace: Option<&str>,
        now: DateTime<Utc>,
    ) -> Decision {
        let delay = backoff_delay(policy, attempt);
        let next_retry_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));

        let mut updated = job.clone();
        updated.status = JobStatus::Retrying;
        updated.retry_count = attempt;
        updated.error_message = Some(message.to_string());
        updated.version = job.version + 1;

        let attempt_row = RetryAttempt {
            job_id: job.id,
            attempt_number: attempt,
            started_at: job.started_at.unwrap_or(now),
            failed_at: now,
            error_message: message.to_string(),
            error_traceback: trace.map(str::to_string),
            next_retry_at: Some(next_retry_at),
        };

        Decision {
            write: FailureWrite {
                job: updated,
                expected_version: job.version,
                attempt: Some(attempt_row),
                dead_letter: None,
            },
            disposition: Disposition::Retried {
                attempt,
                delay,
                next_retry_at,
            },
            republish: Some(delay),
        }
    }

    async fn prepare_quarantine(
        &self,
        job: &JobRecord,
        candidate: u32,
        message: &str,
        trace: Option<&str>,
        now: DateTime<Utc>,
        budget_remains: bool,
    ) -> Result<Decision> {
        let prior = self.store.attempts(job.id).await?;

        // A forced quarantine may still have budget for its attempt row;
        // an exhausted one must not grow past the bound.
        let (attempt_row, total_attempts) = if budget_remains {
            let row = RetryAttempt {
                job_id: job.id,
                attempt_number: candidate,
                started_at: job.started_at.unwrap_or(now),
                failed_at: now,
                error_message: message.to_string(),
                error_traceback: trace.map(str::to_string),
                next_retry_at: None,
            };
            (Some(row), candidate)
        } else {
            (None, job.retry_count)
        };

        let mut all_error_messages: Vec<String> =
            prior.iter().map(|a| a.error_message.clone()).collect();
        if let Some(ref row) = attempt_row {
            all_error_messages.push(row.error_message.clone());
        }

        let first_attempt_at = prior
            .first()
            .map(|a| a.started_at)
            .or(job.started_at)
            .unwrap_or(job.created_at);

        let mut updated = job.clone();
        updated.status = JobStatus::Failed;
        updated.retry_count = total_attempts;
        updated.completed_at = Some(now);
        updated.error_message = Some(message.to_string());
        updated.version = job.version + 1;

        let dead_letter = DeadLetter {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            total_attempts,
            first_attempt_at,
            final_failure_at: now,
            failure_reason: message.to_string(),
            all_error_messages,
        };

        Ok(Decision {
            write: FailureWrite {
                job: updated,
                expected_version: job.version,
                attempt: attempt_row,
                dead_letter: Some(dead_letter),
            },
            disposition: Disposition::Quarantined { total_attempts },
            republish: None,
        })
    }

    /// Post-commit effects: the delayed re-publish for retries.
    async fn finish(&self, decision: Decision) -> Result<Disposition> {
        let job = &decision.write.job;
        match &decision.disposition {
            Disposition::Retried {
                attempt,
                delay,
                next_retry_at,
            } => {
                info!(
                    job_id = %job.id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    next_retry_at = %next_retry_at,
                    "scheduling retry"
                );
                let body = Envelope::for_job(job).to_bytes()?;
                let publish = self
                    .broker
                    .publish(
                        job.priority.queue_name(),
                        body,
                        PublishOptions {
                            priority: job.priority.broker_priority(),
                            delay: decision.republish,
                        },
                    )
                    .await;
                if let Err(error) = publish {
                    // The decision is durable; the reconciler republishes
                    // jobs stuck in Retrying.
                    error!(job_id = %job.id, %error, "failed to republish retry");
                }
            }
            Disposition::Quarantined { total_attempts } => {
                warn!(
                    job_id = %job.id,
                    total_attempts,
                    reason = job.error_message.as_deref().unwrap_or(""),
                    "job quarantined"
                );
            }
            Disposition::Stale(_) => {}
        }
        Ok(decision.disposition)
    }
}

struct Decision {
    write: FailureWrite,
    disposition: Disposition,
    republish: Option<Duration>,
}
