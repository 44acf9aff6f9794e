//! Recurring-job scheduler: materialises due schedules into the queues.
//!
//! A polling loop wakes every `poll_interval`, takes (or refreshes) the
//! scheduler lease, and fires every active schedule whose `next_run_at` has
//! passed. Catch-up after downtime is single-fire: however many ticks were
//! missed, one job is emitted and `next_run_at` advances past now, trading
//! completeness for bounded burst behaviour on recovery.

use std::sync::Arc;
use std::time::Duration;

use alder_core::{
    Envelope, MessageBroker, MetadataStore, Priority, PublishOptions, ScheduleId, ScheduleRecord,
};
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::handler::TypeRegistry;
use crate::schedule::CronExpr;

/// Name of the lease row that elects the active scheduler instance.
const SCHEDULER_LEASE: &str = "scheduler";

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduler polls for due schedules.
    pub poll_interval: Duration,
    /// Lease duration. Must comfortably exceed the poll interval so a live
    /// holder never loses the lease between polls.
    pub lease_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(180),
        }
    }
}

/// Specification for creating a recurring schedule.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    /// Unique human-readable name.
    pub name: String,
    /// Kind of job each firing emits.
    pub job_type: String,
    /// 5-field POSIX cron expression, evaluated in UTC.
    pub cron_expression: String,
    /// Payload attached to every emitted job.
    pub payload: Map<String, Value>,
    /// Priority of emitted jobs.
    pub priority: Priority,
}

impl ScheduleSpec {
    /// Create a specification with medium priority and an empty payload.
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            cron_expression: cron_expression.into(),
            payload: Map::new(),
            priority: Priority::default(),
        }
    }

    /// Set the payload map.
    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Set the priority of emitted jobs.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Materialises due recurring jobs into the queues.
pub struct Scheduler {
    store: Arc<dyn MetadataStore>,
    broker: Arc<dyn MessageBroker>,
    registry: TypeRegistry,
    config: SchedulerConfig,
    instance_id: String,
}

impl Scheduler {
    /// Create a scheduler with default configuration.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        broker: Arc<dyn MessageBroker>,
        registry: TypeRegistry,
    ) -> Self {
        Self::with_config(store, broker, registry, SchedulerConfig::default())
    }

    /// Create a scheduler with custom configuration.
    pub fn with_config(
        store: Arc<dyn MetadataStore>,
        broker: Arc<dyn MessageBroker>,
        registry: TypeRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            config,
            instance_id: format!("scheduler-{}", Uuid::new_v4()),
        }
    }

    /// Create a recurring schedule. `next_run_at` is seeded from now before
    /// first persistence, so it is never null while the schedule is active.
    pub async fn create_schedule(&self, spec: ScheduleSpec) -> Result<ScheduleId> {
        if !self.registry.contains(&spec.job_type) {
            return Err(JobError::UnknownJobType {
                job_type: spec.job_type,
            });
        }
        let cron = CronExpr::parse(&spec.cron_expression)?;
        let now = Utc::now();
        let next_run_at = cron.next_after(now).ok_or_else(|| JobError::InvalidCron {
            expression: cron.as_str().to_string(),
            reason: "expression never fires".to_string(),
        })?;

        let record = ScheduleRecord {
            id: ScheduleId::new(),
            name: spec.name,
            job_type: spec.job_type,
            cron_expression: cron.as_str().to_string(),
            payload: spec.payload,
            priority: spec.priority,
            is_active: true,
            last_run_at: None,
            next_run_at,
            created_at: now,
        };
        self.store.insert_schedule(&record).await?;

        info!(
            schedule_id = %record.id,
            name = %record.name,
            cron = %record.cron_expression,
            next_run_at = %record.next_run_at,
            "schedule created"
        );
        Ok(record.id)
    }

    /// Activate or deactivate a schedule. Reactivation reseeds
    /// `next_run_at` from now so the schedule does not fire for ticks
    /// missed while inactive.
    pub async fn set_active(&self, id: ScheduleId, active: bool) -> Result<()> {
        let mut record =
            self.store
                .schedule(id)
                .await?
                .ok_or_else(|| JobError::ScheduleNotFound {
                    id: id.to_string(),
                })?;
        if record.is_active == active {
            return Ok(());
        }
        record.is_active = active;
        if active {
            let cron = CronExpr::parse(&record.cron_expression)?;
            let now = Utc::now();
            record.next_run_at = cron.next_after(now).ok_or_else(|| JobError::InvalidCron {
                expression: record.cron_expression.clone(),
                reason: "expression never fires".to_string(),
            })?;
        }
        self.store.update_schedule(&record).await?;
        info!(schedule_id = %id, active, "schedule toggled");
        Ok(())
    }

    /// Run the polling loop until the shutdown flag flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            instance = %self.instance_id,
            poll_secs = self.config.poll_interval.as_secs(),
            "scheduler starting"
        );
        self.broker.declare_topology().await?;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.poll_once().await {
                Ok(fired) if fired > 0 => debug!(fired, "scheduler pass complete"),
                Ok(_) => {}
                Err(error) => warn!(%error, "scheduler pass failed; will retry next interval"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(instance = %self.instance_id, "scheduler stopped");
        Ok(())
    }

    /// One leased pass. Returns the number of schedules fired; zero when
    /// another instance holds the lease.
    pub async fn poll_once(&self) -> Result<usize> {
        let now = Utc::now();
        let leased = self
            .store
            .try_acquire_lease(SCHEDULER_LEASE, &self.instance_id, self.config.lease_ttl, now)
            .await?;
        if !leased {
            debug!(instance = %self.instance_id, "another scheduler holds the lease");
            return Ok(0);
        }
        self.tick().await
    }

    /// Fire every due schedule once and advance its `next_run_at` strictly
    /// past now.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.store.due_schedules(now).await?;
        if due.is_empty() {
            debug!("no schedules due");
            return Ok(0);
        }

        let mut fired = 0;
        for mut schedule in due {
            let envelope = Envelope::new(
                format!("scheduled-{}-{}", schedule.id, now.timestamp()),
                schedule.job_type.clone(),
                schedule.payload.clone(),
            );
            let body = envelope.to_bytes()?;
            if let Err(publish_error) = self
                .broker
                .publish(
                    schedule.priority.queue_name(),
                    body,
                    PublishOptions {
                        priority: schedule.priority.broker_priority(),
                        delay: None,
                    },
                )
                .await
            {
                // next_run_at stays put, so the next pass retries this one.
                warn!(
                    schedule_id = %schedule.id,
                    name = %schedule.name,
                    error = %publish_error,
                    "failed to publish scheduled job; will retry next pass"
                );
                continue;
            }

            schedule.last_run_at = Some(now);
            match CronExpr::parse(&schedule.cron_expression) {
                Ok(cron) => match cron.next_after(now) {
                    Some(next) => schedule.next_run_at = next,
                    None => {
                        warn!(
                            schedule_id = %schedule.id,
                            name = %schedule.name,
                            "schedule has no future firing; deactivating"
                        );
                        schedule.is_active = false;
                    }
                },
                Err(parse_error) => {
                    // A stored expression that no longer parses cannot
                    // advance; deactivate instead of firing it every pass.
                    error!(
                        schedule_id = %schedule.id,
                        name = %schedule.name,
                        error = %parse_error,
                        "stored cron expression is invalid; deactivating"
                    );
                    schedule.is_active = false;
                }
            }
            self.store.update_schedule(&schedule).await?;

            fired += 1;
            info!(
                schedule_id = %schedule.id,
                name = %schedule.name,
                next_run_at = %schedule.next_run_at,
                "scheduled job published"
            );
        }
        Ok(fired)
    }
}
