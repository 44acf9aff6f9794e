//! In-memory implementations of the collaborator seams.
//!
//! These back the test suite and single-process deployments. They honour the
//! same contracts as networked backends: conditional writes on the store,
//! priority ordering and delayed visibility on the broker, TTL expiry on the
//! cache. Delayed visibility and TTLs are measured on the tokio clock so the
//! paused-clock test utilities drive them deterministically.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::envelope::DEAD_LETTER_QUEUE;
use crate::error::{BrokerError, CacheError, StoreError};
use crate::traits::{
    Delivery, FailureWrite, MessageBroker, MetadataStore, PublishOptions, StatusCache,
};
use crate::types::{
    DeadLetter, JobId, JobRecord, JobStatus, Priority, QueueBreakdown, RetryAttempt, ScheduleId,
    ScheduleRecord, StatusCounts,
};

// ---------------------------------------------------------------------------
// Metadata store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, JobRecord>,
    attempts: HashMap<JobId, Vec<RetryAttempt>>,
    dead_letters: HashMap<JobId, DeadLetter>,
    schedules: Vec<ScheduleRecord>,
    leases: HashMap<String, Lease>,
}

/// In-memory [`MetadataStore`]. Every call is serially consistent; the
/// conditional writes model row-level locking.
#[derive(Default)]
pub struct MemoryMetadataStore {
    state: Mutex<StoreState>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate {
                what: format!("job {}", job.id),
            });
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &JobRecord, expected_version: u64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state.jobs.get_mut(&job.id).ok_or_else(|| StoreError::NotFound {
            what: format!("job {}", job.id),
        })?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                what: format!("job {}", job.id),
                expected: expected_version,
                found: stored.version,
            });
        }
        *stored = job.clone();
        Ok(())
    }

    async fn record_failure(&self, write: FailureWrite) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let id = write.job.id;
        let stored = state.jobs.get(&id).ok_or_else(|| StoreError::NotFound {
            what: format!("job {id}"),
        })?;
        if stored.version != write.expected_version {
            return Err(StoreError::VersionConflict {
                what: format!("job {id}"),
                expected: write.expected_version,
                found: stored.version,
            });
        }
        if let Some(ref dead_letter) = write.dead_letter {
            if state.dead_letters.contains_key(&dead_letter.job_id) {
                return Err(StoreError::Duplicate {
                    what: format!("dead letter for job {id}"),
                });
            }
        }

        state.jobs.insert(id, write.job);
        if let Some(attempt) = write.attempt {
            state.attempts.entry(id).or_default().push(attempt);
        }
        if let Some(dead_letter) = write.dead_letter {
            state.dead_letters.insert(id, dead_letter);
        }
        Ok(())
    }

    async fn attempts(&self, job_id: JobId) -> Result<Vec<RetryAttempt>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.attempts.get(&job_id).cloned().unwrap_or_default())
    }

    async fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetter>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.get(&job_id).cloned())
    }

    async fn dead_letter_count(&self) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.len() as u64)
    }

    async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Retrying => counts.retrying += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn pending_by_priority(&self) -> Result<QueueBreakdown, StoreError> {
        let state = self.state.lock().await;
        let mut breakdown = QueueBreakdown::default();
        for job in state.jobs.values() {
            if job.status == JobStatus::Pending {
                *breakdown.get_mut(job.priority) += 1;
            }
        }
        Ok(breakdown)
    }

    async fn stale_retrying(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut stale: Vec<(DateTime<Utc>, JobRecord)> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Retrying)
            .filter_map(|job| {
                let due = state
                    .attempts
                    .get(&job.id)
                    .and_then(|attempts| attempts.last())
                    .and_then(|attempt| attempt.next_retry_at)?;
                (due < cutoff).then(|| (due, job.clone()))
            })
            .collect();
        stale.sort_by_key(|(due, _)| *due);
        Ok(stale.into_iter().take(limit).map(|(_, job)| job).collect())
    }

    async fn stale_pending(
        &self,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut stale: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .filter(|job| match job.scheduled_for {
                Some(release_at) => release_at <= now,
                None => job.created_at <= cutoff,
            })
            .cloned()
            .collect();
        stale.sort_by_key(|job| job.created_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.schedules.iter().any(|s| s.name == schedule.name) {
            return Err(StoreError::Duplicate {
                what: format!("schedule named {:?}", schedule.name),
            });
        }
        state.schedules.push(schedule.clone());
        Ok(())
    }

    async fn schedule(&self, id: ScheduleId) -> Result<Option<ScheduleRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn schedules(&self) -> Result<Vec<ScheduleRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.schedules.clone())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut due: Vec<ScheduleRecord> = state
            .schedules
            .iter()
            .filter(|s| s.is_active && s.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .schedules
            .iter_mut()
            .find(|s| s.id == schedule.id)
            .ok_or_else(|| StoreError::NotFound {
                what: format!("schedule {}", schedule.id),
            })?;
        *stored = schedule.clone();
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Unavailable {
                reason: format!("lease ttl out of range: {e}"),
            })?;
        match state.leases.get_mut(name) {
            Some(lease) if lease.owner != owner && lease.expires_at > now => Ok(false),
            Some(lease) => {
                lease.owner = owner.to_string();
                lease.expires_at = expires_at;
                Ok(true)
            }
            None => {
                state.leases.insert(
                    name.to_string(),
                    Lease {
                        owner: owner.to_string(),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Message broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct QueuedMessage {
    seq: u64,
    priority: u8,
    body: Vec<u8>,
    redelivered: bool,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedMessage {}

impl Ord for QueuedMessage {
    // Max-heap: higher priority first, then FIFO within a priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct DelayedMessage {
    ready_at: Instant,
    queue: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, BinaryHeap<QueuedMessage>>,
    delayed: Vec<DelayedMessage>,
    unacked: HashMap<u64, (String, QueuedMessage)>,
    next_seq: u64,
    next_receipt: u64,
}

impl BrokerState {
    fn release_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].ready_at <= now {
                let held = self.delayed.swap_remove(index);
                self.queues.entry(held.queue).or_default().push(held.message);
            } else {
                index += 1;
            }
        }
    }
}

/// In-memory [`MessageBroker`] with priority ordering, held-until-ready
/// delayed delivery, and a dead-letter queue for rejected messages.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl MemoryBroker {
    /// Create a broker with no declared queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return every unacknowledged delivery to its queue, marked as
    /// redelivered. Models the broker-side recovery that follows a consumer
    /// crash; used by tests to exercise the at-least-once contract.
    pub async fn recover_unacked(&self) -> usize {
        let mut state = self.state.lock().await;
        let inflight: Vec<(String, QueuedMessage)> = state.unacked.drain().map(|(_, v)| v).collect();
        let count = inflight.len();
        for (queue, mut message) in inflight {
            message.redelivered = true;
            state.queues.entry(queue).or_default().push(message);
        }
        drop(state);
        if count > 0 {
            debug!(count, "returned unacknowledged messages to their queues");
            self.notify.notify_waiters();
        }
        count
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare_topology(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        for priority in Priority::all_ordered() {
            state.queues.entry(priority.queue_name().to_string()).or_default();
        }
        state.queues.entry(DEAD_LETTER_QUEUE.to_string()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue {
                queue: queue.to_string(),
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let message = QueuedMessage {
            seq,
            priority: options.priority,
            body,
            redelivered: false,
        };

        match options.delay {
            Some(delay) if !delay.is_zero() => {
                state.delayed.push(DelayedMessage {
                    ready_at: Instant::now() + delay,
                    queue: queue.to_string(),
                    message,
                });
            }
            _ => {
                if let Some(heap) = state.queues.get_mut(queue) {
                    heap.push(message);
                }
            }
        }
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[&str],
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let next_delayed = {
                let mut state = self.state.lock().await;
                state.release_due(Instant::now());

                for queue in queues {
                    if !state.queues.contains_key(*queue) {
                        return Err(BrokerError::UnknownQueue {
                            queue: (*queue).to_string(),
                        });
                    }
                    let popped = state
                        .queues
                        .get_mut(*queue)
                        .and_then(|heap| heap.pop());
                    if let Some(message) = popped {
                        let receipt = state.next_receipt;
                        state.next_receipt += 1;
                        let delivery = Delivery {
                            receipt,
                            queue: (*queue).to_string(),
                            body: message.body.clone(),
                            priority: message.priority,
                            redelivered: message.redelivered,
                        };
                        state.unacked.insert(receipt, ((*queue).to_string(), message));
                        return Ok(Some(delivery));
                    }
                }

                state
                    .delayed
                    .iter()
                    .filter(|held| queues.contains(&held.queue.as_str()))
                    .map(|held| held.ready_at)
                    .min()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wake_at = deadline;
            if let Some(ready_at) = next_delayed {
                if ready_at < wake_at {
                    wake_at = ready_at;
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state
            .unacked
            .remove(&delivery.receipt)
            .map(|_| ())
            .ok_or(BrokerError::StaleReceipt {
                receipt: delivery.receipt,
            })
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let (queue, mut message) =
            state
                .unacked
                .remove(&delivery.receipt)
                .ok_or(BrokerError::StaleReceipt {
                    receipt: delivery.receipt,
                })?;
        message.redelivered = true;
        let target = if requeue {
            queue
        } else {
            DEAD_LETTER_QUEUE.to_string()
        };
        state.queues.entry(target).or_default().push(message);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().await;
        state.release_due(Instant::now());
        state
            .queues
            .get(queue)
            .map(|heap| heap.len() as u64)
            .ok_or(BrokerError::UnknownQueue {
                queue: queue.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Status cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CacheState {
    statuses: HashMap<JobId, (JobStatus, Instant)>,
    workers: HashMap<String, Instant>,
}

/// In-memory [`StatusCache`] with TTL expiry on the tokio clock.
#[derive(Default)]
pub struct MemoryStatusCache {
    state: Mutex<CacheState>,
}

impl MemoryStatusCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusCache for MemoryStatusCache {
    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state.statuses.insert(job_id, (status, Instant::now() + ttl));
        Ok(())
    }

    async fn status(&self, job_id: JobId) -> Result<Option<JobStatus>, CacheError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.statuses.get(&job_id) {
            Some((status, expires_at)) if *expires_at > now => Ok(Some(*status)),
            Some(_) => {
                state.statuses.remove(&job_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state.workers.insert(worker_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn active_workers(&self) -> Result<Vec<String>, CacheError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.workers.retain(|_, expires_at| *expires_at > now);
        let mut workers: Vec<String> = state.workers.keys().cloned().collect();
        workers.sort();
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus) -> JobRecord {
        JobRecord {
            id: JobId::new(),
            job_type: "send_email".to_string(),
            priority: Priority::Medium,
            status,
            payload: serde_json::Map::new(),
            max_retries: 3,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            scheduled_for: None,
            worker_id: None,
            error_message: None,
            version: 0,
        }
    }

    #[tokio::test]
    async fn update_job_enforces_the_read_version() {
        let store = MemoryMetadataStore::new();
        let mut record = job(JobStatus::Pending);
        store.insert_job(&record).await.unwrap();

        record.status = JobStatus::Running;
        record.version = 1;
        store.update_job(&record, 0).await.unwrap();

        // A writer that still holds version 0 loses.
        record.status = JobStatus::Completed;
        let err = store.update_job(&record, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 0, found: 1, .. }));
    }

    #[tokio::test]
    async fn record_failure_is_atomic_across_rows() {
        let store = MemoryMetadataStore::new();
        let mut record = job(JobStatus::Running);
        store.insert_job(&record).await.unwrap();

        let now = Utc::now();
        record.status = JobStatus::Retrying;
        record.retry_count = 1;
        record.version = 1;
        store
            .record_failure(FailureWrite {
                job: record.clone(),
                expected_version: 0,
                attempt: Some(RetryAttempt {
                    job_id: record.id,
                    attempt_number: 1,
                    started_at: now,
                    failed_at: now,
                    error_message: "boom".to_string(),
                    error_traceback: None,
                    next_retry_at: Some(now + chrono::Duration::seconds(2)),
                }),
                dead_letter: None,
            })
            .await
            .unwrap();

        let attempts = store.attempts(record.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(store.job(record.id).await.unwrap().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn schedule_names_are_unique() {
        let store = MemoryMetadataStore::new();
        let schedule = ScheduleRecord {
            id: ScheduleId::new(),
            name: "nightly".to_string(),
            job_type: "scrape_website".to_string(),
            cron_expression: "0 0 * * *".to_string(),
            payload: serde_json::Map::new(),
            priority: Priority::Low,
            is_active: true,
            last_run_at: None,
            next_run_at: Utc::now(),
            created_at: Utc::now(),
        };
        store.insert_schedule(&schedule).await.unwrap();

        let mut twin = schedule.clone();
        twin.id = ScheduleId::new();
        assert!(matches!(
            store.insert_schedule(&twin).await,
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn lease_excludes_other_owners_until_expiry() {
        let store = MemoryMetadataStore::new();
        let now = Utc::now();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("scheduler", "a", ttl, now).await.unwrap());
        assert!(!store.try_acquire_lease("scheduler", "b", ttl, now).await.unwrap());
        // The holder refreshes freely.
        assert!(store.try_acquire_lease("scheduler", "a", ttl, now).await.unwrap());
        // After expiry anyone may take over.
        let later = now + chrono::Duration::seconds(120);
        assert!(store.try_acquire_lease("scheduler", "b", ttl, later).await.unwrap());
    }

    #[tokio::test]
    async fn broker_orders_by_priority_then_fifo() {
        let broker = MemoryBroker::new();
        broker.declare_topology().await.unwrap();
        let queue = Priority::Medium.queue_name();

        for (body, priority) in [(b"low-1".to_vec(), 1), (b"low-2".to_vec(), 1), (b"high".to_vec(), 10)] {
            broker
                .publish(queue, body, PublishOptions { priority, delay: None })
                .await
                .unwrap();
        }

        let wait = Duration::from_millis(10);
        let first = broker.dequeue(&[queue], wait).await.unwrap().unwrap();
        let second = broker.dequeue(&[queue], wait).await.unwrap().unwrap();
        let third = broker.dequeue(&[queue], wait).await.unwrap().unwrap();
        assert_eq!(first.body, b"high");
        assert_eq!(second.body, b"low-1");
        assert_eq!(third.body, b"low-2");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_messages_stay_invisible_until_ready() {
        let broker = MemoryBroker::new();
        broker.declare_topology().await.unwrap();
        let queue = Priority::High.queue_name();

        broker
            .publish(
                queue,
                b"later".to_vec(),
                PublishOptions {
                    priority: 10,
                    delay: Some(Duration::from_secs(30)),
                },
            )
            .await
            .unwrap();

        assert!(broker
            .dequeue(&[queue], Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());

        // Once the hold elapses the message becomes visible.
        let delivery = broker
            .dequeue(&[queue], Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"later");
    }

    #[tokio::test]
    async fn reject_without_requeue_routes_to_the_dead_letter_queue() {
        let broker = MemoryBroker::new();
        broker.declare_topology().await.unwrap();
        let queue = Priority::Low.queue_name();

        broker
            .publish(queue, b"poison".to_vec(), PublishOptions { priority: 1, delay: None })
            .await
            .unwrap();
        let delivery = broker
            .dequeue(&[queue], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker.reject(&delivery, false).await.unwrap();

        assert_eq!(broker.queue_depth(queue).await.unwrap(), 0);
        assert_eq!(broker.queue_depth(DEAD_LETTER_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recover_unacked_redelivers_in_flight_messages() {
        let broker = MemoryBroker::new();
        broker.declare_topology().await.unwrap();
        let queue = Priority::Medium.queue_name();

        broker
            .publish(queue, b"work".to_vec(), PublishOptions { priority: 5, delay: None })
            .await
            .unwrap();
        let delivery = broker
            .dequeue(&[queue], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!delivery.redelivered);

        // Consumer crashes without acking.
        assert_eq!(broker.recover_unacked().await, 1);
        let redelivery = broker
            .dequeue(&[queue], Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(redelivery.redelivered);
        assert_eq!(redelivery.body, b"work");

        // The old receipt is dead.
        assert!(matches!(
            broker.ack(&delivery).await,
            Err(BrokerError::StaleReceipt { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = MemoryStatusCache::new();
        let id = JobId::new();
        cache
            .set_status(id, JobStatus::Pending, Duration::from_secs(10))
            .await
            .unwrap();
        cache.heartbeat("worker-1", Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.status(id).await.unwrap(), Some(JobStatus::Pending));
        assert_eq!(cache.active_workers().await.unwrap(), vec!["worker-1".to_string()]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.status(id).await.unwrap(), None);
        assert!(cache.active_workers().await.unwrap().is_empty());
    }
}
