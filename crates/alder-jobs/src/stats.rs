//! Read-only statistics over the metadata store, cache, and broker.

use std::sync::Arc;

use alder_core::{
    JobId, JobStatus, MessageBroker, MetadataStore, Priority, QueueBreakdown, StatusCache,
    StatusCounts,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{JobError, Result};

/// A point-in-time view of the system, shaped for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Job counts by status.
    pub jobs: StatusCounts,
    /// Number of quarantined jobs.
    pub dead_letters: u64,
    /// Workers with a live heartbeat.
    pub active_workers: Vec<String>,
    /// Pending jobs by priority.
    pub pending_by_priority: QueueBreakdown,
    /// Visible messages per priority queue.
    pub queue_depths: QueueBreakdown,
}

/// Aggregates statistics for the monitoring surface. Strictly read-only.
pub struct StatsAggregator {
    store: Arc<dyn MetadataStore>,
    cache: Arc<dyn StatusCache>,
    broker: Arc<dyn MessageBroker>,
}

impl StatsAggregator {
    /// Create an aggregator over the given collaborators.
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cache: Arc<dyn StatusCache>,
        broker: Arc<dyn MessageBroker>,
    ) -> Self {
        Self {
            store,
            cache,
            broker,
        }
    }

    /// Collect a full snapshot.
    pub async fn snapshot(&self) -> Result<StatsSnapshot> {
        let jobs = self.store.status_counts().await?;
        let dead_letters = self.store.dead_letter_count().await?;
        let pending_by_priority = self.store.pending_by_priority().await?;

        // Worker liveness is ephemeral by design; a cache outage reads as
        // zero active workers rather than failing the whole snapshot.
        let active_workers = match self.cache.active_workers().await {
            Ok(workers) => workers,
            Err(error) => {
                warn!(%error, "could not read worker heartbeats");
                Vec::new()
            }
        };

        let mut queue_depths = QueueBreakdown::default();
        for priority in Priority::all_ordered() {
            *queue_depths.get_mut(priority) =
                self.broker.queue_depth(priority.queue_name()).await?;
        }

        Ok(StatsSnapshot {
            jobs,
            dead_letters,
            active_workers,
            pending_by_priority,
            queue_depths,
        })
    }

    /// Status of one job. The cache short-circuits the hot path; a miss
    /// falls through to the authoritative store and refreshes the mirror
    /// opportunistically.
    pub async fn job_status(&self, id: JobId) -> Result<JobStatus> {
        match self.cache.status(id).await {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(error) => warn!(job_id = %id, %error, "status cache read failed"),
        }

        let job = self
            .store
            .job(id)
            .await?
            .ok_or_else(|| JobError::JobNotFound { id: id.to_string() })?;
        if let Err(error) = self
            .cache
            .set_status(id, job.status, std::time::Duration::from_secs(3600))
            .await
        {
            warn!(job_id = %id, %error, "could not refresh status mirror");
        }
        Ok(job.status)
    }
}

#[cfg(test)]
mod tests {
    use alder_core::{MemoryBroker, MemoryMetadataStore, MemoryStatusCache};
    use std::time::Duration;

    use super::*;
    use crate::handler::TypeRegistry;
    use crate::job::JobSpec;
    use crate::lifecycle::Lifecycle;
    use crate::policy::RetryPolicies;

    #[tokio::test]
    async fn snapshot_reflects_submissions_and_heartbeats() {
        let store = Arc::new(MemoryMetadataStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(MemoryStatusCache::new());
        let lifecycle = Lifecycle::new(
            store.clone(),
            broker.clone(),
            cache.clone(),
            TypeRegistry::from_policies(&RetryPolicies::default()),
        );

        lifecycle.submit(JobSpec::new("send_email")).await.unwrap();
        lifecycle
            .submit(JobSpec::new("process_video").priority(alder_core::Priority::High))
            .await
            .unwrap();
        cache
            .heartbeat("worker-1", Duration::from_secs(60))
            .await
            .unwrap();

        let stats = StatsAggregator::new(store, cache, broker);
        let snapshot = stats.snapshot().await.unwrap();
        assert_eq!(snapshot.jobs.pending, 2);
        assert_eq!(snapshot.dead_letters, 0);
        assert_eq!(snapshot.active_workers, vec!["worker-1".to_string()]);
        assert_eq!(snapshot.pending_by_priority.high, 1);
        assert_eq!(snapshot.pending_by_priority.medium, 1);
        assert_eq!(snapshot.queue_depths.high, 1);
        assert_eq!(snapshot.queue_depths.medium, 1);
        assert_eq!(snapshot.queue_depths.low, 0);
    }

    #[tokio::test]
    async fn job_status_serves_cache_hits_and_store_misses() {
        let store = Arc::new(MemoryMetadataStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let cache = Arc::new(MemoryStatusCache::new());
        let lifecycle = Lifecycle::new(
            store.clone(),
            broker.clone(),
            cache.clone(),
            TypeRegistry::from_policies(&RetryPolicies::default()),
        );
        let id = lifecycle.submit(JobSpec::new("send_email")).await.unwrap();

        let stats = StatsAggregator::new(store.clone(), cache.clone(), broker);
        assert_eq!(stats.job_status(id).await.unwrap(), JobStatus::Pending);

        // Expired mirror: the store answer wins and the mirror refreshes.
        cache
            .set_status(id, JobStatus::Running, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(stats.job_status(id).await.unwrap(), JobStatus::Pending);

        assert!(matches!(
            stats.job_status(JobId::new()).await,
            Err(JobError::JobNotFound { .. })
        ));
    }
}
