//! Background reconciler for jobs that fell off the queues.
//!
//! Two gaps can leave a durable row with no matching queue message: a crash
//! after the retry decision committed but before the delayed re-publish,
//! and a submit whose broker publish failed after the insert. The
//! reconciler periodically scans for both shapes and republishes. It also
//! releases deferred submissions whose `scheduled_for` has arrived, since
//! the submit path deliberately publishes nothing for them.
//!
//! Republication is at-least-once: a message that was merely slow to be
//! consumed may end up duplicated, and the lifecycle preconditions absorb
//! the duplicate on delivery.

use std::sync::Arc;
use std::time::Duration;

use alder_core::{Envelope, JobRecord, MessageBroker, MetadataStore, PublishOptions};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to scan.
    pub interval: Duration,
    /// How long a row must have been queue-less before it is republished.
    /// Generous enough that ordinary consumer lag never trips it.
    pub stale_after: Duration,
    /// Upper bound on republications per scan.
    pub batch: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            batch: 100,
        }
    }
}

/// Scans for orphaned jobs and puts them back on their queues.
pub struct Reconciler {
    store: Arc<dyn MetadataStore>,
    broker: Arc<dyn MessageBroker>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a reconciler with default configuration.
    pub fn new(store: Arc<dyn MetadataStore>, broker: Arc<dyn MessageBroker>) -> Self {
        Self::with_config(store, broker, ReconcilerConfig::default())
    }

    /// Create a reconciler with custom configuration.
    pub fn with_config(
        store: Arc<dyn MetadataStore>,
        broker: Arc<dyn MessageBroker>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    /// Run the scan loop until the shutdown flag flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "reconciler starting"
        );
        self.broker.declare_topology().await?;
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match self.scan_once().await {
                Ok(republished) if republished > 0 => {
                    info!(republished, "reconciler pass republished orphaned jobs");
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "reconciler pass failed; will retry next interval"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("reconciler stopped");
        Ok(())
    }

    /// One scan over both orphan shapes. Returns how many messages were
    /// republished.
    pub async fn scan_once(&self) -> Result<usize> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut republished = 0;

        let stuck_retrying = self.store.stale_retrying(cutoff, self.config.batch).await?;
        for job in &stuck_retrying {
            self.republish(job).await?;
            debug!(job_id = %job.id, "republished job stuck in retrying");
            republished += 1;
        }

        let remaining = self.config.batch.saturating_sub(republished);
        if remaining > 0 {
            let stuck_pending = self.store.stale_pending(now, cutoff, remaining).await?;
            for job in &stuck_pending {
                self.republish(job).await?;
                debug!(job_id = %job.id, "republished pending job with no queue presence");
                republished += 1;
            }
        }

        Ok(republished)
    }

    /// Publish a job's envelope immediately; any backoff delay it was owed
    /// has already elapsed.
    async fn republish(&self, job: &JobRecord) -> Result<()> {
        let body = Envelope::for_job(job).to_bytes()?;
        self.broker
            .publish(
                job.priority.queue_name(),
                body,
                PublishOptions {
                    priority: job.priority.broker_priority(),
                    delay: None,
                },
            )
            .await?;
        Ok(())
    }
}
