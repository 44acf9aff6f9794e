//! Worker runtime: consumes queues, invokes handlers, drives the lifecycle.
//!
//! A worker is a long-lived process with a fixed id. It heartbeats to the
//! status cache on an independent timer (a slow handler never starves it),
//! and runs one consumer loop per channel, each processing a single
//! delivery at a time. Deliveries are acknowledged only after the outcome
//! is durable in the metadata store; anything else returns to the queue
//! for redelivery.

use std::sync::Arc;
use std::time::Duration;

use alder_core::{Delivery, Envelope, MessageBroker, Priority, StatusCache};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::handler::{Handler, HandlerFailure, HandlerRegistry};
use crate::lifecycle::{Lifecycle, MarkOutcome};
use crate::retry::RetryController;

/// Configuration for a worker runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker id; generated when not provided.
    pub worker_id: Option<String>,
    /// Number of consumer channels. Each channel holds at most one
    /// unacknowledged delivery, so this bounds the in-flight window.
    pub channels: usize,
    /// How long a dequeue waits for a message before polling again.
    pub poll_wait: Duration,
    /// Interval between heartbeat refreshes.
    pub heartbeat_interval: Duration,
    /// TTL attached to each heartbeat.
    pub heartbeat_ttl: Duration,
    /// Grace period for in-flight work on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            channels: 1,
            poll_wait: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_ttl: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Bounded exponential backoff for reconnect loops.
struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl ReconnectBackoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, next: base }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }

    fn reset(&mut self) {
        self.next = self.base;
    }
}

/// A long-lived consumer of the job queues.
pub struct WorkerRuntime {
    id: String,
    lifecycle: Arc<Lifecycle>,
    retry: Arc<RetryController>,
    broker: Arc<dyn MessageBroker>,
    cache: Arc<dyn StatusCache>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl WorkerRuntime {
    /// Create a worker over the given collaborators and handler set.
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        retry: Arc<RetryController>,
        broker: Arc<dyn MessageBroker>,
        cache: Arc<dyn StatusCache>,
        handlers: HandlerRegistry,
        config: WorkerConfig,
    ) -> Self {
        let id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        Self {
            id,
            lifecycle,
            retry,
            broker,
            cache,
            handlers: Arc::new(handlers),
            config,
        }
    }

    /// The worker's fixed id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until the shutdown flag flips.
    ///
    /// On shutdown the consumer channels stop taking new deliveries and the
    /// in-flight ones get the configured grace period to finish; whatever
    /// remains is abandoned for the broker to redeliver.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker_id = %self.id,
            handlers = ?self.handlers.types(),
            channels = self.config.channels.max(1),
            "worker starting"
        );

        // Bounded backoff on the initial broker handshake; a broker that
        // stays down past the budget fails the whole worker.
        let mut startup = ReconnectBackoff::new(Duration::from_millis(500), Duration::from_secs(10));
        let mut attempt = 0;
        loop {
            match self.broker.declare_topology().await {
                Ok(()) => break,
                Err(error) => {
                    attempt += 1;
                    if attempt >= 5 {
                        return Err(error.into());
                    }
                    warn!(worker_id = %self.id, %error, "broker unavailable at startup; backing off");
                    tokio::time::sleep(startup.next_delay()).await;
                }
            }
        }

        let mut tasks = JoinSet::new();
        {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.heartbeat_loop(shutdown).await });
        }
        for channel in 0..self.config.channels.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.channel_loop(channel, shutdown).await });
        }

        tokio::select! {
            _ = signalled(shutdown.clone()) => {}
            _ = async {
                while tasks.join_next().await.is_some() {}
            } => {
                warn!(worker_id = %self.id, "all worker tasks exited before shutdown was requested");
                return Ok(());
            }
        }

        debug!(worker_id = %self.id, "worker draining in-flight work");
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                worker_id = %self.id,
                grace_secs = self.config.shutdown_grace.as_secs(),
                "shutdown grace elapsed; abandoning in-flight work for redelivery"
            );
            tasks.shutdown().await;
        }

        info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    /// Refresh the liveness key on its own timer.
    async fn heartbeat_loop(&self, shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(error) = self
                .cache
                .heartbeat(&self.id, self.config.heartbeat_ttl)
                .await
            {
                warn!(worker_id = %self.id, %error, "failed to send heartbeat");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = signalled(shutdown.clone()) => break,
            }
        }
        debug!(worker_id = %self.id, "heartbeat loop stopped");
    }

    /// Consume deliveries until shutdown, highest-priority queues first.
    async fn channel_loop(&self, channel: usize, shutdown: watch::Receiver<bool>) {
        let queues: Vec<&'static str> = Priority::all_ordered()
            .iter()
            .map(|p| p.queue_name())
            .collect();
        let mut reconnect =
            ReconnectBackoff::new(Duration::from_millis(500), Duration::from_secs(30));
        debug!(worker_id = %self.id, channel, "consumer channel started");

        while !*shutdown.borrow() {
            match self.broker.dequeue(&queues, self.config.poll_wait).await {
                Ok(Some(delivery)) => {
                    reconnect.reset();
                    if let Err(error) = self.process_delivery(delivery).await {
                        warn!(
                            worker_id = %self.id,
                            channel,
                            %error,
                            "delivery hit an infrastructure error; backing off"
                        );
                        tokio::time::sleep(reconnect.next_delay()).await;
                    }
                }
                Ok(None) => {
                    reconnect.reset();
                }
                Err(error) => {
                    warn!(worker_id = %self.id, channel, %error, "dequeue failed; backing off");
                    tokio::time::sleep(reconnect.next_delay()).await;
                }
            }
        }
        debug!(worker_id = %self.id, channel, "consumer channel stopped");
    }

    /// Handle one delivery end to end.
    async fn process_delivery(&self, delivery: Delivery) -> Result<()> {
        let envelope = match Envelope::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(
                    worker_id = %self.id,
                    queue = %delivery.queue,
                    %error,
                    "rejecting undecodable message"
                );
                self.broker.reject(&delivery, false).await?;
                return Ok(());
            }
        };
        let job_id = envelope.parsed_job_id();

        let Some(handler) = self.handlers.get(&envelope.job_type) else {
            return self.quarantine_unhandled(&delivery, &envelope).await;
        };

        // A terminal status discovered here means the message is stale:
        // acknowledge and walk away.
        let tracked = match job_id {
            Some(id) => match self.lifecycle.mark_running(id, &self.id).await {
                Ok(MarkOutcome::Applied) => Some(id),
                Ok(MarkOutcome::Ignored(status)) if status.is_terminal() => {
                    info!(job_id = %id, %status, "stale delivery for terminal job; acknowledging");
                    self.broker.ack(&delivery).await?;
                    return Ok(());
                }
                Ok(MarkOutcome::Ignored(_)) => Some(id),
                Ok(MarkOutcome::MissingRow) => {
                    debug!(job_id = %envelope.job_id, "no job row; executing without lifecycle tracking");
                    None
                }
                Err(error) => {
                    warn!(job_id = %id, %error, "could not mark job running; requeueing");
                    self.broker.reject(&delivery, true).await?;
                    return Err(error);
                }
            },
            None => None,
        };

        match self.invoke(handler.as_ref(), &envelope).await {
            Ok(_result) => {
                if let Some(id) = tracked {
                    if let Err(error) = self.lifecycle.mark_completed(id).await {
                        warn!(job_id = %id, %error, "could not record completion; requeueing");
                        self.broker.reject(&delivery, true).await?;
                        return Err(error);
                    }
                }
                self.broker.ack(&delivery).await?;
                info!(
                    worker_id = %self.id,
                    job_id = %envelope.job_id,
                    job_type = %envelope.job_type,
                    "job completed"
                );
            }
            Err(failure) => match tracked {
                Some(id) => match self.retry.handle_failure(id, &failure).await {
                    Ok(disposition) => {
                        debug!(job_id = %id, ?disposition, "failure recorded");
                        self.broker.ack(&delivery).await?;
                    }
                    Err(error) => {
                        warn!(job_id = %id, %error, "could not record failure; requeueing");
                        self.broker.reject(&delivery, true).await?;
                        return Err(error);
                    }
                },
                None => {
                    warn!(
                        job_id = %envelope.job_id,
                        error = %failure.message,
                        "untracked job failed; dropping"
                    );
                    self.broker.ack(&delivery).await?;
                }
            },
        }
        Ok(())
    }

    /// Quarantine a message whose type has no registered handler. With
    /// uniform handler registration no peer can process it either, so it is
    /// terminal: record the dead letter and route the raw message to the
    /// broker's dead-letter queue.
    async fn quarantine_unhandled(&self, delivery: &Delivery, envelope: &Envelope) -> Result<()> {
        let reason = format!("unregistered job type: {}", envelope.job_type);
        warn!(
            worker_id = %self.id,
            job_id = %envelope.job_id,
            job_type = %envelope.job_type,
            "no handler for job type; quarantining"
        );
        if let Some(id) = envelope.parsed_job_id() {
            match self.retry.quarantine_poison(id, &reason).await {
                Ok(_) => {}
                Err(JobError::JobNotFound { .. }) => {
                    debug!(job_id = %id, "poison message has no job row");
                }
                Err(error) if error.is_retryable() => {
                    warn!(job_id = %id, %error, "could not record poison quarantine; requeueing");
                    self.broker.reject(delivery, true).await?;
                    return Err(error);
                }
                Err(error) => {
                    warn!(job_id = %id, %error, "poison quarantine not recorded");
                }
            }
        }
        self.broker.reject(delivery, false).await?;
        Ok(())
    }

    /// Validate required payload keys, then run the handler.
    async fn invoke(
        &self,
        handler: &dyn Handler,
        envelope: &Envelope,
    ) -> std::result::Result<Value, HandlerFailure> {
        let missing: Vec<&str> = handler
            .required_fields()
            .iter()
            .copied()
            .filter(|field| !envelope.payload.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(HandlerFailure::bad_payload(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        handler.run(&envelope.payload).await
    }
}

/// Resolve when the shutdown flag flips to `true` (or the sender is gone).
async fn signalled(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
