//! Distributed job queue core.
//!
//! This crate implements the four subsystems that make a job queue a job
//! queue:
//!
//! - **Lifecycle manager** ([`Lifecycle`]): submission and the job state
//!   machine, with durable rows, a best-effort status mirror, and
//!   priority-queue dispatch.
//! - **Retry controller** ([`RetryController`]): on every failure, retry
//!   with jittered exponential backoff or quarantine with a dead-letter
//!   record and a full attempt history.
//! - **Worker runtime** ([`WorkerRuntime`]): long-lived consumers that
//!   heartbeat, route deliveries to registered [`Handler`]s, and
//!   acknowledge only after the outcome is durable.
//! - **Scheduler** ([`Scheduler`]): materialises recurring work from
//!   5-field cron expressions, one emission per due schedule regardless of
//!   how many ticks were missed.
//!
//! A background [`Reconciler`] republishes jobs that fell off the queues,
//! and a [`StatsAggregator`] serves read-only counts to dashboards.
//!
//! Delivery is at-least-once end to end: handlers must tolerate replay,
//! and the lifecycle preconditions absorb duplicate deliveries.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use alder_core::{MemoryBroker, MemoryMetadataStore, MemoryStatusCache};
//! use alder_jobs::{
//!     Handler, HandlerRegistry, JobSpec, Lifecycle, RetryController, RetryPolicies,
//!     TypeRegistry, WorkerConfig, WorkerRuntime,
//! };
//!
//! let store = Arc::new(MemoryMetadataStore::new());
//! let broker = Arc::new(MemoryBroker::new());
//! let cache = Arc::new(MemoryStatusCache::new());
//! let policies = RetryPolicies::default();
//! let registry = TypeRegistry::from_policies(&policies);
//!
//! let lifecycle = Arc::new(Lifecycle::new(
//!     store.clone(), broker.clone(), cache.clone(), registry,
//! ));
//! let job_id = lifecycle.submit(JobSpec::new("send_email")).await?;
//!
//! let retry = Arc::new(RetryController::new(store, broker.clone(), policies));
//! let handlers = HandlerRegistry::new().register("send_email", EmailHandler);
//! let worker = Arc::new(WorkerRuntime::new(
//!     lifecycle, retry, broker, cache, handlers, WorkerConfig::default(),
//! ));
//! worker.run(shutdown_rx).await?;
//! ```

#![warn(missing_docs)]

mod error;
mod handler;
mod job;
mod lifecycle;
mod policy;
mod reconciler;
mod retry;
mod schedule;
mod scheduler;
mod stats;
mod worker;

pub use error::{JobError, JobErrorKind, Result};
pub use handler::{FailureKind, Handler, HandlerFailure, HandlerRegistry, TypeRegistry};
pub use job::JobSpec;
pub use lifecycle::{Lifecycle, LifecycleConfig, MarkOutcome, MAX_RETRIES_LIMIT};
pub use policy::{backoff_delay, backoff_delay_with_jitter, RetryPolicies, RetryPolicy};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use retry::{Disposition, RetryController};
pub use schedule::CronExpr;
pub use scheduler::{ScheduleSpec, Scheduler, SchedulerConfig};
pub use stats::{StatsAggregator, StatsSnapshot};
pub use worker::{WorkerConfig, WorkerRuntime};
