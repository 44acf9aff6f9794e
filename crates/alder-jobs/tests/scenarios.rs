//! End-to-end scenarios over the in-memory backends: a full stack of
//! lifecycle manager, retry controller, worker runtime, scheduler, and
//! reconciler wired together the way a deployment would wire them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alder_core::{
    Envelope, JobId, JobStatus, MemoryBroker, MemoryMetadataStore, MemoryStatusCache,
    MessageBroker, MetadataStore, Priority, PublishOptions, DEAD_LETTER_QUEUE,
};
use alder_jobs::{
    Handler, HandlerFailure, HandlerRegistry, JobSpec, Lifecycle, RetryController, RetryPolicies,
    ScheduleSpec, Scheduler, TypeRegistry, WorkerConfig, WorkerRuntime,
};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Records every invocation; fails the first `failures` times.
struct FlakyHandler {
    failures: AtomicU32,
    error: &'static str,
    seen: Arc<Mutex<Vec<String>>>,
}

impl FlakyHandler {
    fn new(failures: u32, error: &'static str, seen: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            error,
            seen,
        }
    }

    fn succeeding(seen: Arc<Mutex<Vec<String>>>) -> Self {
        Self::new(0, "unused", seen)
    }
}

#[async_trait]
impl Handler for FlakyHandler {
    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    async fn run(&self, payload: &Map<String, Value>) -> Result<Value, HandlerFailure> {
        let marker = payload
            .get("marker")
            .and_then(Value::as_str)
            .unwrap_or("unmarked")
            .to_string();
        self.seen.lock().await.push(marker);

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(HandlerFailure::new(self.error).with_trace("handler backtrace"));
        }
        Ok(json!({ "status": "done" }))
    }
}

/// Validates like a real business handler would.
struct StrictEmailHandler;

#[async_trait]
impl Handler for StrictEmailHandler {
    fn required_fields(&self) -> &'static [&'static str] {
        &["to", "subject", "body"]
    }

    async fn run(&self, _payload: &Map<String, Value>) -> Result<Value, HandlerFailure> {
        Ok(json!({ "status": "sent" }))
    }
}

struct Stack {
    store: Arc<MemoryMetadataStore>,
    broker: Arc<MemoryBroker>,
    cache: Arc<MemoryStatusCache>,
    lifecycle: Arc<Lifecycle>,
    retry: Arc<RetryController>,
}

fn stack() -> Stack {
    let store = Arc::new(MemoryMetadataStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let cache = Arc::new(MemoryStatusCache::new());
    let policies = RetryPolicies::default();
    let registry = TypeRegistry::from_policies(&policies);
    let lifecycle = Arc::new(Lifecycle::new(
        store.clone(),
        broker.clone(),
        cache.clone(),
        registry,
    ));
    let retry = Arc::new(RetryController::new(
        store.clone(),
        broker.clone(),
        policies,
    ));
    Stack {
        store,
        broker,
        cache,
        lifecycle,
        retry,
    }
}

fn spawn_worker(
    stack: &Stack,
    handlers: HandlerRegistry,
) -> (watch::Sender<bool>, JoinHandle<alder_jobs::Result<()>>) {
    let (tx, rx) = watch::channel(false);
    let worker = Arc::new(WorkerRuntime::new(
        stack.lifecycle.clone(),
        stack.retry.clone(),
        stack.broker.clone(),
        stack.cache.clone(),
        handlers,
        WorkerConfig {
            worker_id: Some("worker-1".to_string()),
            poll_wait: Duration::from_millis(50),
            ..WorkerConfig::default()
        },
    ));
    let handle = tokio::spawn(worker.run(rx));
    (tx, handle)
}

async fn wait_for_status(store: &Arc<MemoryMetadataStore>, id: JobId, status: JobStatus) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let job = store.job(id).await.unwrap().unwrap();
            if job.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {status}"));
}

async fn stop_worker(tx: watch::Sender<bool>, handle: JoinHandle<alder_jobs::Result<()>>) {
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

fn email_payload(marker: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("to".into(), json!("a@b"));
    payload.insert("subject".into(), json!("x"));
    payload.insert("body".into(), json!("y"));
    payload.insert("marker".into(), json!(marker));
    payload
}

#[tokio::test(start_paused = true)]
async fn simple_success_walks_straight_to_completed() {
    let stack = stack();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers =
        HandlerRegistry::new().register("send_email", FlakyHandler::succeeding(seen.clone()));

    let id = stack
        .lifecycle
        .submit(
            JobSpec::new("send_email")
                .priority(Priority::High)
                .max_retries(3)
                .payload(email_payload("s1")),
        )
        .await
        .unwrap();

    let (tx, handle) = spawn_worker(&stack, handlers);
    wait_for_status(&stack.store, id, JobStatus::Completed).await;
    stop_worker(tx, handle).await;

    assert_eq!(*seen.lock().await, vec!["s1".to_string()]);
    assert!(stack.store.attempts(id).await.unwrap().is_empty());
    assert!(stack.store.dead_letter(id).await.unwrap().is_none());
    for queue in ["jobs.high", "jobs.medium", "jobs.low", DEAD_LETTER_QUEUE] {
        assert_eq!(stack.broker.queue_depth(queue).await.unwrap(), 0, "{queue}");
    }
}

#[tokio::test(start_paused = true)]
async fn one_failure_then_success_records_a_single_attempt() {
    let stack = stack();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers = HandlerRegistry::new().register(
        "send_email",
        FlakyHandler::new(1, "smtp connection timeout", seen.clone()),
    );

    let id = stack
        .lifecycle
        .submit(JobSpec::new("send_email").payload(email_payload("s2")))
        .await
        .unwrap();

    let (tx, handle) = spawn_worker(&stack, handlers);
    wait_for_status(&stack.store, id, JobStatus::Completed).await;
    stop_worker(tx, handle).await;

    assert_eq!(seen.lock().await.len(), 2);

    let job = stack.store.job(id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 1);

    let attempts = stack.store.attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].error_message, "smtp connection timeout");
    assert_eq!(attempts[0].error_traceback.as_deref(), Some("handler backtrace"));
    // First-retry backoff for send_email is 2s ± 20%, rounded.
    let delay = attempts[0].next_retry_at.unwrap() - attempts[0].failed_at;
    assert!(delay >= chrono::Duration::seconds(1) && delay <= chrono::Duration::seconds(3));

    assert!(stack.store.dead_letter(id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn exhausting_the_budget_quarantines_with_history() {
    let stack = stack();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers =
        HandlerRegistry::new().register("send_email", FlakyHandler::new(u32::MAX, "boom", seen));

    let id = stack
        .lifecycle
        .submit(
            JobSpec::new("send_email")
                .max_retries(2)
                .payload(email_payload("s3")),
        )
        .await
        .unwrap();

    let (tx, handle) = spawn_worker(&stack, handlers);
    wait_for_status(&stack.store, id, JobStatus::Failed).await;
    stop_worker(tx, handle).await;

    let attempts = stack.store.attempts(id).await.unwrap();
    assert_eq!(
        attempts.iter().map(|a| a.attempt_number).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert!(attempts.iter().all(|a| a.error_message == "boom"));

    let job = stack.store.job(id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 2);
    assert!(job.completed_at.is_some());

    let dead_letter = stack.store.dead_letter(id).await.unwrap().unwrap();
    assert_eq!(dead_letter.total_attempts, 2);
    assert_eq!(dead_letter.failure_reason, "boom");
    assert_eq!(dead_letter.all_error_messages, vec!["boom", "boom"]);
}

#[tokio::test(start_paused = true)]
async fn high_priority_jumps_the_queue() {
    let stack = stack();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers =
        HandlerRegistry::new().register("send_email", FlakyHandler::succeeding(seen.clone()));

    // Enqueued in order: low, low, high — all before the worker starts.
    let low_1 = stack
        .lifecycle
        .submit(
            JobSpec::new("send_email")
                .priority(Priority::Low)
                .payload(email_payload("low-1")),
        )
        .await
        .unwrap();
    let low_2 = stack
        .lifecycle
        .submit(
            JobSpec::new("send_email")
                .priority(Priority::Low)
                .payload(email_payload("low-2")),
        )
        .await
        .unwrap();
    let high = stack
        .lifecycle
        .submit(
            JobSpec::new("send_email")
                .priority(Priority::High)
                .payload(email_payload("high")),
        )
        .await
        .unwrap();

    let (tx, handle) = spawn_worker(&stack, handlers);
    for id in [low_1, low_2, high] {
        wait_for_status(&stack.store, id, JobStatus::Completed).await;
    }
    stop_worker(tx, handle).await;

    let order = seen.lock().await.clone();
    let position = |marker: &str| order.iter().position(|m| m == marker).unwrap();
    assert!(
        position("high") < position("low-2"),
        "high-priority job ran after the second low-priority job: {order:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn crash_after_mark_running_redelivers_to_the_same_outcome() {
    let stack = stack();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let id = stack
        .lifecycle
        .submit(JobSpec::new("send_email").payload(email_payload("s6")))
        .await
        .unwrap();

    // A doomed worker takes the delivery, marks the job running, and dies
    // before the handler commits anything.
    let queues = ["jobs.high", "jobs.medium", "jobs.low"];
    let delivery = stack
        .broker
        .dequeue(&queues, Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    stack.lifecycle.mark_running(id, "worker-doomed").await.unwrap();
    drop(delivery);
    assert_eq!(stack.broker.recover_unacked().await, 1);

    // A healthy worker picks up the redelivery; the job is still Running so
    // the transition is absorbed and the handler simply runs.
    let handlers =
        HandlerRegistry::new().register("send_email", FlakyHandler::succeeding(seen.clone()));
    let (tx, handle) = spawn_worker(&stack, handlers);
    wait_for_status(&stack.store, id, JobStatus::Completed).await;
    stop_worker(tx, handle).await;

    assert_eq!(seen.lock().await.len(), 1);
    assert!(stack.store.attempts(id).await.unwrap().is_empty());
    let job = stack.store.job(id).await.unwrap().unwrap();
    assert_eq!(job.worker_id.as_deref(), Some("worker-doomed"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_after_completion_is_absorbed() {
    let stack = stack();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers =
        HandlerRegistry::new().register("send_email", FlakyHandler::succeeding(seen.clone()));

    let id = stack
        .lifecycle
        .submit(JobSpec::new("send_email").payload(email_payload("dup")))
        .await
        .unwrap();

    let (tx, handle) = spawn_worker(&stack, handlers);
    wait_for_status(&stack.store, id, JobStatus::Completed).await;

    // A stale duplicate of the same envelope arrives after completion.
    let job = stack.store.job(id).await.unwrap().unwrap();
    stack
        .broker
        .publish(
            job.priority.queue_name(),
            Envelope::for_job(&job).to_bytes().unwrap(),
            PublishOptions {
                priority: job.priority.broker_priority(),
                delay: None,
            },
        )
        .await
        .unwrap();

    // The duplicate drains without re-running the handler.
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if stack.broker.queue_depth("jobs.medium").await.unwrap() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap();
    stop_worker(tx, handle).await;

    assert_eq!(seen.lock().await.len(), 1);
    assert_eq!(
        stack.store.job(id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn missing_payload_fields_consume_the_retry_budget() {
    let stack = stack();
    let handlers = HandlerRegistry::new().register("send_email", StrictEmailHandler);

    let id = stack
        .lifecycle
        .submit(JobSpec::new("send_email").max_retries(1))
        .await
        .unwrap();

    let (tx, handle) = spawn_worker(&stack, handlers);
    wait_for_status(&stack.store, id, JobStatus::Failed).await;
    stop_worker(tx, handle).await;

    let attempts = stack.store.attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].error_message.contains("missing required fields"));
    assert!(stack.store.dead_letter(id).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn unhandled_job_types_are_quarantined_as_poison() {
    let stack = stack();
    // The worker only knows send_email; a process_video job is poison here.
    let handlers = HandlerRegistry::new().register(
        "send_email",
        FlakyHandler::succeeding(Arc::new(Mutex::new(Vec::new()))),
    );

    let id = stack
        .lifecycle
        .submit(JobSpec::new("process_video"))
        .await
        .unwrap();

    let (tx, handle) = spawn_worker(&stack, handlers);
    wait_for_status(&stack.store, id, JobStatus::Failed).await;
    stop_worker(tx, handle).await;

    let dead_letter = stack.store.dead_letter(id).await.unwrap().unwrap();
    assert!(dead_letter.failure_reason.contains("unregistered job type"));
    // The raw message went to the broker's dead-letter queue as well.
    assert_eq!(stack.broker.queue_depth(DEAD_LETTER_QUEUE).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn undecodable_messages_go_to_the_broker_dead_letter_queue() {
    let stack = stack();
    stack.broker.declare_topology().await.unwrap();
    stack
        .broker
        .publish(
            "jobs.medium",
            b"not json at all".to_vec(),
            PublishOptions {
                priority: 5,
                delay: None,
            },
        )
        .await
        .unwrap();

    let handlers = HandlerRegistry::new().register(
        "send_email",
        FlakyHandler::succeeding(Arc::new(Mutex::new(Vec::new()))),
    );
    let (tx, handle) = spawn_worker(&stack, handlers);
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if stack.broker.queue_depth(DEAD_LETTER_QUEUE).await.unwrap() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap();
    stop_worker(tx, handle).await;

    assert_eq!(stack.store.status_counts().await.unwrap().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn far_future_submissions_never_touch_the_queues() {
    let stack = stack();
    let id = stack
        .lifecycle
        .submit(
            JobSpec::new("send_email")
                .scheduled_for(chrono::Utc::now() + chrono::Duration::days(365)),
        )
        .await
        .unwrap();

    for queue in ["jobs.high", "jobs.medium", "jobs.low"] {
        assert_eq!(stack.broker.queue_depth(queue).await.unwrap(), 0);
    }
    assert_eq!(
        stack.store.job(id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test(start_paused = true)]
async fn scheduler_emissions_execute_without_job_rows() {
    let stack = stack();
    let policies = RetryPolicies::default();
    let scheduler = Scheduler::new(
        stack.store.clone(),
        stack.broker.clone(),
        TypeRegistry::from_policies(&policies),
    );
    stack.broker.declare_topology().await.unwrap();

    let schedule_id = scheduler
        .create_schedule(
            ScheduleSpec::new("marketing-blast", "send_email", "*/5 * * * *")
                .payload(email_payload("scheduled")),
        )
        .await
        .unwrap();

    // Make it overdue, then run one pass.
    let mut record = stack.store.schedule(schedule_id).await.unwrap().unwrap();
    record.next_run_at = chrono::Utc::now() - chrono::Duration::hours(1);
    stack.store.update_schedule(&record).await.unwrap();
    assert_eq!(scheduler.poll_once().await.unwrap(), 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers =
        HandlerRegistry::new().register("send_email", FlakyHandler::succeeding(seen.clone()));
    let (tx, handle) = spawn_worker(&stack, handlers);
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if seen.lock().await.len() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap();
    stop_worker(tx, handle).await;

    // The emission left no job row behind; its audit trail is the schedule.
    assert_eq!(stack.store.status_counts().await.unwrap().total(), 0);
    let record = stack.store.schedule(schedule_id).await.unwrap().unwrap();
    assert!(record.last_run_at.is_some());
    assert!(record.next_run_at > chrono::Utc::now());
}
