//! Per-type retry policies and backoff computation.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

/// Retry policy for one job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubles on each subsequent attempt.
    pub base_delay: Duration,
    /// Ceiling on any computed delay.
    pub max_delay: Duration,
    /// Default retry budget for jobs of this type.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Convenience constructor with whole-second fields.
    pub fn new(base_delay_secs: u64, max_delay_secs: u64, max_retries: u32) -> Self {
        Self {
            base_delay: Duration::from_secs(base_delay_secs),
            max_delay: Duration::from_secs(max_delay_secs),
            max_retries,
        }
    }
}

/// The retry-policy table, keyed by job type. Static for the lifetime of a
/// process; the defaults cover the built-in job kinds.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    by_type: HashMap<String, RetryPolicy>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let mut by_type = HashMap::new();
        by_type.insert("send_email".to_string(), RetryPolicy::new(2, 300, 3));
        by_type.insert("process_video".to_string(), RetryPolicy::new(5, 3600, 5));
        by_type.insert("scrape_website".to_string(), RetryPolicy::new(10, 600, 3));
        Self { by_type }
    }
}

impl RetryPolicies {
    /// An empty table. Types without a policy quarantine on first failure.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
        }
    }

    /// Add or replace the policy for a job type.
    pub fn insert(&mut self, job_type: impl Into<String>, policy: RetryPolicy) -> &mut Self {
        self.by_type.insert(job_type.into(), policy);
        self
    }

    /// Look up the policy for a job type.
    pub fn get(&self, job_type: &str) -> Option<&RetryPolicy> {
        self.by_type.get(job_type)
    }

    /// Iterate over the configured job types.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }
}

/// Maximum fraction a delay is randomised up or down.
const JITTER_FRACTION: f64 = 0.2;

/// Compute the backoff delay for a retry.
///
/// `attempt` is the 1-based number of the attempt that just failed. The
/// delay doubles per attempt starting from the policy's base, carries ±20%
/// jitter to de-synchronise retrying peers, and never exceeds the policy's
/// ceiling.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    backoff_delay_with_jitter(policy, attempt, jitter)
}

/// Backoff computation with the jitter factor supplied by the caller.
/// `jitter` is expected in `[-0.2, 0.2]`.
pub fn backoff_delay_with_jitter(policy: &RetryPolicy, attempt: u32, jitter: f64) -> Duration {
    debug_assert!(attempt >= 1, "attempt numbers are 1-based");
    // Past 2^32 the cap has long since taken over; clamp the exponent so the
    // f64 arithmetic stays finite.
    let exponent = attempt.saturating_sub(1).min(32);
    let raw = policy.base_delay.as_secs_f64() * f64::powi(2.0, exponent as i32);
    let jittered = raw * (1.0 + jitter);
    let capped = jittered.min(policy.max_delay.as_secs_f64());
    Duration::from_secs(capped.round().max(0.0) as u64)
}
