//! Job submission specification.

use alder_core::Priority;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{JobError, Result};

/// Specification for submitting a new job.
///
/// Built with the chained setters and handed to
/// [`Lifecycle::submit`](crate::Lifecycle::submit), which validates it and
/// allocates the durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Type of job, used to route to the correct handler.
    pub job_type: String,
    /// Payload for the handler.
    pub payload: Map<String, Value>,
    /// Dispatch priority.
    pub priority: Priority,
    /// Retry budget. `None` takes the configured default.
    pub max_retries: Option<u32>,
    /// Earliest time the job may dispatch.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl JobSpec {
    /// Create a specification for the given job type.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: Map::new(),
            priority: Priority::default(),
            max_retries: None,
            scheduled_for: None,
        }
    }

    /// Set the payload map.
    pub fn payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize any value into the payload. Fails unless the value
    /// serializes to a JSON object.
    pub fn payload_json<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => {
                self.payload = map;
                Ok(self)
            }
            _ => Err(JobError::PayloadNotObject),
        }
    }

    /// Set the dispatch priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Defer dispatch until the given time.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}
