//! The handler contract and the registries that route jobs to code.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::policy::RetryPolicies;

/// How a handler invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The payload was missing required fields or otherwise malformed.
    /// Consumes the retry budget like any other failure.
    BadPayload,
    /// The handler raised during execution.
    Execution,
}

/// A structured handler failure: message, optional diagnostic trace, and a
/// kind for observability. The retry controller treats all kinds uniformly.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    /// Human-readable failure message.
    pub message: String,
    /// Stack trace or equivalent diagnostic, when the handler captured one.
    pub trace: Option<String>,
    /// Failure category.
    pub kind: FailureKind,
}

impl HandlerFailure {
    /// An execution failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
            kind: FailureKind::Execution,
        }
    }

    /// A payload-validation failure.
    pub fn bad_payload(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
            kind: FailureKind::BadPayload,
        }
    }

    /// Attach a diagnostic trace.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerFailure {}

/// Business logic for one job type.
///
/// Handlers are invoked with the raw payload and either return a result
/// value or raise a [`HandlerFailure`]. Delivery is at-least-once, so a
/// handler must tolerate seeing the same payload more than once.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Payload keys that must be present. Checked before [`Handler::run`];
    /// a missing key raises a `BadPayload` failure without invoking the
    /// handler.
    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Execute the job.
    async fn run(&self, payload: &Map<String, Value>) -> Result<Value, HandlerFailure>;
}

/// Maps job types to their handlers. Populated explicitly at worker
/// startup; lookup is by exact type name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register(mut self, job_type: impl Into<String>, handler: impl Handler) -> Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(job_type).cloned()
    }

    /// The registered job types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// The closed set of job kinds a deployment understands. Submissions with a
/// type outside this set are rejected before any row is written.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    kinds: BTreeSet<String>,
}

impl TypeRegistry {
    /// An empty registry (rejects every submission).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an iterator of kind names.
    pub fn with_kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from the job types carried by a retry-policy table.
    pub fn from_policies(policies: &RetryPolicies) -> Self {
        Self::with_kinds(policies.types())
    }

    /// Add a kind.
    pub fn register(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kinds.insert(kind.into());
        self
    }

    /// Whether a kind is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains(kind)
    }
}
