//! Canonical message envelope and queue topology names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{JobId, JobRecord};

/// Exchange that receives messages rejected without requeue.
pub const DEAD_LETTER_EXCHANGE: &str = "dlx";

/// Queue bound to the dead-letter exchange. Holds raw poison messages; the
/// application-level quarantine record lives in the metadata store.
pub const DEAD_LETTER_QUEUE: &str = "jobs.dlq";

/// The message body published for every dispatch.
///
/// `job_id` is a string rather than a [`JobId`] because scheduler emissions
/// carry synthetic identifiers of the form `scheduled-<schedule>-<unix>`
/// that have no corresponding job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identifier of the job, or a synthetic scheduler identifier.
    pub job_id: String,
    /// Registered kind, used to route to a handler.
    pub job_type: String,
    /// Opaque payload for the handler.
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope from parts.
    pub fn new(
        job_id: impl Into<String>,
        job_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            payload,
        }
    }

    /// Build the envelope for a persisted job.
    pub fn for_job(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.to_string(),
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
        }
    }

    /// Serialize to the wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Parse the identifier as a job row key. Returns `None` for synthetic
    /// scheduler identifiers.
    pub fn parsed_job_id(&self) -> Option<JobId> {
        self.job_id.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let mut payload = Map::new();
        payload.insert("to".into(), Value::String("a@b".into()));
        let envelope = Envelope::new(JobId::new().to_string(), "send_email", payload);
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(envelope, decoded);
        assert!(decoded.parsed_job_id().is_some());
    }

    #[test]
    fn synthetic_ids_do_not_parse_as_job_rows() {
        let envelope = Envelope::new("scheduled-abc-1700000000", "send_email", Map::new());
        assert!(envelope.parsed_job_id().is_none());
    }
}
