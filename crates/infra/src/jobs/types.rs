//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tidemark_core::{JobId, JobStatus, LogLevel};

/// Free-form JSON object used for payloads and results.
pub type JsonMap = serde_json::Map<String, JsonValue>;

/// Structured error attached to a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A background job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// Routing key for the handler registry, e.g. `connector.jira.sync`.
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fraction in `[0, 1]`, `None` until a handler reports progress.
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub payload: JsonMap,
    pub result: Option<JsonMap>,
    pub error: Option<JobFailure>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(job_type: impl Into<String>, payload: JsonMap) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            progress: None,
            message: None,
            payload,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(JsonValue::as_str)
    }

    pub fn payload_bool(&self, key: &str) -> bool {
        self.payload
            .get(key)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Merge a partial update, refreshing `updated_at`.
    ///
    /// The update is all-or-nothing: an illegal status change rejects every field,
    /// and a terminal row accepts no writes at all.
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), (JobStatus, JobStatus)> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err((self.status, next));
            }
        } else if self.status.is_terminal() {
            return Err((self.status, self.status));
        }

        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            self.progress = Some(progress.clamp(0.0, 1.0));
        }
        if let Some(message) = update.message {
            self.message = Some(message);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Partial update merged into a job row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub result: Option<JsonMap>,
    pub error: Option<JobFailure>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_result(mut self, result: JsonMap) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: JobFailure) -> Self {
        self.error = Some(error);
        self
    }
}

/// Append-only audit record for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub meta: Option<JsonValue>,
}
