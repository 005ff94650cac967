//! Notification payloads mirrored to live observers.
//!
//! Serialized with an internal `type` tag so a websocket/SSE layer can forward them
//! verbatim:
//!
//! ```json
//! {"type":"job.status","job_id":"…","status":"running"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tidemark_core::{AccountId, JobId, JobStatus, LogLevel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    #[serde(rename = "job.status")]
    JobStatus { job_id: JobId, status: JobStatus },

    #[serde(rename = "job.progress")]
    JobProgress {
        job_id: JobId,
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },

    #[serde(rename = "log")]
    Log {
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        meta: Option<JsonValue>,
    },

    /// An activity connector (issue tracker, wiki) finished upserting a batch.
    #[serde(rename = "activity.sync")]
    ActivitySync {
        source: String,
        account_id: AccountId,
        synced_events: usize,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "calendar.sync")]
    CalendarSync {
        account_id: AccountId,
        calendars: usize,
        synced_events: usize,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    /// Job this notification is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Notification::JobStatus { job_id, .. } | Notification::JobProgress { job_id, .. } => {
                Some(*job_id)
            }
            _ => None,
        }
    }
}
