//! Job lifecycle state machine.
//!
//! ```text
//! queued ──► running ──► succeeded
//!    │          ├──────► failed
//!    │          └──────► canceled
//!    └─────────────────► canceled
//! ```
//!
//! Terminal states are final: no transition leaves them.

use serde::{Deserialize, Serialize};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created and waiting for a worker slot.
    Queued,
    /// Handler is executing.
    Running,
    Succeeded,
    Failed,
    /// Cancel requested; the handler stops at its next checkpoint.
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Whether `self → next` is a legal lifecycle edge.
    ///
    /// Re-asserting the current non-terminal status is allowed (a no-op write).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Queued, Queued) | (Running, Running) => true,
            (Queued, Running) | (Queued, Canceled) => true,
            (Running, Succeeded) | (Running, Failed) | (Running, Canceled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to job events and log notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl core::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
