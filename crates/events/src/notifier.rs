//! Notification facade used by the job engine and connectors.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use tidemark_core::{JobId, JobStatus, LogLevel};

use crate::bus::{EventBus, Subscription};
use crate::in_memory_bus::{BusError, InMemoryEventBus};
use crate::notification::Notification;

/// Shared bus type carried by the notifier.
pub type SharedBus = Arc<dyn EventBus<Notification, Error = BusError>>;

/// Best-effort broadcaster.
///
/// Publishing problems are logged and swallowed: a missing observer must never
/// fail a job.
#[derive(Clone)]
pub struct Notifier {
    bus: SharedBus,
}

impl core::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.bus.subscriber_count())
            .finish()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryEventBus::new()))
    }
}

impl Notifier {
    pub fn new(bus: SharedBus) -> Self {
        Self { bus }
    }

    pub fn subscribe(&self) -> Subscription<Notification> {
        self.bus.subscribe()
    }

    pub fn broadcast(&self, notification: Notification) {
        if let Err(err) = self.bus.publish(notification) {
            warn!(error = %err, "dropping notification");
        }
    }

    /// Log through `tracing` and mirror the line to observers.
    ///
    /// Blank messages are ignored.
    pub fn emit_log(&self, level: LogLevel, message: &str, meta: Option<JsonValue>) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }

        match level {
            LogLevel::Debug => debug!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }

        self.broadcast(Notification::Log {
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
            meta,
        });
    }

    pub fn emit_job_status(&self, job_id: JobId, status: JobStatus) {
        self.broadcast(Notification::JobStatus { job_id, status });
    }

    pub fn emit_job_progress(&self, job_id: JobId, progress: f64, stage: Option<&str>) {
        self.broadcast(Notification::JobProgress {
            job_id,
            progress: progress.clamp(0.0, 1.0),
            stage: stage.map(str::to_string),
        });
    }
}
