//! Job handlers and the context they run in.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use tidemark_core::{JobId, JobStatus, LogLevel};
use tidemark_events::Notifier;

use super::store::JobStore;
use super::types::{Job, JobUpdate, JsonMap};

/// Error returned by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The handler observed a cancellation request and stopped early.
    #[error("job canceled")]
    Canceled,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Cooperative cancellation flag shared between the queue and a running handler.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Everything a handler may touch while running a job.
///
/// Progress and log writes are best-effort: a failing store write is logged and
/// never aborts the handler.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    store: Arc<dyn JobStore>,
    notifier: Notifier,
    cancel: CancellationToken,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.job_id)
            .field("job_type", &self.job.job_type)
            .field("canceled", &self.cancel.is_canceled())
            .finish()
    }
}

impl JobContext {
    pub fn new(
        job: Job,
        store: Arc<dyn JobStore>,
        notifier: Notifier,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job,
            store,
            notifier,
            cancel,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.job_id
    }

    pub fn payload(&self) -> &JsonMap {
        &self.job.payload
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Persist and broadcast fractional progress.
    ///
    /// A row that already finished (for instance canceled under the handler) keeps
    /// its state and nothing is broadcast.
    pub async fn progress(&self, fraction: f64, stage: Option<&str>) {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut update = JobUpdate::progress(fraction);
        if let Some(stage) = stage {
            update = update.with_message(stage);
        }
        match self.store.update(self.job.job_id, update).await {
            Ok(_) => {}
            Err(err) if err.is_terminal_conflict() => {
                debug!(job_id = %self.job.job_id, "job finished, progress dropped");
                return;
            }
            Err(err) => {
                debug!(job_id = %self.job.job_id, error = %err, "progress write skipped");
            }
        }
        self.notifier.emit_job_progress(self.job.job_id, fraction, stage);
    }

    /// Append to the job's audit trail and mirror to observers.
    pub async fn log(&self, level: LogLevel, message: &str, meta: Option<JsonValue>) {
        if let Err(err) = self
            .store
            .append_event(self.job.job_id, level, message, meta.clone())
            .await
        {
            debug!(job_id = %self.job.job_id, error = %err, "job event write skipped");
        }
        self.notifier.emit_log(level, message, meta);
    }

    /// True once cancellation was requested, either through the queue or directly
    /// on the stored row.
    pub async fn is_canceled(&self) -> bool {
        if self.cancel.is_canceled() {
            return true;
        }
        match self.store.get(self.job.job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Canceled => {
                self.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancellation checkpoint: `Err(Canceled)` once the job should stop.
    pub async fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_canceled().await {
            return Err(HandlerError::Canceled);
        }
        Ok(())
    }
}

/// A unit of work bound to a job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job; the returned map becomes the job's `result`.
    async fn run(&self, ctx: JobContext) -> Result<JsonMap, HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonMap, HandlerError>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> Result<JsonMap, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonMap, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
