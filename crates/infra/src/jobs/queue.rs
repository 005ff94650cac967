//! In-process job queue and bounded worker pool.
//!
//! `enqueue` appends to a FIFO and triggers a drain. A drain dispatches queued ids
//! while fewer than `workers` jobs are active; every completion frees a slot and
//! drains again. Handler errors and panics are converted into job failures at the
//! dispatch boundary, so a misbehaving handler never takes the pool down.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use tidemark_core::{JobId, JobStatus, LogLevel};
use tidemark_events::Notifier;

use super::handler::{CancellationToken, HandlerError, JobContext, JobHandler};
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobFailure, JobUpdate, JsonMap};

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub workers: usize,
    pub active: usize,
    pub idle: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    active: HashMap<JobId, CancellationToken>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    notifier: Notifier,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    state: Mutex<QueueState>,
    workers: usize,
    started_at: Instant,
    idle: Notify,
}

/// Bounded-concurrency dispatcher. Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("workers", &self.inner.workers)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl JobQueue {
    /// Create a pool with at most `workers` concurrently running jobs (minimum 1).
    pub fn new(store: Arc<dyn JobStore>, notifier: Notifier, workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                notifier,
                handlers: RwLock::new(HashMap::new()),
                state: Mutex::new(QueueState::default()),
                workers: workers.max(1),
                started_at: Instant::now(),
                idle: Notify::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Register (or replace) the handler for a job type.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        debug!(job_type = %job_type, "registering job handler");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type, handler);
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handler(job_type).is_some()
    }

    fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a `queued` job and enqueue it.
    pub async fn submit(&self, job_type: &str, payload: JsonMap) -> Result<JobId, JobStoreError> {
        let job = self.inner.store.create(job_type, payload).await?;
        info!(job_id = %job.job_id, job_type = %job.job_type, "job submitted");
        self.record(job.job_id, LogLevel::Info, "job queued", None).await;
        self.inner.notifier.emit_job_status(job.job_id, JobStatus::Queued);
        self.enqueue(job.job_id);
        Ok(job.job_id)
    }

    /// Append an existing job id to the FIFO and drain.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, job_id: JobId) {
        self.state().pending.push_back(job_id);
        self.drain();
    }

    fn drain(&self) {
        let mut started = Vec::new();
        {
            let mut state = self.state();
            while state.active.len() < self.inner.workers {
                let Some(job_id) = state.pending.pop_front() else {
                    break;
                };
                if state.active.contains_key(&job_id) {
                    debug!(job_id = %job_id, "job already active, dropping duplicate enqueue");
                    continue;
                }
                let token = CancellationToken::new();
                state.active.insert(job_id, token.clone());
                started.push((job_id, token));
            }
        }

        for (job_id, token) in started {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.dispatch(job_id, token).await;
                queue.finish(job_id);
            });
        }
    }

    fn finish(&self, job_id: JobId) {
        let idle = {
            let mut state = self.state();
            state.active.remove(&job_id);
            state.active.is_empty() && state.pending.is_empty()
        };
        self.drain();
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    async fn dispatch(&self, job_id: JobId, token: CancellationToken) {
        let store = &self.inner.store;

        let job = match store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "dequeued unknown job");
                return;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to load job");
                return;
            }
        };

        if job.status == JobStatus::Canceled {
            self.inner
                .notifier
                .emit_log(LogLevel::Info, &format!("job {job_id} canceled"), None);
            return;
        }
        if job.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "skipping finished job");
            return;
        }

        match store
            .update(job_id, JobUpdate::status(JobStatus::Running).with_progress(0.0))
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_terminal_conflict() => {
                debug!(job_id = %job_id, "job finished before it started");
                return;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to mark job running");
                return;
            }
        }
        info!(job_id = %job_id, job_type = %job.job_type, "job started");
        self.record(job_id, LogLevel::Info, "job started", None).await;
        self.inner.notifier.emit_job_status(job_id, JobStatus::Running);

        let Some(handler) = self.handler(&job.job_type) else {
            let message = format!("no handler registered for job type {}", job.job_type);
            self.fail(job_id, message).await;
            return;
        };

        let outcome = self.run_handler(handler, job, token).await;
        match outcome {
            Ok(result) => self.succeed(job_id, result).await,
            Err(HandlerError::Canceled) => self.mark_canceled(job_id).await,
            Err(err) => self.fail(job_id, err.to_string()).await,
        }
    }

    /// Run the handler on its own task so a panic surfaces as a `JoinError`.
    async fn run_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        job: Job,
        token: CancellationToken,
    ) -> Result<JsonMap, HandlerError> {
        let ctx = JobContext::new(
            job,
            self.inner.store.clone(),
            self.inner.notifier.clone(),
            token,
        );

        match tokio::spawn(async move { handler.run(ctx).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_panic() => Err(HandlerError::Failed(format!(
                "handler panicked: {}",
                panic_message(join_err.into_panic())
            ))),
            Err(join_err) => Err(HandlerError::Failed(join_err.to_string())),
        }
    }

    async fn succeed(&self, job_id: JobId, result: JsonMap) {
        let update = JobUpdate::status(JobStatus::Succeeded)
            .with_progress(1.0)
            .with_result(result);
        if self.finalize(job_id, update).await {
            info!(job_id = %job_id, "job completed");
            self.record(job_id, LogLevel::Info, "job completed", None).await;
            self.inner.notifier.emit_job_status(job_id, JobStatus::Succeeded);
        }
    }

    async fn fail(&self, job_id: JobId, message: String) {
        let update = JobUpdate::status(JobStatus::Failed).with_error(JobFailure::new(&message));
        if self.finalize(job_id, update).await {
            warn!(job_id = %job_id, error = %message, "job failed");
            self.record(
                job_id,
                LogLevel::Error,
                "job failed",
                Some(json!({ "error": message })),
            )
            .await;
            self.inner.notifier.emit_job_status(job_id, JobStatus::Failed);
        }
    }

    async fn mark_canceled(&self, job_id: JobId) {
        let update = JobUpdate::status(JobStatus::Canceled).with_message("canceled");
        if self.finalize(job_id, update).await {
            info!(job_id = %job_id, "job canceled by handler");
            self.record(job_id, LogLevel::Info, "job canceled", None).await;
            self.inner.notifier.emit_job_status(job_id, JobStatus::Canceled);
        }
    }

    /// Apply a terminal update. Returns `false` when the row was already terminal,
    /// in which case the existing status stands.
    async fn finalize(&self, job_id: JobId, update: JobUpdate) -> bool {
        match self.inner.store.update(job_id, update).await {
            Ok(_) => true,
            Err(err) if err.is_terminal_conflict() => {
                debug!(job_id = %job_id, "job already terminal, keeping existing status");
                false
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to finalize job");
                false
            }
        }
    }

    async fn record(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: &str,
        meta: Option<serde_json::Value>,
    ) {
        if let Err(err) = self.inner.store.append_event(job_id, level, message, meta).await {
            warn!(job_id = %job_id, error = %err, "failed to append job event");
        }
    }

    /// Request cancellation.
    ///
    /// Queued jobs are canceled outright; running jobs are flagged and stop at their
    /// next checkpoint. Cancelling a terminal job is a no-op that returns its status.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, JobStoreError> {
        let store = &self.inner.store;
        let job = store.get(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
        if job.is_terminal() {
            return Ok(job.status);
        }

        match store
            .update(
                job_id,
                JobUpdate::status(JobStatus::Canceled).with_message("canceled"),
            )
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_terminal_conflict() => {
                let current = store.get(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
                return Ok(current.status);
            }
            Err(err) => return Err(err),
        }

        let idle = {
            let mut state = self.state();
            state.pending.retain(|id| *id != job_id);
            if let Some(token) = state.active.get(&job_id) {
                token.cancel();
            }
            state.active.is_empty() && state.pending.is_empty()
        };
        if idle {
            self.inner.idle.notify_waiters();
        }

        info!(job_id = %job_id, "job canceled");
        self.record(job_id, LogLevel::Info, "job canceled", None).await;
        self.inner.notifier.emit_job_status(job_id, JobStatus::Canceled);
        Ok(JobStatus::Canceled)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.inner.store.get(job_id).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.inner.store.list(limit).await
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state();
        let active = state.active.len();
        QueueSnapshot {
            uptime_secs: self.inner.started_at.elapsed().as_secs(),
            queue_depth: state.pending.len(),
            workers: self.inner.workers,
            active,
            idle: self.inner.workers.saturating_sub(active),
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.state();
        state.active.is_empty() && state.pending.is_empty()
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait_idle`](Self::wait_idle), giving up after `timeout`.
    pub async fn wait_idle_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::handler_fn;
    use crate::jobs::store::InMemoryJobStore;
    use tokio::sync::Semaphore;

    fn queue(workers: usize) -> JobQueue {
        JobQueue::new(Arc::new(InMemoryJobStore::new()), Notifier::default(), workers)
    }

    async fn status(queue: &JobQueue, id: JobId) -> JobStatus {
        queue.get(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn runs_handler_and_stores_result() {
        let queue = queue(2);
        queue.register_handler(
            "echo",
            handler_fn(|ctx: JobContext| async move { Ok(ctx.payload().clone()) }),
        );

        let mut payload = JsonMap::new();
        payload.insert("n".into(), 3.into());
        let id = queue.submit("echo", payload.clone()).await.unwrap();
        assert!(queue.wait_idle_for(Duration::from_secs(5)).await);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.progress, Some(1.0));
        assert_eq!(job.result, Some(payload));

        let messages: Vec<_> = queue
            .store()
            .events(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["job queued", "job started", "job completed"]);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_failures() {
        let queue = queue(1);
        queue.register_handler(
            "boom",
            handler_fn(|_ctx: JobContext| async move { Err(HandlerError::failed("remote said no")) }),
        );
        queue.register_handler(
            "panic",
            handler_fn(|_ctx: JobContext| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(JsonMap::new())
            }),
        );
        queue.register_handler("ok", handler_fn(|_ctx: JobContext| async move { Ok(JsonMap::new()) }));

        let boom = queue.submit("boom", JsonMap::new()).await.unwrap();
        let panic = queue.submit("panic", JsonMap::new()).await.unwrap();
        let ok = queue.submit("ok", JsonMap::new()).await.unwrap();
        assert!(queue.wait_idle_for(Duration::from_secs(5)).await);

        let boom = queue.get(boom).await.unwrap().unwrap();
        assert_eq!(boom.status, JobStatus::Failed);
        assert_eq!(boom.error, Some(JobFailure::new("remote said no")));

        let panic = queue.get(panic).await.unwrap().unwrap();
        assert_eq!(panic.status, JobStatus::Failed);
        let message = panic.error.unwrap().message;
        assert!(message.contains("handler blew up"), "{message}");

        assert_eq!(status(&queue, ok).await, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn unregistered_type_fails_fast() {
        let queue = queue(1);
        let id = queue.submit("noop.unknown", JsonMap::new()).await.unwrap();
        assert!(queue.wait_idle_for(Duration::from_secs(5)).await);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().message.contains("no handler registered"));
        assert_eq!(queue.snapshot().queue_depth, 0);
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test]
    async fn never_runs_more_than_the_cap() {
        let queue = queue(2);
        let gate = Arc::new(Semaphore::new(0));
        let handler_gate = gate.clone();
        queue.register_handler(
            "block",
            handler_fn(move |_ctx: JobContext| {
                let gate = handler_gate.clone();
                async move {
                    let _permit = gate.acquire().await.map_err(|e| HandlerError::failed(e.to_string()))?;
                    Ok(JsonMap::new())
                }
            }),
        );

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(queue.submit("block", JsonMap::new()).await.unwrap());
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let mut running = 0;
        let mut queued = 0;
        for id in &ids {
            match status(&queue, *id).await {
                JobStatus::Running => running += 1,
                JobStatus::Queued => queued += 1,
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(running, 2);
        assert_eq!(queued, 3);
        assert_eq!(queue.snapshot().active, 2);
        assert_eq!(queue.snapshot().idle, 0);

        gate.add_permits(5);
        assert!(queue.wait_idle_for(Duration::from_secs(5)).await);
        for id in ids {
            assert_eq!(status(&queue, id).await, JobStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn cancel_queued_job_skips_dispatch() {
        let queue = queue(1);
        let gate = Arc::new(Semaphore::new(0));
        let handler_gate = gate.clone();
        queue.register_handler(
            "block",
            handler_fn(move |_ctx: JobContext| {
                let gate = handler_gate.clone();
                async move {
                    let _permit = gate.acquire().await.map_err(|e| HandlerError::failed(e.to_string()))?;
                    Ok(JsonMap::new())
                }
            }),
        );

        let first = queue.submit("block", JsonMap::new()).await.unwrap();
        let second = queue.submit("block", JsonMap::new()).await.unwrap();
        assert_eq!(queue.cancel(second).await.unwrap(), JobStatus::Canceled);
        assert_eq!(queue.snapshot().queue_depth, 0);

        gate.add_permits(1);
        assert!(queue.wait_idle_for(Duration::from_secs(5)).await);
        assert_eq!(status(&queue, first).await, JobStatus::Succeeded);
        assert_eq!(status(&queue, second).await, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_running_job_is_cooperative_and_final() {
        let queue = queue(1);
        queue.register_handler(
            "loop",
            handler_fn(|ctx: JobContext| async move {
                loop {
                    ctx.checkpoint().await?;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }),
        );

        let id = queue.submit("loop", JsonMap::new()).await.unwrap();
        while status(&queue, id).await != JobStatus::Running {
            tokio::task::yield_now().await;
        }

        assert_eq!(queue.cancel(id).await.unwrap(), JobStatus::Canceled);
        assert!(queue.wait_idle_for(Duration::from_secs(5)).await);
        assert_eq!(status(&queue, id).await, JobStatus::Canceled);

        let canceled_events = queue
            .store()
            .events(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.message == "job canceled")
            .count();
        assert_eq!(canceled_events, 1);
    }

    #[tokio::test]
    async fn cancel_on_terminal_job_returns_existing_status() {
        let queue = queue(1);
        queue.register_handler("ok", handler_fn(|_ctx: JobContext| async move { Ok(JsonMap::new()) }));
        let id = queue.submit("ok", JsonMap::new()).await.unwrap();
        assert!(queue.wait_idle_for(Duration::from_secs(5)).await);

        let before = queue.store().events(id).await.unwrap().len();
        assert_eq!(queue.cancel(id).await.unwrap(), JobStatus::Succeeded);
        assert_eq!(queue.cancel(id).await.unwrap(), JobStatus::Succeeded);
        assert_eq!(queue.store().events(id).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_not_found() {
        let queue = queue(1);
        let id = JobId::new();
        assert_eq!(queue.cancel(id).await, Err(JobStoreError::NotFound(id)));
    }
}
