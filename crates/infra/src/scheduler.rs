//! Poll scheduler.
//!
//! A single background loop that, once per interval, enqueues a sync job for every
//! connector account whose last sync is older than the interval. Fixed delay: the
//! next cycle starts one interval after the previous one finished.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tidemark_core::{AccountId, JobId, LogLevel};

use crate::connectors::{CALENDAR_SYNC_JOB, CONFLUENCE_SYNC_JOB, JIRA_SYNC_JOB};
use crate::jobs::{JobQueue, JsonMap};
use crate::stores::{
    AtlassianAccountStore, AtlassianService, CalendarAccountStore, StoreError, SyncStateStore,
};

/// `true` when an account with the given last sync should be synced again.
pub fn is_due(last_sync_at: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    let Some(last) = last_sync_at else {
        return true;
    };
    match (now - last).to_std() {
        Ok(elapsed) => elapsed >= interval,
        // Last sync in the future (clock skew): not due.
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

struct Running {
    stop: Arc<Notify>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Progress {
    cycles: u64,
    last_cycle_at: Option<DateTime<Utc>>,
}

struct Inner {
    queue: JobQueue,
    atlassian: Arc<dyn AtlassianAccountStore>,
    calendars: Arc<dyn CalendarAccountStore>,
    sync_state: Arc<dyn SyncStateStore>,
    interval: Duration,
    running: Mutex<Option<Running>>,
    progress: Mutex<Progress>,
}

/// Cloneable handle to the poll loop.
#[derive(Clone)]
pub struct PollScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("interval", &self.inner.interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PollScheduler {
    pub fn new(
        queue: JobQueue,
        atlassian: Arc<dyn AtlassianAccountStore>,
        calendars: Arc<dyn CalendarAccountStore>,
        sync_state: Arc<dyn SyncStateStore>,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                atlassian,
                calendars,
                sync_state,
                interval,
                running: Mutex::new(None),
                progress: Mutex::new(Progress::default()),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.join.is_finished())
    }

    /// Spawn the loop. Returns `false` if it was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.join.is_finished()) {
            return false;
        }

        let stop = Arc::new(Notify::new());
        let this = self.clone();
        let signal = stop.clone();
        let join = tokio::spawn(async move { this.run_loop(signal).await });
        *running = Some(Running { stop, join });

        info!(interval_secs = self.inner.interval.as_secs(), "poll scheduler started");
        self.inner
            .queue
            .notifier()
            .emit_log(LogLevel::Info, "sync scheduler started", None);
        true
    }

    /// Stop the loop and wait for it to exit. Jobs it already enqueued keep running.
    ///
    /// Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return false;
        };

        // `notify_one` stores a permit, so a loop that is mid-cycle still sees it.
        running.stop.notify_one();
        if let Err(err) = running.join.await {
            warn!(error = %err, "poll scheduler task ended abnormally");
        }
        info!("poll scheduler stopped");
        true
    }

    pub fn status(&self) -> SchedulerStatus {
        let progress = self
            .inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        SchedulerStatus {
            running: self.is_running(),
            interval_secs: self.inner.interval.as_secs(),
            cycles: progress.cycles,
            last_cycle_at: progress.last_cycle_at,
        }
    }

    async fn run_loop(self, stop: Arc<Notify>) {
        loop {
            if let Err(err) = self.run_cycle().await {
                error!(error = %err, "poll scheduler cycle failed");
                self.inner.queue.notifier().emit_log(
                    LogLevel::Error,
                    &format!("sync scheduler error: {err}"),
                    None,
                );
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.interval) => {}
                _ = stop.notified() => break,
            }
        }
    }

    /// One pass: enqueue a sync job for every due account.
    pub async fn run_cycle(&self) -> Result<Vec<JobId>, StoreError> {
        let now = Utc::now();
        let mut candidates: Vec<(&'static str, &'static str, AccountId)> = Vec::new();
        for (service, job_type) in [
            (AtlassianService::Jira, JIRA_SYNC_JOB),
            (AtlassianService::Confluence, CONFLUENCE_SYNC_JOB),
        ] {
            for account in self.inner.atlassian.list(Some(service)).await? {
                candidates.push((service.as_str(), job_type, account.account_id));
            }
        }
        for account in self.inner.calendars.list().await? {
            candidates.push(("calendar", CALENDAR_SYNC_JOB, account.account_id));
        }

        let mut queued = Vec::new();
        for (source, job_type, account_id) in candidates {
            let last = self.inner.sync_state.last_sync_for(source, &account_id).await?;
            if !is_due(last, now, self.inner.interval) {
                debug!(source, account_id = %account_id, "sync not due");
                continue;
            }
            let mut payload = JsonMap::new();
            payload.insert("account_id".into(), json!(account_id));
            match self.inner.queue.submit(job_type, payload).await {
                Ok(job_id) => {
                    self.inner.queue.notifier().emit_log(
                        LogLevel::Info,
                        &format!("{source} sync queued {account_id}"),
                        Some(json!({"job_id": job_id})),
                    );
                    queued.push(job_id);
                }
                Err(err) => {
                    warn!(source, account_id = %account_id, error = %err, "failed to queue sync job");
                }
            }
        }

        let mut progress = self
            .inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        progress.cycles += 1;
        progress.last_cycle_at = Some(now);
        Ok(queued)
    }
}
