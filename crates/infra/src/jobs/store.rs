//! Job storage.
//!
//! The job store is the source of truth for job rows and their audit trail. The
//! engine only talks to it through [`JobStore`]; the in-memory implementation
//! backs tests and the standalone daemon.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;

use tidemark_core::{JobId, JobStatus, LogLevel};

use super::types::{Job, JobEvent, JobUpdate, JsonMap};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `queued` job.
    async fn create(&self, job_type: &str, payload: JsonMap) -> Result<Job, JobStoreError>;

    /// Merge a partial update and refresh `updated_at`.
    ///
    /// Fails with [`JobStoreError::InvalidTransition`] (leaving the row untouched)
    /// when the update would move the job along an illegal lifecycle edge.
    async fn update(&self, job_id: JobId, update: JobUpdate) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Most recent jobs first.
    async fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    async fn append_event(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: &str,
        meta: Option<JsonValue>,
    ) -> Result<(), JobStoreError>;

    /// Audit trail for a job, oldest first.
    async fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// True when the row was already terminal and the write was refused.
    pub fn is_terminal_conflict(&self) -> bool {
        matches!(self, JobStoreError::InvalidTransition { from, .. } if from.is_terminal())
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    events: RwLock<Vec<JobEvent>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("job store lock poisoned".to_string())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job_type: &str, payload: JsonMap) -> Result<Job, JobStoreError> {
        let job = Job::new(job_type, payload);
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn update(&self, job_id: JobId, update: JobUpdate) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        job.apply(update)
            .map_err(|(from, to)| JobStoreError::InvalidTransition { job_id, from, to })?;
        Ok(job.clone())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = jobs.values().cloned().collect();

        // Ids are time-ordered, which breaks ties within the same timestamp.
        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });
        result.truncate(limit);
        Ok(result)
    }

    async fn append_event(
        &self,
        job_id: JobId,
        level: LogLevel,
        message: &str,
        meta: Option<JsonValue>,
    ) -> Result<(), JobStoreError> {
        let mut events = self.events.write().map_err(|_| Self::poisoned())?;
        events.push(JobEvent {
            job_id,
            created_at: Utc::now(),
            level,
            message: message.to_string(),
            meta,
        });
        Ok(())
    }

    async fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError> {
        let events = self.events.read().map_err(|_| Self::poisoned())?;
        Ok(events.iter().filter(|e| e.job_id == job_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobFailure;

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryJobStore::new();
        let job = store.create("test", JsonMap::new()).await.unwrap();

        let loaded = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert_eq!(loaded.status, JobStatus::Queued);
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        let err = store.update(id, JobUpdate::progress(0.5)).await.unwrap_err();
        assert_eq!(err, JobStoreError::NotFound(id));
    }

    #[tokio::test]
    async fn terminal_rows_refuse_status_changes() {
        let store = InMemoryJobStore::new();
        let job = store.create("test", JsonMap::new()).await.unwrap();
        store.update(job.job_id, JobUpdate::status(JobStatus::Running)).await.unwrap();
        store
            .update(
                job.job_id,
                JobUpdate::status(JobStatus::Failed).with_error(JobFailure::new("boom")),
            )
            .await
            .unwrap();

        for next in [JobStatus::Succeeded, JobStatus::Canceled, JobStatus::Running] {
            let err = store.update(job.job_id, JobUpdate::status(next)).await.unwrap_err();
            assert!(err.is_terminal_conflict());
        }
        let err = store
            .update(job.job_id, JobUpdate::progress(0.9).with_message("late"))
            .await
            .unwrap_err();
        assert!(err.is_terminal_conflict());

        let row = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.message, None);
        assert_eq!(row.error, Some(JobFailure::new("boom")));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut payload = JsonMap::new();
            payload.insert("i".into(), i.into());
            ids.push(store.create("test", payload).await.unwrap().job_id);
        }

        let listed: Vec<_> = store
            .list(3)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(listed, vec![ids[4], ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn events_are_append_only_per_job() {
        let store = InMemoryJobStore::new();
        let a = JobId::new();
        let b = JobId::new();
        store.append_event(a, LogLevel::Info, "first", None).await.unwrap();
        store.append_event(b, LogLevel::Warn, "other", None).await.unwrap();
        store
            .append_event(a, LogLevel::Error, "second", Some(serde_json::json!({"k": 1})))
            .await
            .unwrap();

        let events = store.events(a).await.unwrap();
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(events[1].meta, Some(serde_json::json!({"k": 1})));
    }
}
