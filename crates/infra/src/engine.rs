//! Engine wiring.
//!
//! [`Engine`] owns one job queue, one scheduler and the stores they share. Built
//! once by the host process; every public operation goes through it.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use tidemark_core::{AccountId, JobId, JobStatus};
use tidemark_events::Notifier;

use crate::config::{ConfigError, EngineConfig};
use crate::connectors::{
    ActivitySyncHandler, CALENDAR_SYNC_JOB, CONFLUENCE_SYNC_JOB, CalendarSyncHandler,
    ConfluenceSource, JIRA_SYNC_JOB, JiraSource,
};
use crate::http::{ApiClient, ApiError, ReqwestTransport, Transport};
use crate::jobs::{
    InMemoryJobStore, Job, JobEvent, JobHandler, JobQueue, JobStore, JobStoreError, JsonMap,
    QueueSnapshot, SIMULATE_JOB_TYPE, SimulateHandler,
};
use crate::scheduler::PollScheduler;
use crate::stores::{
    ActivitySink, AtlassianAccountStore, CalendarAccountStore, CalendarStore, InMemoryActivitySink,
    InMemoryAtlassianAccountStore, InMemoryCalendarAccountStore, InMemoryCalendarStore,
    InMemorySyncStateStore, StoreError, SyncStateStore,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("http client: {0}")]
    Http(#[from] ApiError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown sync source: {0}")]
    UnknownSource(String),
}

/// Every store the engine reads or writes.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub sync_state: Arc<dyn SyncStateStore>,
    pub atlassian_accounts: Arc<dyn AtlassianAccountStore>,
    pub calendar_accounts: Arc<dyn CalendarAccountStore>,
    pub calendars: Arc<dyn CalendarStore>,
    pub activity: Arc<dyn ActivitySink>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            sync_state: Arc::new(InMemorySyncStateStore::new()),
            atlassian_accounts: Arc::new(InMemoryAtlassianAccountStore::new()),
            calendar_accounts: Arc::new(InMemoryCalendarAccountStore::new()),
            calendars: Arc::new(InMemoryCalendarStore::new()),
            activity: Arc::new(InMemoryActivitySink::new()),
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    stores: Stores,
    queue: JobQueue,
    scheduler: PollScheduler,
}

impl Engine {
    /// Engine talking to the real providers over HTTPS.
    pub fn new(config: EngineConfig, stores: Stores) -> Result<Self, EngineError> {
        let transport = Arc::new(ReqwestTransport::new(&config.http)?);
        Ok(Self::with_transport(config, stores, Notifier::default(), transport))
    }

    /// Engine over an arbitrary transport; connector handlers are registered.
    pub fn with_transport(
        config: EngineConfig,
        stores: Stores,
        notifier: Notifier,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let client = ApiClient::new(transport, config.http.retry);
        let queue = JobQueue::new(stores.jobs.clone(), notifier, config.workers);

        queue.register_handler(
            JIRA_SYNC_JOB,
            Arc::new(ActivitySyncHandler::new(
                JiraSource,
                client.clone(),
                stores.atlassian_accounts.clone(),
                stores.sync_state.clone(),
                stores.activity.clone(),
            )),
        );
        queue.register_handler(
            CONFLUENCE_SYNC_JOB,
            Arc::new(ActivitySyncHandler::new(
                ConfluenceSource,
                client.clone(),
                stores.atlassian_accounts.clone(),
                stores.sync_state.clone(),
                stores.activity.clone(),
            )),
        );
        queue.register_handler(
            CALENDAR_SYNC_JOB,
            Arc::new(
                CalendarSyncHandler::new(
                    client,
                    config.google.clone(),
                    stores.calendar_accounts.clone(),
                    stores.calendars.clone(),
                    stores.sync_state.clone(),
                )
                .with_failure_policy(config.failure_policy),
            ),
        );
        queue.register_handler(SIMULATE_JOB_TYPE, Arc::new(SimulateHandler));

        let scheduler = PollScheduler::new(
            queue.clone(),
            stores.atlassian_accounts.clone(),
            stores.calendar_accounts.clone(),
            stores.sync_state.clone(),
            config.poll_interval,
        );

        Self {
            config,
            stores,
            queue,
            scheduler,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn notifier(&self) -> &Notifier {
        self.queue.notifier()
    }

    /// Start background polling. Jobs submitted directly run regardless.
    pub fn start(&self) -> bool {
        info!(workers = self.config.workers, "engine starting");
        self.scheduler.start()
    }

    pub async fn stop(&self) -> bool {
        self.scheduler.stop().await
    }

    pub fn register_handler(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.queue.register_handler(job_type, handler);
    }

    pub async fn submit(&self, job_type: &str, payload: JsonMap) -> Result<JobId, EngineError> {
        Ok(self.queue.submit(job_type, payload).await?)
    }

    /// Queue a sync of one account by source name (`jira`, `confluence`, `calendar`).
    pub async fn request_sync(
        &self,
        source: &str,
        account_id: &AccountId,
        force: bool,
    ) -> Result<JobId, EngineError> {
        let job_type = match source {
            "jira" => JIRA_SYNC_JOB,
            "confluence" => CONFLUENCE_SYNC_JOB,
            "calendar" => CALENDAR_SYNC_JOB,
            other => return Err(EngineError::UnknownSource(other.to_string())),
        };
        let mut payload = JsonMap::new();
        payload.insert("account_id".into(), json!(account_id));
        if force {
            payload.insert("force".into(), json!(true));
        }
        self.submit(job_type, payload).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, EngineError> {
        Ok(self.queue.cancel(job_id).await?)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, EngineError> {
        Ok(self.queue.get(job_id).await?)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Job>, EngineError> {
        Ok(self.queue.list(limit).await?)
    }

    pub async fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, EngineError> {
        Ok(self.stores.jobs.events(job_id).await?)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// Delete an Atlassian account with its sync state and activity rows.
    pub async fn delete_atlassian_account(&self, account_id: &AccountId) -> Result<bool, EngineError> {
        let Some(account) = self.stores.atlassian_accounts.get(account_id).await? else {
            return Ok(false);
        };
        let service = account.service;
        let states = self
            .stores
            .sync_state
            .delete_account(service.as_str(), account_id)
            .await?;
        let events = self.stores.activity.delete_account(account_id).await?;
        let deleted = self.stores.atlassian_accounts.delete(account_id).await?;
        info!(account_id = %account_id, service = %service, states, events, "atlassian account deleted");
        Ok(deleted)
    }

    /// Delete a calendar account with its calendars, events and sync state.
    pub async fn delete_calendar_account(&self, account_id: &AccountId) -> Result<bool, EngineError> {
        if self.stores.calendar_accounts.get(account_id).await?.is_none() {
            return Ok(false);
        }
        let states = self
            .stores
            .sync_state
            .delete_account("calendar", account_id)
            .await?;
        self.stores.calendars.delete_account(account_id).await?;
        let deleted = self.stores.calendar_accounts.delete(account_id).await?;
        info!(account_id = %account_id, states, "calendar account deleted");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tidemark_core::ConnectorKey;

    use super::*;
    use crate::http::StubTransport;
    use crate::stores::{ActivityEvent, ActivityQuery, AtlassianService, CalendarCredentials};

    fn engine() -> Engine {
        Engine::with_transport(
            EngineConfig::default(),
            Stores::in_memory(),
            Notifier::default(),
            Arc::new(StubTransport::new()),
        )
    }

    #[tokio::test]
    async fn connector_and_simulation_handlers_are_registered() {
        let engine = engine();
        for job_type in [JIRA_SYNC_JOB, CONFLUENCE_SYNC_JOB, CALENDAR_SYNC_JOB, SIMULATE_JOB_TYPE] {
            assert!(engine.queue().has_handler(job_type), "{job_type}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submit_runs_to_completion() {
        let engine = engine();
        let mut payload = JsonMap::new();
        payload.insert("simulate_ms".into(), json!(400));

        let id = engine.submit(SIMULATE_JOB_TYPE, payload).await.unwrap();
        assert!(engine.queue().wait_idle_for(Duration::from_secs(5)).await);

        let job = engine.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        let messages: Vec<_> = engine
            .events(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages.first().map(String::as_str), Some("job queued"));
        assert_eq!(messages.last().map(String::as_str), Some("job completed"));
    }

    #[tokio::test]
    async fn unknown_sources_are_rejected() {
        let err = engine()
            .request_sync("slack", &AccountId::from("x"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSource(s) if s == "slack"));
    }

    #[tokio::test]
    async fn deleting_an_atlassian_account_cascades() {
        let engine = engine();
        let stores = engine.stores().clone();
        let account = stores
            .atlassian_accounts
            .create(AtlassianService::Jira, "acme", "me@acme.test", "t")
            .await
            .unwrap();
        let id = account.account_id.clone();
        stores
            .sync_state
            .upsert(&ConnectorKey::account("jira", &id), None)
            .await
            .unwrap();
        stores
            .activity
            .upsert(&[ActivityEvent::new("jira", &id, "jira:comment:1", "issue.commented", "X", 10)])
            .await
            .unwrap();

        assert!(engine.delete_atlassian_account(&id).await.unwrap());
        assert!(!engine.delete_atlassian_account(&id).await.unwrap());
        assert!(stores.sync_state.last_sync_for("jira", &id).await.unwrap().is_none());
        assert!(stores.activity.list(&ActivityQuery::between(0, 100)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_calendar_account_cascades() {
        let engine = engine();
        let stores = engine.stores().clone();
        let account = stores
            .calendar_accounts
            .create("google", None, None, CalendarCredentials::default())
            .await
            .unwrap();
        let id = account.account_id.clone();
        stores
            .sync_state
            .upsert(&ConnectorKey::collection("calendar", &id, "primary"), Some("s".into()))
            .await
            .unwrap();

        assert!(engine.delete_calendar_account(&id).await.unwrap());
        assert!(stores.calendar_accounts.get(&id).await.unwrap().is_none());
        assert!(stores.sync_state.last_sync_for("calendar", &id).await.unwrap().is_none());
    }
}
