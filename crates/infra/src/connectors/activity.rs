//! Activity sync job shared by the issue-tracker and wiki connectors.
//!
//! The per-provider part is an [`ActivitySource`]; the handler owns everything
//! around it (account lookup, since-window, upsert, cursor, notification).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::info;

use tidemark_core::{ConnectorKey, LogLevel};
use tidemark_events::Notification;

use crate::http::ApiClient;
use crate::jobs::{HandlerError, JobContext, JobHandler, JsonMap};
use crate::stores::{
    ActivityEvent, ActivitySink, AtlassianAccount, AtlassianAccountStore, AtlassianService,
    SyncStateStore,
};

use super::atlassian::AtlassianApi;
use super::{ConnectorError, account_id_from};

/// Default lookback for activity queries and first syncs.
pub const LOOKBACK_DAYS: i64 = 7;

/// Lower bound for emitted events: the last sync, else the lookback window.
pub fn since_ts(last_sync_at: Option<DateTime<Utc>>, force: bool, now: DateTime<Utc>) -> i64 {
    let lookback = (now - Duration::days(LOOKBACK_DAYS)).timestamp();
    match last_sync_at {
        Some(last) if !force => last.timestamp(),
        _ => lookback,
    }
}

/// Provider half of an activity sync.
#[async_trait]
pub trait ActivitySource: Send + Sync + 'static {
    fn service(&self) -> AtlassianService;

    /// Human-readable provider name used in job messages.
    fn label(&self) -> &'static str;

    async fn fetch(
        &self,
        api: &AtlassianApi,
        account: &AtlassianAccount,
        since_ts: i64,
        ctx: &JobContext,
    ) -> Result<Vec<ActivityEvent>, ConnectorError>;
}

pub struct ActivitySyncHandler<S> {
    source: S,
    client: ApiClient,
    accounts: Arc<dyn AtlassianAccountStore>,
    sync_state: Arc<dyn SyncStateStore>,
    sink: Arc<dyn ActivitySink>,
}

impl<S: ActivitySource> ActivitySyncHandler<S> {
    pub fn new(
        source: S,
        client: ApiClient,
        accounts: Arc<dyn AtlassianAccountStore>,
        sync_state: Arc<dyn SyncStateStore>,
        sink: Arc<dyn ActivitySink>,
    ) -> Self {
        Self {
            source,
            client,
            accounts,
            sync_state,
            sink,
        }
    }

    async fn sync(&self, ctx: &JobContext) -> Result<JsonMap, ConnectorError> {
        let service = self.source.service();
        let account_id = account_id_from(ctx.payload(), service.as_str())?;
        let account = self
            .accounts
            .get(&account_id)
            .await?
            .filter(|a| a.service == service)
            .ok_or_else(|| ConnectorError::AccountNotFound {
                service: service.as_str(),
                account_id: account_id.clone(),
            })?;

        ctx.progress(0.1, Some(&format!("Starting {} sync", self.source.label())))
            .await;
        ctx.log(
            LogLevel::Info,
            &format!("{service} sync started for {account_id}"),
            None,
        )
        .await;

        let key = ConnectorKey::account(service.as_str(), &account_id);
        let last = self.sync_state.get(&key).await?.map(|s| s.last_sync_at);
        let force = ctx.job().payload_bool("force");
        let since = since_ts(last, force, Utc::now());

        let api = AtlassianApi::new(self.client.clone(), &account);
        let events = self.source.fetch(&api, &account, since, ctx).await?;
        ctx.checkpoint().await?;

        let synced = self.sink.upsert(&events).await?;
        self.sync_state.upsert(&key, None).await?;

        ctx.notifier().broadcast(Notification::ActivitySync {
            source: service.as_str().to_string(),
            account_id: account_id.clone(),
            synced_events: synced,
            timestamp: Utc::now(),
        });

        let message = format!("Synced {synced} {} events", self.source.label());
        info!(account_id = %account_id, service = %service, synced, "activity sync finished");
        ctx.progress(1.0, Some(&message)).await;
        ctx.log(LogLevel::Info, &message, None).await;

        let mut result = JsonMap::new();
        result.insert("account_id".into(), json!(account_id));
        result.insert("synced_events".into(), json!(synced));
        result.insert("since_ts".into(), json!(since));
        Ok(result)
    }
}

#[async_trait]
impl<S: ActivitySource> JobHandler for ActivitySyncHandler<S> {
    async fn run(&self, ctx: JobContext) -> Result<JsonMap, HandlerError> {
        Ok(self.sync(&ctx).await?)
    }
}
