//! Calendar sync pipeline.
//!
//! Per account: refresh the bearer token, mirror the calendar listing, then sync
//! every selected calendar from its own cursor. A calendar without a cursor (or
//! whose cursor the provider no longer accepts) gets a bounded full sync over
//! [`PAST_DAYS`] back and [`FUTURE_DAYS`] ahead.

pub mod google;
pub mod oauth;
pub mod parse;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use tidemark_core::{AccountId, ConnectorKey, LogLevel};
use tidemark_events::Notification;

use crate::config::{FailurePolicy, OAuthClientConfig};
use crate::http::ApiClient;
use crate::jobs::{HandlerError, JobContext, JobHandler, JsonMap};
use crate::stores::{Calendar, CalendarAccountStore, CalendarStore, SyncStateStore};

use super::{ConnectorError, account_id_from};

pub use google::{EventsQuery, GoogleCalendarApi};
pub use oauth::TokenRefresher;
pub use parse::EventChange;

pub const SOURCE: &str = "calendar";
pub const PROVIDER: &str = "google";
pub const PAST_DAYS: i64 = 30;
pub const FUTURE_DAYS: i64 = 90;

pub struct CalendarSyncHandler {
    api: GoogleCalendarApi,
    tokens: TokenRefresher,
    accounts: Arc<dyn CalendarAccountStore>,
    calendars: Arc<dyn CalendarStore>,
    sync_state: Arc<dyn SyncStateStore>,
    policy: FailurePolicy,
}

/// Outcome of one calendar's pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CalendarPass {
    upserted: usize,
    deleted: usize,
    full: bool,
}

impl CalendarSyncHandler {
    pub fn new(
        client: ApiClient,
        oauth: OAuthClientConfig,
        accounts: Arc<dyn CalendarAccountStore>,
        calendars: Arc<dyn CalendarStore>,
        sync_state: Arc<dyn SyncStateStore>,
    ) -> Self {
        Self {
            api: GoogleCalendarApi::new(client.clone()),
            tokens: TokenRefresher::new(client, oauth, accounts.clone()),
            accounts,
            calendars,
            sync_state,
            policy: FailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn sync(&self, ctx: &JobContext) -> Result<JsonMap, ConnectorError> {
        let account_id = account_id_from(ctx.payload(), SOURCE)?;
        let account = self.accounts.get(&account_id).await?.ok_or_else(|| {
            ConnectorError::AccountNotFound {
                service: SOURCE,
                account_id: account_id.clone(),
            }
        })?;
        if account.provider != PROVIDER {
            return Err(ConnectorError::UnsupportedProvider(account.provider));
        }

        ctx.progress(0.1, Some("Starting sync with Google Calendar")).await;
        ctx.log(
            LogLevel::Info,
            &format!("calendar sync started for {account_id}"),
            None,
        )
        .await;

        let token = self.tokens.access_token(&account_id).await?;
        let selected = self.mirror_calendars(ctx, &token, &account_id).await?;

        let total = selected.len();
        let mut synced = 0usize;
        let mut skipped = 0usize;
        for (index, calendar) in selected.iter().enumerate() {
            ctx.checkpoint().await?;
            match self.sync_calendar(ctx, &token, calendar).await {
                Ok(pass) => {
                    debug!(
                        calendar_id = %calendar.calendar_id,
                        upserted = pass.upserted,
                        deleted = pass.deleted,
                        full = pass.full,
                        "calendar synced"
                    );
                    synced += pass.upserted;
                }
                Err(err) if err.is_canceled() => return Err(err),
                Err(err) if self.policy == FailurePolicy::Abort => return Err(err),
                Err(err) => {
                    skipped += 1;
                    warn!(
                        account_id = %account_id,
                        calendar_id = %calendar.calendar_id,
                        error = %err,
                        "calendar skipped"
                    );
                    ctx.log(
                        LogLevel::Warn,
                        &format!("calendar {} skipped: {err}", calendar.calendar_id),
                        Some(json!({"calendar_id": calendar.calendar_id})),
                    )
                    .await;
                }
            }
            let done = (index + 1) as f64 / total as f64;
            ctx.progress(
                0.1 + 0.9 * done,
                Some(&format!("Synced {} of {total} calendars", index + 1)),
            )
            .await;
        }

        self.sync_state
            .upsert(&ConnectorKey::account(SOURCE, &account_id), None)
            .await?;
        ctx.notifier().broadcast(Notification::CalendarSync {
            account_id: account_id.clone(),
            calendars: total,
            synced_events: synced,
            timestamp: Utc::now(),
        });

        let message = format!("Synced {synced} events from Google Calendar");
        info!(account_id = %account_id, calendars = total, synced, skipped, "calendar sync finished");
        ctx.progress(1.0, Some(&message)).await;
        ctx.log(LogLevel::Info, &message, None).await;

        let mut result = JsonMap::new();
        result.insert("account_id".into(), json!(account_id));
        result.insert("provider".into(), json!(PROVIDER));
        result.insert("calendars".into(), json!(total));
        result.insert("synced_events".into(), json!(synced));
        result.insert("skipped".into(), json!(skipped));
        Ok(result)
    }

    /// Mirror the provider listing and return the calendars to sync.
    async fn mirror_calendars(
        &self,
        ctx: &JobContext,
        token: &str,
        account_id: &AccountId,
    ) -> Result<Vec<Calendar>, ConnectorError> {
        let listed: Vec<Calendar> = self
            .api
            .list_calendars(token, ctx)
            .await?
            .into_iter()
            .map(|entry| entry.into_calendar(account_id))
            .collect();
        let keep: Vec<String> = listed.iter().map(|c| c.calendar_id.clone()).collect();

        self.calendars.upsert_calendars(&listed).await?;
        let pruned = self.calendars.prune_calendars(account_id, &keep).await?;
        for calendar_id in &pruned {
            self.sync_state
                .delete(&ConnectorKey::collection(SOURCE, account_id, calendar_id))
                .await?;
        }
        if !pruned.is_empty() {
            info!(account_id = %account_id, pruned = pruned.len(), "pruned calendars missing upstream");
        }

        Ok(self.calendars.list_calendars(account_id, true).await?)
    }

    async fn sync_calendar(
        &self,
        ctx: &JobContext,
        token: &str,
        calendar: &Calendar,
    ) -> Result<CalendarPass, ConnectorError> {
        let key = ConnectorKey::collection(SOURCE, &calendar.account_id, &calendar.calendar_id);
        let cursor = self.sync_state.get(&key).await?.and_then(|s| s.cursor);

        let pass = match cursor {
            Some(sync_token) => {
                let query = EventsQuery::Incremental(sync_token);
                match self.api.list_events(token, &calendar.calendar_id, &query, ctx).await {
                    Ok(batch) => self.apply(ctx, calendar, batch, None).await?,
                    Err(err) if google::is_sync_token_expired(&err) => {
                        info!(
                            calendar_id = %calendar.calendar_id,
                            "sync token expired, running full sync"
                        );
                        ctx.log(
                            LogLevel::Info,
                            &format!("sync token expired for {}, running full sync", calendar.calendar_id),
                            None,
                        )
                        .await;
                        self.full_sync(ctx, token, calendar).await?
                    }
                    Err(err) => return Err(err),
                }
            }
            None => self.full_sync(ctx, token, calendar).await?,
        };
        Ok(pass)
    }

    async fn full_sync(
        &self,
        ctx: &JobContext,
        token: &str,
        calendar: &Calendar,
    ) -> Result<CalendarPass, ConnectorError> {
        let now = Utc::now();
        let time_min = now - Duration::days(PAST_DAYS);
        let time_max = now + Duration::days(FUTURE_DAYS);
        let query = EventsQuery::Window { time_min, time_max };
        let batch = self
            .api
            .list_events(token, &calendar.calendar_id, &query, ctx)
            .await?;
        self.apply(ctx, calendar, batch, Some((time_min.timestamp(), time_max.timestamp())))
            .await
    }

    /// Write one listing to the store and persist its cursor. A full listing first
    /// clears its window so events deleted upstream disappear.
    ///
    /// Nothing is written once the job was canceled.
    async fn apply(
        &self,
        ctx: &JobContext,
        calendar: &Calendar,
        batch: google::EventsBatch,
        window: Option<(i64, i64)>,
    ) -> Result<CalendarPass, ConnectorError> {
        ctx.checkpoint().await?;
        let account_id = &calendar.account_id;
        let calendar_id = calendar.calendar_id.as_str();

        let mut upserts = Vec::new();
        let mut deletions = Vec::new();
        for item in batch.items {
            match item.into_change(account_id, calendar_id, calendar.time_zone.as_deref()) {
                EventChange::Upsert(event) => upserts.push(*event),
                EventChange::Delete(event_id) => deletions.push(event_id),
            }
        }

        if let Some((start, end)) = window {
            self.calendars
                .delete_events_in_range(account_id, calendar_id, start, end)
                .await?;
        }
        let deleted = self
            .calendars
            .delete_events(account_id, calendar_id, &deletions)
            .await?;
        let upserted = self.calendars.upsert_events(&upserts).await?;

        let key = ConnectorKey::collection(SOURCE, account_id, calendar_id);
        self.sync_state.upsert(&key, batch.next_sync_token).await?;

        Ok(CalendarPass {
            upserted,
            deleted,
            full: window.is_some(),
        })
    }
}

#[async_trait]
impl JobHandler for CalendarSyncHandler {
    async fn run(&self, ctx: JobContext) -> Result<JsonMap, HandlerError> {
        Ok(self.sync(&ctx).await?)
    }
}
