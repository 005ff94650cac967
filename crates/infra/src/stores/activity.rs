//! Activity event sink.
//!
//! Canonical activity records produced by the issue-tracker and wiki connectors.
//! `event_id` is deterministic, so re-applying a batch updates rows in place
//! instead of duplicating them.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tidemark_core::AccountId;

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Source-qualified and stable across syncs, e.g. `jira:issue:created:10042`.
    pub event_id: String,
    pub source: String,
    pub account_id: AccountId,
    pub event_type: String,
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub actor: Option<String>,
    /// Canonical RFC 3339 time of the activity.
    pub event_time: String,
    /// `event_time` as epoch seconds.
    pub event_ts: i64,
    pub raw: Option<JsonValue>,
}

impl ActivityEvent {
    /// New event at `event_ts`; `event_time` is derived in canonical form.
    pub fn new(
        source: &str,
        account_id: &AccountId,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
        title: impl Into<String>,
        event_ts: i64,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            source: source.to_string(),
            account_id: account_id.clone(),
            event_type: event_type.into(),
            title: title.into(),
            description: None,
            url: None,
            actor: None,
            event_time: tidemark_core::time::format_epoch(event_ts).unwrap_or_default(),
            event_ts,
            raw: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_raw(mut self, raw: JsonValue) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Activity event as stored, with row bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredActivity {
    #[serde(flatten)]
    pub event: ActivityEvent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Time-window listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityQuery {
    pub start_ts: i64,
    pub end_ts: i64,
    /// Empty means every source.
    pub sources: Vec<String>,
    pub limit: usize,
}

impl ActivityQuery {
    pub fn between(start_ts: i64, end_ts: i64) -> Self {
        Self {
            start_ts,
            end_ts,
            sources: Vec::new(),
            limit: 200,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[async_trait]
pub trait ActivitySink: Send + Sync {
    /// Insert-or-update by `event_id`. Returns how many events were applied.
    async fn upsert(&self, events: &[ActivityEvent]) -> Result<usize, StoreError>;

    /// Events inside `[start_ts, end_ts]`, newest first.
    async fn list(&self, query: &ActivityQuery) -> Result<Vec<StoredActivity>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    async fn delete_account(&self, account_id: &AccountId) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryActivitySink {
    rows: RwLock<HashMap<String, StoredActivity>>,
}

impl InMemoryActivitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &str) -> Option<StoredActivity> {
        self.rows.read().ok()?.get(event_id).cloned()
    }
}

#[async_trait]
impl ActivitySink for InMemoryActivitySink {
    async fn upsert(&self, events: &[ActivityEvent]) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut rows = self.rows.write().map_err(|_| StoreError::poisoned("activity"))?;
        for event in events {
            rows.entry(event.event_id.clone())
                .and_modify(|row| {
                    row.event = event.clone();
                    row.updated_at = now;
                })
                .or_insert_with(|| StoredActivity {
                    event: event.clone(),
                    created_at: now,
                    updated_at: now,
                });
        }
        Ok(events.len())
    }

    async fn list(&self, query: &ActivityQuery) -> Result<Vec<StoredActivity>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::poisoned("activity"))?;
        let mut list: Vec<_> = rows
            .values()
            .filter(|row| {
                row.event.event_ts >= query.start_ts
                    && row.event.event_ts <= query.end_ts
                    && (query.sources.is_empty() || query.sources.contains(&row.event.source))
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.event
                .event_ts
                .cmp(&a.event.event_ts)
                .then_with(|| a.event.event_id.cmp(&b.event.event_id))
        });
        list.truncate(query.limit);
        Ok(list)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::poisoned("activity"))?;
        Ok(rows.len())
    }

    async fn delete_account(&self, account_id: &AccountId) -> Result<usize, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::poisoned("activity"))?;
        let before = rows.len();
        rows.retain(|_, row| &row.event.account_id != account_id);
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, ts: i64, title: &str) -> ActivityEvent {
        ActivityEvent::new("jira", &AccountId::from("atl_1"), id, "issue.created", title, ts)
            .with_actor(Some("Ada".to_string()))
    }

    #[test]
    fn new_events_carry_canonical_time() {
        let event = event("jira:a", 86_400, "A");
        assert_eq!(event.event_time, "1970-01-02T00:00:00Z");
        assert_eq!(event.description, None);
    }

    #[tokio::test]
    async fn upserting_the_same_batch_twice_does_not_duplicate() {
        let sink = InMemoryActivitySink::new();
        let batch = vec![event("jira:a", 10, "A"), event("jira:b", 20, "B")];

        assert_eq!(sink.upsert(&batch).await.unwrap(), 2);
        let once = sink.count().await.unwrap();
        assert_eq!(sink.upsert(&batch).await.unwrap(), 2);
        assert_eq!(sink.count().await.unwrap(), once);
    }

    #[tokio::test]
    async fn updates_preserve_created_at() {
        let sink = InMemoryActivitySink::new();
        sink.upsert(&[event("jira:a", 10, "old")]).await.unwrap();
        let first = sink.get("jira:a").unwrap();

        sink.upsert(&[event("jira:a", 10, "new")]).await.unwrap();
        let second = sink.get("jira:a").unwrap();

        assert_eq!(second.event.title, "new");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn list_filters_window_and_sorts_newest_first() {
        let sink = InMemoryActivitySink::new();
        let mut wiki = event("confluence:x", 15, "wiki");
        wiki.source = "confluence".into();
        sink.upsert(&[event("jira:a", 10, "A"), event("jira:b", 30, "B"), wiki])
            .await
            .unwrap();

        let ids: Vec<_> = sink
            .list(&ActivityQuery::between(0, 20))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.event.event_id)
            .collect();
        assert_eq!(ids, vec!["confluence:x", "jira:a"]);

        let only_jira = sink
            .list(&ActivityQuery::between(0, 100).with_source("jira").with_limit(1))
            .await
            .unwrap();
        assert_eq!(only_jira.len(), 1);
        assert_eq!(only_jira[0].event.event_id, "jira:b");
    }
}
