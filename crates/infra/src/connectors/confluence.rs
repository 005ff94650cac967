//! Confluence activity source.
//!
//! Two CQL searches: pages and blog posts the user created or last modified, and
//! comments the user wrote. Both page with `start`/`limit` against `totalSize`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::warn;

use tidemark_core::{AccountId, LogLevel, time};

use crate::jobs::JobContext;
use crate::stores::{ActivityEvent, AtlassianAccount, AtlassianService};

use super::activity::{ActivitySource, LOOKBACK_DAYS};
use super::atlassian::{AtlassianApi, Me, UserRef};
use super::{ConnectorError, PAGE_CEILING};

const SOURCE: &str = "confluence";
const CURRENT_USER_PATH: &str = "/wiki/rest/api/user/current";
const SEARCH_PATH: &str = "/wiki/rest/api/search";
const PAGE_SIZE: usize = 50;

fn content_cql() -> String {
    format!(
        "type in (\"page\",\"blogpost\") AND (creator = currentUser() OR lastmodifiedby = currentUser()) \
         AND lastmodified >= now(\"-{LOOKBACK_DAYS}d\") ORDER BY lastmodified DESC"
    )
}

fn comment_cql() -> String {
    format!(
        "type = comment AND creator = currentUser() AND created >= now(\"-{LOOKBACK_DAYS}d\") \
         ORDER BY created DESC"
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SearchPage {
    results: Vec<JsonValue>,
    total_size: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Content {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    title: Option<String>,
    #[serde(rename = "_links")]
    links: Links,
    history: ContentHistory,
    version: Option<Version>,
    container: Option<Container>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Links {
    webui: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ContentHistory {
    created_by: UserRef,
    created_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Version {
    by: UserRef,
    when: Option<String>,
    number: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Container {
    title: Option<String>,
}

/// A search hit either wraps its content or is the content itself.
fn content_of(result: JsonValue) -> Option<Content> {
    let value = match result {
        JsonValue::Object(mut map) => match map.remove("content") {
            Some(content @ JsonValue::Object(_)) => content,
            _ => JsonValue::Object(map),
        },
        _ => return None,
    };
    serde_json::from_value(value).ok()
}

fn epoch(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| time::parse_epoch(v).ok())
}

struct ContentEvents<'a> {
    api: &'a AtlassianApi,
    account_id: &'a AccountId,
    me: &'a Me,
    since_ts: i64,
}

impl ContentEvents<'_> {
    fn page_events(&self, content: &Content) -> Vec<ActivityEvent> {
        let id = content.id.as_deref().unwrap_or("unknown");
        let kind = content.kind.as_deref().unwrap_or("page");
        let title = content.title.as_deref().unwrap_or("Untitled page");
        let url = self.api.web_url(content.links.webui.as_deref());
        let raw = json!({"content_id": id, "type": kind});

        let mut events = Vec::new();
        let created_ts = epoch(content.history.created_date.as_deref());
        let creator = &content.history.created_by;
        if let Some(ts) = created_ts.filter(|ts| *ts >= self.since_ts && creator.is(self.me)) {
            events.push(
                ActivityEvent::new(SOURCE, self.account_id, format!("confluence:created:{id}"), format!("{kind}.created"), title, ts)
                    .with_description("Content created")
                    .with_url(url.clone())
                    .with_actor(creator.name_or(self.me))
                    .with_raw(raw.clone()),
            );
        }

        if let Some(version) = &content.version {
            let number = version.number.unwrap_or(1);
            let updated_ts = epoch(version.when.as_deref())
                .filter(|ts| *ts >= self.since_ts && Some(*ts) != created_ts);
            if let Some(ts) = updated_ts.filter(|_| number > 1 && version.by.is(self.me)) {
                events.push(
                    ActivityEvent::new(
                        SOURCE,
                        self.account_id,
                        format!("confluence:updated:{id}:{number}"),
                        format!("{kind}.updated"),
                        title,
                        ts,
                    )
                    .with_description("Content updated")
                    .with_url(url)
                    .with_actor(version.by.name_or(self.me))
                    .with_raw(raw),
                );
            }
        }
        events
    }

    fn comment_event(&self, content: &Content) -> Option<ActivityEvent> {
        let creator = &content.history.created_by;
        if !creator.is(self.me) {
            return None;
        }
        let ts = epoch(content.history.created_date.as_deref()).filter(|ts| *ts >= self.since_ts)?;
        let id = content.id.as_deref().unwrap_or("unknown");
        let container = content.container.as_ref().and_then(|c| c.title.as_deref());
        let description = match container {
            Some(title) => format!("Commented on {title}"),
            None => "Comment added".to_string(),
        };
        Some(
            ActivityEvent::new(
                SOURCE,
                self.account_id,
                format!("confluence:comment:{id}"),
                "comment.created",
                content.title.as_deref().unwrap_or("Comment"),
                ts,
            )
            .with_description(description)
            .with_url(self.api.web_url(content.links.webui.as_deref()))
            .with_actor(creator.name_or(self.me))
            .with_raw(json!({"content_id": id, "container": container})),
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfluenceSource;

impl ConfluenceSource {
    /// Every content hit of one CQL query, bounded by the page ceiling.
    async fn search(
        &self,
        api: &AtlassianApi,
        cql: &str,
        expand: &str,
        ctx: &JobContext,
    ) -> Result<Vec<Content>, ConnectorError> {
        let mut contents = Vec::new();
        let mut start = 0usize;
        for page in 1..=PAGE_CEILING {
            ctx.checkpoint().await?;
            let request = api
                .get(SEARCH_PATH)
                .query("cql", cql)
                .query("start", start)
                .query("limit", PAGE_SIZE)
                .query("expand", expand);
            let data: SearchPage = api.json(&request).await?;
            if data.results.is_empty() {
                break;
            }
            start += data.results.len();
            contents.extend(data.results.into_iter().filter_map(content_of));
            if start >= data.total_size {
                break;
            }
            if page == PAGE_CEILING {
                warn!(pages = page, total = data.total_size, "confluence page ceiling reached");
                ctx.log(
                    LogLevel::Warn,
                    &format!("Confluence sync stopped after {page} pages"),
                    None,
                )
                .await;
            }
        }
        Ok(contents)
    }
}

#[async_trait]
impl ActivitySource for ConfluenceSource {
    fn service(&self) -> AtlassianService {
        AtlassianService::Confluence
    }

    fn label(&self) -> &'static str {
        "Confluence"
    }

    async fn fetch(
        &self,
        api: &AtlassianApi,
        account: &AtlassianAccount,
        since_ts: i64,
        ctx: &JobContext,
    ) -> Result<Vec<ActivityEvent>, ConnectorError> {
        let me = api.me(CURRENT_USER_PATH).await?;
        let builder = ContentEvents {
            api,
            account_id: &account.account_id,
            me: &me,
            since_ts,
        };

        let mut events = Vec::new();
        let pages = self
            .search(api, &content_cql(), "content.history,content.version,content._links", ctx)
            .await?;
        for content in &pages {
            events.extend(builder.page_events(content));
        }

        let comments = self
            .search(api, &comment_cql(), "content.history,content.container,content._links", ctx)
            .await?;
        events.extend(comments.iter().filter_map(|c| builder.comment_event(c)));
        Ok(events)
    }
}
