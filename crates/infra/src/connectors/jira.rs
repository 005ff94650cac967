//! Jira activity source.
//!
//! One JQL query covers every issue the user touched in the lookback window; events
//! are derived per issue from its creator, changelog and comments.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use tidemark_core::{AccountId, LogLevel, time};

use crate::http::ApiError;
use crate::jobs::JobContext;
use crate::stores::{ActivityEvent, AtlassianAccount, AtlassianService};

use super::activity::{ActivitySource, LOOKBACK_DAYS};
use super::atlassian::{AtlassianApi, Me, UserRef};
use super::{ConnectorError, PAGE_CEILING};

const SOURCE: &str = "jira";
const MYSELF_PATH: &str = "/rest/api/3/myself";
const SEARCH_PATH: &str = "/rest/api/3/search/jql";
const PAGE_SIZE: u32 = 50;
const FIELDS: [&str; 8] = [
    "summary", "created", "updated", "status", "creator", "reporter", "assignee", "comment",
];

fn jql() -> String {
    format!(
        "(creator = currentUser() OR reporter = currentUser() OR assignee = currentUser() \
         OR commenter = currentUser()) AND updated >= -{LOOKBACK_DAYS}d ORDER BY updated DESC"
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SearchPage {
    issues: Vec<Issue>,
    next_page_token: Option<String>,
    is_last: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Issue {
    id: Option<String>,
    key: Option<String>,
    fields: IssueFields,
    changelog: Option<Changelog>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IssueFields {
    summary: Option<String>,
    created: Option<String>,
    updated: Option<String>,
    status: Option<Named>,
    creator: Option<UserRef>,
    comment: Option<CommentBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Named {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommentBlock {
    comments: Vec<Comment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Comment {
    id: Option<String>,
    author: Option<UserRef>,
    created: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Changelog {
    histories: Vec<History>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct History {
    id: Option<String>,
    author: Option<UserRef>,
    created: Option<String>,
    items: Vec<HistoryItem>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HistoryItem {
    field: Option<String>,
    #[serde(rename = "fromString")]
    from_label: Option<String>,
    #[serde(rename = "toString")]
    to_label: Option<String>,
    to: Option<String>,
}

fn epoch(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| time::parse_epoch(v).ok())
}

/// Everything one issue contributes, given who "me" is and the since-window.
struct IssueEvents<'a> {
    account_id: &'a AccountId,
    base_url: &'a str,
    me: &'a Me,
    since_ts: i64,
}

impl IssueEvents<'_> {
    fn collect(&self, issue: &Issue) -> Vec<ActivityEvent> {
        let issue_id = issue.id.as_deref().unwrap_or("unknown");
        let summary = issue.fields.summary.as_deref().unwrap_or("Untitled issue");
        let title = match issue.key.as_deref() {
            Some(key) => format!("{key}: {summary}"),
            None => summary.to_string(),
        };
        let url = issue
            .key
            .as_deref()
            .map(|key| format!("{}/browse/{key}", self.base_url));
        let event = |id: String, kind: &str, ts: i64, actor: Option<String>| {
            ActivityEvent::new(SOURCE, self.account_id, id, kind, title.clone(), ts)
                .with_url(url.clone())
                .with_actor(actor)
        };

        let mut events = Vec::new();
        let fields = &issue.fields;

        let creator = fields.creator.clone().unwrap_or_default();
        if creator.is(self.me) {
            if let Some(ts) = epoch(fields.created.as_deref()).filter(|ts| *ts >= self.since_ts) {
                events.push(
                    event(format!("jira:issue:created:{issue_id}"), "issue.created", ts, creator.name_or(self.me))
                        .with_description("Issue created")
                        .with_raw(json!({"issue": issue.key, "summary": summary})),
                );
            }
        }

        let histories = issue
            .changelog
            .as_ref()
            .map(|c| c.histories.as_slice())
            .unwrap_or_default();
        for history in histories {
            let author = history.author.clone().unwrap_or_default();
            if !author.is(self.me) {
                continue;
            }
            let Some(ts) = epoch(history.created.as_deref()).filter(|ts| *ts >= self.since_ts) else {
                continue;
            };
            let history_id = history.id.as_deref().unwrap_or("unknown");
            for item in history.items.iter().filter(|i| i.field.as_deref() == Some("status")) {
                let from = item.from_label.as_deref().unwrap_or("unknown");
                let to = item.to_label.as_deref().unwrap_or("unknown");
                let to_key = item.to.as_deref().unwrap_or(to);
                events.push(
                    event(
                        format!("jira:status:{history_id}:{issue_id}:{to_key}"),
                        "issue.status.changed",
                        ts,
                        author.name_or(self.me),
                    )
                    .with_description(format!("Status: {from} -> {to}"))
                    .with_raw(json!({"issue": issue.key, "from": from, "to": to})),
                );
            }
        }

        let comments = fields
            .comment
            .as_ref()
            .map(|c| c.comments.as_slice())
            .unwrap_or_default();
        for comment in comments {
            let author = comment.author.clone().unwrap_or_default();
            if !author.is(self.me) {
                continue;
            }
            let Some(ts) = epoch(comment.created.as_deref()).filter(|ts| *ts >= self.since_ts) else {
                continue;
            };
            let comment_id = comment.id.as_deref().unwrap_or("unknown");
            events.push(
                event(format!("jira:comment:{comment_id}"), "issue.commented", ts, author.name_or(self.me))
                    .with_description("Comment added")
                    .with_raw(json!({"issue": issue.key, "comment_id": comment_id})),
            );
        }

        // Version count is the original revision plus one per changelog entry.
        let latest = histories
            .iter()
            .filter_map(|h| epoch(h.created.as_deref()).map(|ts| (ts, h)))
            .max_by_key(|(ts, _)| *ts)
            .map(|(_, h)| h);
        let touched_last = latest
            .and_then(|h| h.author.as_ref())
            .is_some_and(|a| a.is(self.me));
        let versions = histories.len() + 1;
        if versions > 1 && touched_last {
            if let Some(ts) = epoch(fields.updated.as_deref()).filter(|ts| *ts >= self.since_ts) {
                let status = fields.status.as_ref().and_then(|s| s.name.as_deref());
                let description = match status {
                    Some(name) => format!("Updated (status: {name})"),
                    None => "Updated".to_string(),
                };
                events.push(
                    event(
                        format!("jira:issue:updated:{issue_id}:{ts}"),
                        "issue.updated",
                        ts,
                        self.me.display_name.clone(),
                    )
                    .with_description(description)
                    .with_raw(json!({"issue": issue.key, "status": status})),
                );
            }
        }

        events
    }
}

fn is_invalid_payload(err: &ApiError) -> bool {
    matches!(err, ApiError::Status { status: 400, body } if body.contains("Invalid request payload"))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JiraSource;

impl JiraSource {
    /// POST one search page. Sites that reject the full payload get the reduced
    /// form, and keep getting it for the rest of the run.
    async fn search_page(
        &self,
        api: &AtlassianApi,
        token: Option<&str>,
        reduced: &mut bool,
    ) -> Result<SearchPage, ConnectorError> {
        if !*reduced {
            let mut body = json!({
                "jql": jql(),
                "maxResults": PAGE_SIZE,
                "fieldsByKeys": false,
                "fields": FIELDS,
            });
            if let Some(token) = token {
                body["nextPageToken"] = json!(token);
            }
            let request = api.post(SEARCH_PATH, body).query("expand", "changelog");
            match api.json::<SearchPage>(&request).await {
                Err(ConnectorError::Api(err)) if is_invalid_payload(&err) => {
                    debug!("jira rejected search payload, retrying reduced form");
                    *reduced = true;
                }
                other => return other,
            }
        }

        let mut body = json!({"jql": jql(), "maxResults": PAGE_SIZE});
        if let Some(token) = token {
            body["nextPageToken"] = json!(token);
        }
        let request = api
            .post(SEARCH_PATH, body)
            .query("expand", "changelog")
            .query("fields", FIELDS.join(","));
        api.json(&request).await
    }
}

#[async_trait]
impl ActivitySource for JiraSource {
    fn service(&self) -> AtlassianService {
        AtlassianService::Jira
    }

    fn label(&self) -> &'static str {
        "Jira"
    }

    async fn fetch(
        &self,
        api: &AtlassianApi,
        account: &AtlassianAccount,
        since_ts: i64,
        ctx: &JobContext,
    ) -> Result<Vec<ActivityEvent>, ConnectorError> {
        let me = api.me(MYSELF_PATH).await?;
        let issues = IssueEvents {
            account_id: &account.account_id,
            base_url: api.base_url(),
            me: &me,
            since_ts,
        };

        let mut events = Vec::new();
        let mut token: Option<String> = None;
        let mut reduced = false;
        for page in 1..=PAGE_CEILING {
            ctx.checkpoint().await?;
            let data = self.search_page(api, token.as_deref(), &mut reduced).await?;
            if data.issues.is_empty() {
                return Ok(events);
            }
            for issue in &data.issues {
                events.extend(issues.collect(issue));
            }
            match data.next_page_token {
                Some(next) if !data.is_last => token = Some(next),
                _ => return Ok(events),
            }
            if page == PAGE_CEILING {
                warn!(account_id = %account.account_id, pages = page, "jira page ceiling reached");
                ctx.log(
                    LogLevel::Warn,
                    &format!("Jira sync stopped after {page} pages"),
                    None,
                )
                .await;
            }
        }
        Ok(events)
    }
}
