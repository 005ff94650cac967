//! Google Calendar v3 REST calls.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use tracing::warn;

use tidemark_core::time;

use crate::connectors::{ConnectorError, PAGE_CEILING};
use crate::http::{ApiClient, ApiError, ApiRequest, Auth};
use crate::jobs::JobContext;

use super::parse::{CalendarListEntry, GoogleEvent};

pub const API_BASE: &str = "https://www.googleapis.com/calendar/v3";
const EVENTS_PAGE_SIZE: u32 = 250;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CalendarListPage {
    items: Vec<CalendarListEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EventsPage {
    items: Vec<GoogleEvent>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

/// How to read a calendar's events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventsQuery {
    /// Bounded full listing.
    Window {
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    },
    /// Changes since a previous listing.
    Incremental(String),
}

#[derive(Debug, Default)]
pub struct EventsBatch {
    pub items: Vec<GoogleEvent>,
    /// Only present once the listing was read to its last page.
    pub next_sync_token: Option<String>,
}

/// Google answers 410 Gone when a sync token is no longer valid.
pub fn is_sync_token_expired(err: &ConnectorError) -> bool {
    matches!(err, ConnectorError::Api(ApiError::Status { status: 410, .. }))
}

#[derive(Debug, Clone)]
pub struct GoogleCalendarApi {
    client: ApiClient,
    base_url: String,
}

impl GoogleCalendarApi {
    pub fn new(client: ApiClient) -> Self {
        Self::with_base_url(client, API_BASE)
    }

    pub fn with_base_url(client: ApiClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// `base/segments...`, with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<String, ConnectorError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| ConnectorError::UnexpectedResponse(format!("invalid base url: {err}")))?;
        url.path_segments_mut()
            .map_err(|()| ConnectorError::UnexpectedResponse("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.to_string())
    }

    /// Checks for cancellation before every page.
    pub async fn list_calendars(
        &self,
        token: &str,
        ctx: &JobContext,
    ) -> Result<Vec<CalendarListEntry>, ConnectorError> {
        let url = self.url(&["users", "me", "calendarList"])?;
        let mut entries = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..PAGE_CEILING {
            ctx.checkpoint().await?;
            let mut request = ApiRequest::get(url.as_str()).auth(Auth::Bearer(token.to_string()));
            if let Some(page_token) = &page_token {
                request = request.query("pageToken", page_token);
            }
            let page: CalendarListPage = self.client.json(&request).await?;
            entries.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(entries),
            }
        }
        warn!(pages = PAGE_CEILING, "calendar list page ceiling reached");
        Ok(entries)
    }

    pub async fn list_events(
        &self,
        token: &str,
        calendar_id: &str,
        query: &EventsQuery,
        ctx: &JobContext,
    ) -> Result<EventsBatch, ConnectorError> {
        let url = self.url(&["calendars", calendar_id, "events"])?;
        let mut batch = EventsBatch::default();
        let mut page_token: Option<String> = None;
        for _ in 0..PAGE_CEILING {
            ctx.checkpoint().await?;
            let mut request = ApiRequest::get(url.as_str())
                .auth(Auth::Bearer(token.to_string()))
                .query("singleEvents", true)
                .query("showDeleted", true)
                .query("maxResults", EVENTS_PAGE_SIZE);
            request = match query {
                EventsQuery::Window { time_min, time_max } => request
                    .query("orderBy", "startTime")
                    .query("timeMin", time::format_timestamp(time_min))
                    .query("timeMax", time::format_timestamp(time_max)),
                EventsQuery::Incremental(sync_token) => request.query("syncToken", sync_token),
            };
            if let Some(page_token) = &page_token {
                request = request.query("pageToken", page_token);
            }

            let page: EventsPage = self.client.json(&request).await?;
            batch.items.extend(page.items);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => {
                    batch.next_sync_token = page.next_sync_token;
                    return Ok(batch);
                }
            }
        }
        warn!(calendar_id, pages = PAGE_CEILING, "calendar events page ceiling reached");
        Ok(batch)
    }
}
