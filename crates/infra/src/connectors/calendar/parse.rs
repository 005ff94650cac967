//! Google Calendar payloads and their mapping onto stored rows.

use serde::Deserialize;
use serde_json::Value as JsonValue;

use tidemark_core::{AccountId, time};

use crate::stores::{Calendar, CalendarEvent};

use super::PROVIDER;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalendarListEntry {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub primary: bool,
    pub access_role: Option<String>,
    pub background_color: Option<String>,
    pub foreground_color: Option<String>,
    pub time_zone: Option<String>,
}

impl CalendarListEntry {
    /// Newly discovered calendars start out selected.
    pub fn into_calendar(self, account_id: &AccountId) -> Calendar {
        Calendar {
            account_id: account_id.clone(),
            calendar_id: self.id,
            provider: PROVIDER.to_string(),
            name: self.summary.unwrap_or_default(),
            description: self.description,
            primary: self.primary,
            access_role: self.access_role,
            background_color: self.background_color,
            foreground_color: self.foreground_color,
            time_zone: self.time_zone,
            selected: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventTime {
    pub date: Option<String>,
    pub date_time: Option<String>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntryPoint {
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConferenceData {
    pub entry_points: Vec<EntryPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GoogleEvent {
    pub id: String,
    pub status: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: EventTime,
    pub end: EventTime,
    pub visibility: Option<String>,
    pub organizer: Option<JsonValue>,
    pub attendees: Option<JsonValue>,
    pub html_link: Option<String>,
    pub hangout_link: Option<String>,
    pub conference_data: Option<ConferenceData>,
    pub created: Option<String>,
    pub updated: Option<String>,
}

/// What one provider event means for the local store.
#[derive(Debug, Clone, PartialEq)]
pub enum EventChange {
    Upsert(Box<CalendarEvent>),
    /// Cancelled upstream; remove the local row.
    Delete(String),
}

impl GoogleEvent {
    fn conference_url(&self) -> Option<String> {
        if let Some(link) = self.hangout_link.as_ref().filter(|l| !l.is_empty()) {
            return Some(link.clone());
        }
        self.conference_data
            .as_ref()?
            .entry_points
            .iter()
            .find_map(|entry| entry.uri.clone().filter(|u| !u.is_empty()))
    }

    pub fn into_change(
        self,
        account_id: &AccountId,
        calendar_id: &str,
        calendar_tz: Option<&str>,
    ) -> EventChange {
        let status = self.status.clone().unwrap_or_else(|| "confirmed".to_string());
        if status == "cancelled" {
            return EventChange::Delete(self.id);
        }

        let all_day = self.start.date.is_some();
        let start_time = self.start.date.clone().or_else(|| self.start.date_time.clone());
        let end_time = self.end.date.clone().or_else(|| self.end.date_time.clone());
        // Naive and all-day values are read as UTC.
        let epoch = |v: &Option<String>| v.as_deref().and_then(|v| time::parse_epoch(v).ok());
        let non_empty = |tz: Option<&str>| tz.filter(|t| !t.is_empty()).map(str::to_string);
        let time_zone = non_empty(self.start.time_zone.as_deref())
            .or_else(|| non_empty(self.end.time_zone.as_deref()))
            .or_else(|| non_empty(calendar_tz))
            .unwrap_or_else(|| "UTC".to_string());

        EventChange::Upsert(Box::new(CalendarEvent {
            account_id: account_id.clone(),
            calendar_id: calendar_id.to_string(),
            start_ts: epoch(&start_time),
            end_ts: epoch(&end_time),
            conference_url: self.conference_url(),
            event_id: self.id,
            title: self.summary.unwrap_or_else(|| "(No title)".to_string()),
            description: self.description,
            start_time,
            end_time,
            all_day,
            location: self.location,
            visibility: self.visibility,
            status,
            organizer: self.organizer,
            attendees: self.attendees,
            html_link: self.html_link,
            time_zone: Some(time_zone),
            created_at: self.created,
            updated_at: self.updated,
        }))
    }
}
