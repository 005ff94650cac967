//! Local mirror of remote calendars and their events.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tidemark_core::AccountId;

use super::StoreError;

/// A calendar of a connected account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub account_id: AccountId,
    pub calendar_id: String,
    pub provider: String,
    pub name: String,
    pub description: Option<String>,
    pub primary: bool,
    pub access_role: Option<String>,
    pub background_color: Option<String>,
    pub foreground_color: Option<String>,
    pub time_zone: Option<String>,
    /// User choice; survives re-listing.
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub account_id: AccountId,
    pub calendar_id: String,
    pub event_id: String,
    pub title: String,
    pub description: Option<String>,
    /// Provider value: RFC 3339 date-time, or a bare date for all-day events.
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub all_day: bool,
    pub location: Option<String>,
    pub conference_url: Option<String>,
    pub visibility: Option<String>,
    pub status: String,
    pub organizer: Option<JsonValue>,
    pub attendees: Option<JsonValue>,
    pub html_link: Option<String>,
    pub time_zone: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl CalendarEvent {
    /// Whether the event intersects `[start_ts, end_ts)`.
    pub fn overlaps(&self, start_ts: i64, end_ts: i64) -> bool {
        match (self.start_ts, self.end_ts) {
            (Some(start), Some(end)) => start < end_ts && end > start_ts,
            _ => false,
        }
    }
}

#[async_trait]
pub trait CalendarStore: Send + Sync {
    /// Mirror a calendar listing. Known calendars keep their `selected` flag; new
    /// ones take the flag from the input.
    async fn upsert_calendars(&self, calendars: &[Calendar]) -> Result<(), StoreError>;

    /// Remove calendars (and their events) of the account not in `keep_ids`.
    /// Returns the ids of the pruned calendars.
    async fn prune_calendars(
        &self,
        account_id: &AccountId,
        keep_ids: &[String],
    ) -> Result<Vec<String>, StoreError>;

    /// Primary first, then by name.
    async fn list_calendars(
        &self,
        account_id: &AccountId,
        selected_only: bool,
    ) -> Result<Vec<Calendar>, StoreError>;

    async fn set_selected(
        &self,
        account_id: &AccountId,
        calendar_id: &str,
        selected: bool,
    ) -> Result<(), StoreError>;

    async fn upsert_events(&self, events: &[CalendarEvent]) -> Result<usize, StoreError>;

    async fn delete_events(
        &self,
        account_id: &AccountId,
        calendar_id: &str,
        event_ids: &[String],
    ) -> Result<usize, StoreError>;

    /// Delete events of one calendar overlapping `[start_ts, end_ts)`.
    async fn delete_events_in_range(
        &self,
        account_id: &AccountId,
        calendar_id: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<usize, StoreError>;

    /// Non-cancelled events of the account overlapping the window, by start time.
    async fn list_events(
        &self,
        account_id: &AccountId,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<CalendarEvent>, StoreError>;

    async fn delete_account(&self, account_id: &AccountId) -> Result<(), StoreError>;
}

type CalendarKey = (AccountId, String);
type EventKey = (AccountId, String, String);

#[derive(Debug, Default)]
struct CalendarRows {
    calendars: BTreeMap<CalendarKey, Calendar>,
    events: BTreeMap<EventKey, CalendarEvent>,
}

#[derive(Debug, Default)]
pub struct InMemoryCalendarStore {
    rows: RwLock<CalendarRows>,
}

impl InMemoryCalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self) -> usize {
        self.rows.read().map(|rows| rows.events.len()).unwrap_or(0)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, CalendarRows>, StoreError> {
        self.rows.write().map_err(|_| StoreError::poisoned("calendar"))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, CalendarRows>, StoreError> {
        self.rows.read().map_err(|_| StoreError::poisoned("calendar"))
    }
}

#[async_trait]
impl CalendarStore for InMemoryCalendarStore {
    async fn upsert_calendars(&self, calendars: &[Calendar]) -> Result<(), StoreError> {
        let mut rows = self.write()?;
        for calendar in calendars {
            let key = (calendar.account_id.clone(), calendar.calendar_id.clone());
            let selected = rows
                .calendars
                .get(&key)
                .map_or(calendar.selected, |existing| existing.selected);
            rows.calendars.insert(
                key,
                Calendar {
                    selected,
                    ..calendar.clone()
                },
            );
        }
        Ok(())
    }

    async fn prune_calendars(
        &self,
        account_id: &AccountId,
        keep_ids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let keep: HashSet<&str> = keep_ids.iter().map(String::as_str).collect();
        let mut rows = self.write()?;

        let pruned: Vec<String> = rows
            .calendars
            .keys()
            .filter(|(account, id)| account == account_id && !keep.contains(id.as_str()))
            .map(|(_, id)| id.clone())
            .collect();

        rows.calendars
            .retain(|(account, id), _| account != account_id || keep.contains(id.as_str()));
        rows.events
            .retain(|(account, calendar, _), _| account != account_id || keep.contains(calendar.as_str()));
        Ok(pruned)
    }

    async fn list_calendars(
        &self,
        account_id: &AccountId,
        selected_only: bool,
    ) -> Result<Vec<Calendar>, StoreError> {
        let rows = self.read()?;
        let mut list: Vec<_> = rows
            .calendars
            .values()
            .filter(|c| &c.account_id == account_id && (!selected_only || c.selected))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.primary.cmp(&a.primary).then_with(|| a.name.cmp(&b.name)));
        Ok(list)
    }

    async fn set_selected(
        &self,
        account_id: &AccountId,
        calendar_id: &str,
        selected: bool,
    ) -> Result<(), StoreError> {
        let mut rows = self.write()?;
        let calendar = rows
            .calendars
            .get_mut(&(account_id.clone(), calendar_id.to_string()))
            .ok_or_else(|| StoreError::not_found("calendar", calendar_id))?;
        calendar.selected = selected;
        Ok(())
    }

    async fn upsert_events(&self, events: &[CalendarEvent]) -> Result<usize, StoreError> {
        let mut rows = self.write()?;
        for event in events {
            rows.events.insert(
                (
                    event.account_id.clone(),
                    event.calendar_id.clone(),
                    event.event_id.clone(),
                ),
                event.clone(),
            );
        }
        Ok(events.len())
    }

    async fn delete_events(
        &self,
        account_id: &AccountId,
        calendar_id: &str,
        event_ids: &[String],
    ) -> Result<usize, StoreError> {
        let mut rows = self.write()?;
        let mut removed = 0;
        for event_id in event_ids {
            let key = (account_id.clone(), calendar_id.to_string(), event_id.clone());
            if rows.events.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_events_in_range(
        &self,
        account_id: &AccountId,
        calendar_id: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<usize, StoreError> {
        let mut rows = self.write()?;
        let before = rows.events.len();
        rows.events.retain(|(account, calendar, _), event| {
            !(account == account_id && calendar == calendar_id && event.overlaps(start_ts, end_ts))
        });
        Ok(before - rows.events.len())
    }

    async fn list_events(
        &self,
        account_id: &AccountId,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<CalendarEvent>, StoreError> {
        let rows = self.read()?;
        let mut list: Vec<_> = rows
            .events
            .values()
            .filter(|e| {
                &e.account_id == account_id
                    && e.status != "cancelled"
                    && e.overlaps(start_ts, end_ts)
            })
            .cloned()
            .collect();
        list.sort_by_key(|e| e.start_ts);
        Ok(list)
    }

    async fn delete_account(&self, account_id: &AccountId) -> Result<(), StoreError> {
        let mut rows = self.write()?;
        rows.calendars.retain(|(account, _), _| account != account_id);
        rows.events.retain(|(account, _, _), _| account != account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountId {
        AccountId::from("cal_1")
    }

    fn calendar(id: &str, selected: bool) -> Calendar {
        Calendar {
            account_id: account(),
            calendar_id: id.to_string(),
            provider: "google".to_string(),
            name: id.to_string(),
            description: None,
            primary: id == "primary",
            access_role: Some("owner".into()),
            background_color: None,
            foreground_color: None,
            time_zone: None,
            selected,
        }
    }

    fn event(calendar_id: &str, id: &str, start: i64, end: i64) -> CalendarEvent {
        CalendarEvent {
            account_id: account(),
            calendar_id: calendar_id.to_string(),
            event_id: id.to_string(),
            title: id.to_string(),
            description: None,
            start_time: None,
            end_time: None,
            start_ts: Some(start),
            end_ts: Some(end),
            all_day: false,
            location: None,
            conference_url: None,
            visibility: None,
            status: "confirmed".to_string(),
            organizer: None,
            attendees: None,
            html_link: None,
            time_zone: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn relisting_preserves_selection() {
        let store = InMemoryCalendarStore::new();
        store.upsert_calendars(&[calendar("primary", true), calendar("team", true)]).await.unwrap();
        store.set_selected(&account(), "team", false).await.unwrap();

        let mut renamed = calendar("team", true);
        renamed.name = "Team (renamed)".into();
        store.upsert_calendars(&[calendar("primary", true), renamed]).await.unwrap();

        let listed = store.list_calendars(&account(), false).await.unwrap();
        assert_eq!(listed[0].calendar_id, "primary");
        assert_eq!(listed[1].name, "Team (renamed)");
        assert!(!listed[1].selected);
        assert_eq!(store.list_calendars(&account(), true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pruning_drops_missing_calendars_and_their_events() {
        let store = InMemoryCalendarStore::new();
        store.upsert_calendars(&[calendar("primary", true), calendar("old", true)]).await.unwrap();
        store
            .upsert_events(&[event("primary", "a", 0, 10), event("old", "b", 0, 10)])
            .await
            .unwrap();

        let pruned = store.prune_calendars(&account(), &["primary".to_string()]).await.unwrap();
        assert_eq!(pruned, vec!["old".to_string()]);
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn range_delete_only_touches_overlapping_events() {
        let store = InMemoryCalendarStore::new();
        store
            .upsert_events(&[
                event("primary", "before", 0, 10),
                event("primary", "inside", 20, 30),
                event("primary", "straddle", 90, 110),
                event("other", "inside-other", 20, 30),
            ])
            .await
            .unwrap();

        let removed = store.delete_events_in_range(&account(), "primary", 15, 100).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn listing_skips_cancelled_events() {
        let store = InMemoryCalendarStore::new();
        let mut cancelled = event("primary", "gone", 5, 6);
        cancelled.status = "cancelled".into();
        store
            .upsert_events(&[event("primary", "late", 50, 60), event("primary", "early", 1, 2), cancelled])
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_events(&account(), 0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }
}
