//! Row stores consumed by the sync pipelines.
//!
//! Each store is an async trait with an in-memory implementation; a durable backend
//! plugs in behind the same trait. Writes are idempotent upserts keyed by stable ids.

pub mod accounts;
pub mod activity;
pub mod calendar;
pub mod sync_state;

pub use accounts::{
    AtlassianAccount, AtlassianAccountStore, AtlassianService, CalendarAccount,
    CalendarAccountStore, CalendarCredentials, InMemoryAtlassianAccountStore,
    InMemoryCalendarAccountStore,
};
pub use activity::{ActivityEvent, ActivityQuery, ActivitySink, InMemoryActivitySink, StoredActivity};
pub use calendar::{Calendar, CalendarEvent, CalendarStore, InMemoryCalendarStore};
pub use sync_state::{InMemorySyncStateStore, SyncState, SyncStateStore};

/// Store error shared by the row stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn poisoned(store: &str) -> Self {
        StoreError::Storage(format!("{store} lock poisoned"))
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
