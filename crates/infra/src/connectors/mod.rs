//! Connector sync pipelines.
//!
//! Every pipeline follows the same shape: resolve credentials, enumerate
//! collections, pick a resume point from the sync-state store, page through the
//! provider API under a page ceiling, upsert what came back, then persist the new
//! cursor. Handlers check for cancellation between pages and collections.

pub mod activity;
pub mod atlassian;
pub mod calendar;
pub mod confluence;
pub mod jira;

use tidemark_core::AccountId;

use crate::http::ApiError;
use crate::jobs::HandlerError;
use crate::stores::StoreError;

pub use crate::config::FailurePolicy;
pub use activity::ActivitySyncHandler;
pub use calendar::CalendarSyncHandler;
pub use confluence::ConfluenceSource;
pub use jira::JiraSource;

pub const CALENDAR_SYNC_JOB: &str = "connector.calendar.sync";
pub const JIRA_SYNC_JOB: &str = "connector.jira.sync";
pub const CONFLUENCE_SYNC_JOB: &str = "connector.confluence.sync";

/// Pages fetched per query before a pipeline stops and logs a warning.
pub const PAGE_CEILING: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("account_id is required for {0} sync")]
    MissingAccountId(&'static str),

    #[error("{service} account not found: {account_id}")]
    AccountNotFound {
        service: &'static str,
        account_id: AccountId,
    },

    #[error("unsupported calendar provider: {0}")]
    UnsupportedProvider(String),

    /// Stored credentials are unusable; the user must reconnect the account.
    #[error("{0}")]
    Credentials(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sync canceled")]
    Canceled,
}

impl ConnectorError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, ConnectorError::Canceled)
    }
}

impl From<HandlerError> for ConnectorError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Canceled => ConnectorError::Canceled,
            other => ConnectorError::UnexpectedResponse(other.to_string()),
        }
    }
}

impl From<ConnectorError> for HandlerError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Canceled => HandlerError::Canceled,
            ConnectorError::MissingAccountId(_) => HandlerError::InvalidPayload(err.to_string()),
            other => HandlerError::Failed(other.to_string()),
        }
    }
}

/// Read `payload.account_id`.
pub(crate) fn account_id_from(
    payload: &crate::jobs::JsonMap,
    source: &'static str,
) -> Result<AccountId, ConnectorError> {
    payload
        .get("account_id")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(AccountId::from)
        .ok_or(ConnectorError::MissingAccountId(source))
}
