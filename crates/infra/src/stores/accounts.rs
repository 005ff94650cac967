//! Connected provider accounts.
//!
//! Accounts are created by the outer layer (after an OAuth handshake or when the
//! user pastes an API token). The core only reads them, except that the calendar
//! connector persists refreshed tokens.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::AccountId;

use super::StoreError;

/// OAuth token set of a calendar account.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarCredentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl core::fmt::Debug for CalendarCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CalendarCredentials")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarAccount {
    pub account_id: AccountId,
    /// Provider family, e.g. `google`.
    pub provider: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub credentials: CalendarCredentials,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CalendarAccountStore: Send + Sync {
    async fn create(
        &self,
        provider: &str,
        email: Option<String>,
        display_name: Option<String>,
        credentials: CalendarCredentials,
    ) -> Result<CalendarAccount, StoreError>;

    async fn get(&self, account_id: &AccountId) -> Result<Option<CalendarAccount>, StoreError>;

    /// Newest first.
    async fn list(&self) -> Result<Vec<CalendarAccount>, StoreError>;

    async fn update_credentials(
        &self,
        account_id: &AccountId,
        credentials: CalendarCredentials,
    ) -> Result<(), StoreError>;

    /// Returns `false` if the account did not exist.
    async fn delete(&self, account_id: &AccountId) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCalendarAccountStore {
    accounts: RwLock<HashMap<AccountId, CalendarAccount>>,
}

impl InMemoryCalendarAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CalendarAccountStore for InMemoryCalendarAccountStore {
    async fn create(
        &self,
        provider: &str,
        email: Option<String>,
        display_name: Option<String>,
        credentials: CalendarCredentials,
    ) -> Result<CalendarAccount, StoreError> {
        let now = Utc::now();
        let account = CalendarAccount {
            account_id: AccountId::generate("cal"),
            provider: provider.to_string(),
            email,
            display_name,
            credentials,
            created_at: now,
            updated_at: now,
        };
        self.accounts
            .write()
            .map_err(|_| StoreError::poisoned("calendar accounts"))?
            .insert(account.account_id.clone(), account.clone());
        Ok(account)
    }

    async fn get(&self, account_id: &AccountId) -> Result<Option<CalendarAccount>, StoreError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| StoreError::poisoned("calendar accounts"))?;
        Ok(accounts.get(account_id).cloned())
    }

    async fn list(&self) -> Result<Vec<CalendarAccount>, StoreError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| StoreError::poisoned("calendar accounts"))?;
        let mut list: Vec<_> = accounts.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn update_credentials(
        &self,
        account_id: &AccountId,
        credentials: CalendarCredentials,
    ) -> Result<(), StoreError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| StoreError::poisoned("calendar accounts"))?;
        let account = accounts
            .get_mut(account_id)
            .ok_or_else(|| StoreError::not_found("calendar account", account_id))?;
        account.credentials = credentials;
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, account_id: &AccountId) -> Result<bool, StoreError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| StoreError::poisoned("calendar accounts"))?;
        Ok(accounts.remove(account_id).is_some())
    }
}

/// Atlassian product an account is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AtlassianService {
    Jira,
    Confluence,
}

impl AtlassianService {
    /// Also the activity `source` and the connector-key prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            AtlassianService::Jira => "jira",
            AtlassianService::Confluence => "confluence",
        }
    }
}

impl core::fmt::Display for AtlassianService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtlassianAccount {
    pub account_id: AccountId,
    pub service: AtlassianService,
    pub org: String,
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl core::fmt::Debug for AtlassianAccount {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtlassianAccount")
            .field("account_id", &self.account_id)
            .field("service", &self.service)
            .field("base_url", &self.base_url)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl AtlassianAccount {
    pub fn base_url_for(org: &str) -> String {
        format!("https://{org}.atlassian.net")
    }
}

#[async_trait]
pub trait AtlassianAccountStore: Send + Sync {
    async fn create(
        &self,
        service: AtlassianService,
        org: &str,
        email: &str,
        api_token: &str,
    ) -> Result<AtlassianAccount, StoreError>;

    async fn get(&self, account_id: &AccountId) -> Result<Option<AtlassianAccount>, StoreError>;

    /// Newest first, optionally restricted to one service.
    async fn list(
        &self,
        service: Option<AtlassianService>,
    ) -> Result<Vec<AtlassianAccount>, StoreError>;

    async fn delete(&self, account_id: &AccountId) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAtlassianAccountStore {
    accounts: RwLock<HashMap<AccountId, AtlassianAccount>>,
}

impl InMemoryAtlassianAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AtlassianAccountStore for InMemoryAtlassianAccountStore {
    async fn create(
        &self,
        service: AtlassianService,
        org: &str,
        email: &str,
        api_token: &str,
    ) -> Result<AtlassianAccount, StoreError> {
        let now = Utc::now();
        let account = AtlassianAccount {
            account_id: AccountId::generate("atl"),
            service,
            org: org.to_string(),
            base_url: AtlassianAccount::base_url_for(org),
            email: email.to_string(),
            api_token: api_token.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.accounts
            .write()
            .map_err(|_| StoreError::poisoned("atlassian accounts"))?
            .insert(account.account_id.clone(), account.clone());
        Ok(account)
    }

    async fn get(&self, account_id: &AccountId) -> Result<Option<AtlassianAccount>, StoreError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| StoreError::poisoned("atlassian accounts"))?;
        Ok(accounts.get(account_id).cloned())
    }

    async fn list(
        &self,
        service: Option<AtlassianService>,
    ) -> Result<Vec<AtlassianAccount>, StoreError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| StoreError::poisoned("atlassian accounts"))?;
        let mut list: Vec<_> = accounts
            .values()
            .filter(|a| service.is_none_or(|s| a.service == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn delete(&self, account_id: &AccountId) -> Result<bool, StoreError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| StoreError::poisoned("atlassian accounts"))?;
        Ok(accounts.remove(account_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calendar_credentials_are_replaced_in_place() {
        let store = InMemoryCalendarAccountStore::new();
        let account = store
            .create("google", Some("me@example.test".into()), None, CalendarCredentials::default())
            .await
            .unwrap();
        assert!(account.account_id.as_str().starts_with("cal_"));

        let creds = CalendarCredentials {
            access_token: Some("new".into()),
            refresh_token: Some("refresh".into()),
            expires_at: Some(Utc::now()),
        };
        store
            .update_credentials(&account.account_id, creds.clone())
            .await
            .unwrap();

        let loaded = store.get(&account.account_id).await.unwrap().unwrap();
        assert_eq!(loaded.credentials, creds);
        assert!(!format!("{loaded:?}").contains("refresh\""));
    }

    #[tokio::test]
    async fn updating_missing_account_is_not_found() {
        let store = InMemoryCalendarAccountStore::new();
        let err = store
            .update_credentials(&AccountId::from("cal_x"), CalendarCredentials::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn atlassian_accounts_filter_by_service() {
        let store = InMemoryAtlassianAccountStore::new();
        let jira = store
            .create(AtlassianService::Jira, "acme", "me@acme.test", "token")
            .await
            .unwrap();
        store
            .create(AtlassianService::Confluence, "acme", "me@acme.test", "token")
            .await
            .unwrap();

        assert_eq!(jira.base_url, "https://acme.atlassian.net");
        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let only_jira = store.list(Some(AtlassianService::Jira)).await.unwrap();
        assert_eq!(only_jira.len(), 1);
        assert_eq!(only_jira[0].account_id, jira.account_id);

        assert!(store.delete(&jira.account_id).await.unwrap());
        assert!(!store.delete(&jira.account_id).await.unwrap());
        assert!(!format!("{:?}", only_jira[0]).contains("token"));
    }
}
