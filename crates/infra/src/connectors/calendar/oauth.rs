//! Bearer-token handling for calendar accounts.
//!
//! Tokens are refreshed when they expire within [`REFRESH_MARGIN_SECS`]. The
//! read-refresh-persist sequence runs under a per-account lock so concurrent jobs
//! for one account never race on the refresh token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use tidemark_core::AccountId;

use crate::config::OAuthClientConfig;
use crate::connectors::ConnectorError;
use crate::http::{ApiClient, ApiRequest};
use crate::stores::{CalendarAccountStore, CalendarCredentials};

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

/// Whether a token expiring at `expires_at` must be refreshed before use.
///
/// A token without a known expiry is always refreshed.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(at) => at <= now + Duration::seconds(REFRESH_MARGIN_SECS),
        None => true,
    }
}

pub struct TokenRefresher {
    client: ApiClient,
    oauth: OAuthClientConfig,
    accounts: Arc<dyn CalendarAccountStore>,
    locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(
        client: ApiClient,
        oauth: OAuthClientConfig,
        accounts: Arc<dyn CalendarAccountStore>,
    ) -> Self {
        Self {
            client,
            oauth,
            accounts,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, account_id: &AccountId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(account_id.clone())
            .or_default()
            .clone()
    }

    /// A usable access token for the account, refreshed and persisted if needed.
    pub async fn access_token(&self, account_id: &AccountId) -> Result<String, ConnectorError> {
        let lock = self.lock_for(account_id);
        let _guard = lock.lock().await;

        // Re-read under the lock; another job may have refreshed already.
        let account = self.accounts.get(account_id).await?.ok_or_else(|| {
            ConnectorError::AccountNotFound {
                service: "calendar",
                account_id: account_id.clone(),
            }
        })?;
        let creds = account.credentials;
        let access_token = creds
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConnectorError::Credentials("no access token found for this account".into()))?;

        let now = Utc::now();
        match creds.refresh_token.clone().filter(|t| !t.is_empty()) {
            Some(refresh_token) if needs_refresh(creds.expires_at, now) => {
                let refreshed = self.refresh(&refresh_token).await.map_err(|err| {
                    warn!(account_id = %account_id, error = %err, "calendar token refresh failed");
                    ConnectorError::Credentials("authorization expired, reconnect the account".into())
                })?;
                let expires_at = refreshed
                    .expires_in
                    .map(|secs| Utc::now() + Duration::seconds(secs));
                self.accounts
                    .update_credentials(
                        account_id,
                        CalendarCredentials {
                            access_token: Some(refreshed.access_token.clone()),
                            refresh_token: Some(refresh_token),
                            expires_at,
                        },
                    )
                    .await?;
                info!(account_id = %account_id, "calendar token refreshed");
                Ok(refreshed.access_token)
            }
            None if creds.expires_at.is_some() && needs_refresh(creds.expires_at, now) => Err(
                ConnectorError::Credentials("refresh token is missing, reconnect the account".into()),
            ),
            _ => Ok(access_token),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ConnectorError> {
        let request = ApiRequest::post(TOKEN_URL).form(vec![
            ("client_id".into(), self.oauth.client_id.clone()),
            ("client_secret".into(), self.oauth.client_secret.clone()),
            ("refresh_token".into(), refresh_token.to_string()),
            ("grant_type".into(), "refresh_token".into()),
        ]);
        Ok(self.client.json(&request).await?)
    }
}
