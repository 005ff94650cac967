//! Shared plumbing for the Atlassian connectors (Jira, Confluence).

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::http::{ApiClient, ApiRequest, Auth};
use crate::stores::AtlassianAccount;

use super::ConnectorError;

/// The authenticated user as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub account_id: Option<String>,
    pub display_name: Option<String>,
}

/// A user reference embedded in provider payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRef {
    pub account_id: Option<String>,
    pub display_name: Option<String>,
}

impl UserRef {
    pub fn is(&self, me: &Me) -> bool {
        self.account_id.as_deref() == Some(me.account_id.as_str())
    }

    /// Display name, falling back to the current user's name.
    pub fn name_or(&self, me: &Me) -> Option<String> {
        self.display_name.clone().or_else(|| me.display_name.clone())
    }
}

/// Resolved current user; every activity filter is relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Me {
    pub account_id: String,
    pub display_name: Option<String>,
}

/// Basic-auth client bound to one Atlassian account.
#[derive(Debug, Clone)]
pub struct AtlassianApi {
    client: ApiClient,
    base_url: String,
    auth: Auth,
    email: String,
}

impl AtlassianApi {
    pub fn new(client: ApiClient, account: &AtlassianAccount) -> Self {
        Self {
            client,
            base_url: account.base_url.trim_end_matches('/').to_string(),
            auth: Auth::Basic {
                username: account.email.clone(),
                password: account.api_token.clone(),
            },
            email: account.email.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn get(&self, path: &str) -> ApiRequest {
        ApiRequest::get(format!("{}{}", self.base_url, path)).auth(self.auth.clone())
    }

    pub fn post(&self, path: &str, body: JsonValue) -> ApiRequest {
        ApiRequest::post(format!("{}{}", self.base_url, path))
            .auth(self.auth.clone())
            .header("Content-Type", "application/json")
            .json(body)
    }

    pub async fn json<T: serde::de::DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, ConnectorError> {
        Ok(self.client.json(request).await?)
    }

    /// Resolve the current user from an identity endpoint.
    ///
    /// Falls back to the account email for the display name.
    pub async fn me(&self, path: &str) -> Result<Me, ConnectorError> {
        let identity: Identity = self.json(&self.get(path)).await?;
        let account_id = identity
            .account_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ConnectorError::UnexpectedResponse("identity response has no accountId".into())
            })?;
        Ok(Me {
            account_id,
            display_name: identity.display_name.or_else(|| Some(self.email.clone())),
        })
    }

    /// Absolute link for a `webui`-style path.
    pub fn web_url(&self, link: Option<&str>) -> Option<String> {
        let link = link.filter(|l| !l.is_empty())?;
        if link.starts_with("http") {
            Some(link.to_string())
        } else {
            Some(format!("{}{}", self.base_url, link))
        }
    }
}
