//! Sync-state keys.
//!
//! Every resumable sync scope is addressed by a free-form key of the shape
//! `source:account_id[:subresource]`, e.g. `jira:atl_42` or
//! `calendar:cal_7:primary@example.com`. Sub-resources may themselves contain
//! colons; only the first two separators are structural.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::AccountId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorKey(String);

impl ConnectorKey {
    /// Account-wide scope (`source:account`).
    pub fn account(source: &str, account_id: &AccountId) -> Self {
        Self(format!("{source}:{account_id}"))
    }

    /// Per-collection scope (`source:account:subresource`).
    pub fn collection(source: &str, account_id: &AccountId, subresource: &str) -> Self {
        Self(format!("{source}:{account_id}:{subresource}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn source(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    pub fn account_id(&self) -> Option<&str> {
        self.0.splitn(3, ':').nth(1)
    }

    pub fn subresource(&self) -> Option<&str> {
        self.0.splitn(3, ':').nth(2)
    }

    /// True when this key is the account scope or one of its collections.
    pub fn belongs_to(&self, source: &str, account_id: &AccountId) -> bool {
        self.source() == source && self.account_id() == Some(account_id.as_str())
    }
}

impl core::fmt::Display for ConnectorKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConnectorKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        let account = parts.next().unwrap_or_default();
        if source.is_empty() || account.is_empty() {
            return Err(CoreError::InvalidConnectorKey(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}
