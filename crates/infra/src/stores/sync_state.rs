//! Resume points for incremental syncs.
//!
//! One row per [`ConnectorKey`]. A pipeline writes its row only after a pass over
//! that scope completed; the scheduler reads `last_sync_at` to decide due-ness.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidemark_core::{AccountId, ConnectorKey};

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub connector_key: ConnectorKey,
    /// Opaque provider cursor; `None` forces a bounded full sync next time.
    pub cursor: Option<String>,
    pub last_sync_at: DateTime<Utc>,
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get(&self, key: &ConnectorKey) -> Result<Option<SyncState>, StoreError>;

    /// Insert or replace the row, stamping `last_sync_at` with now.
    async fn upsert(&self, key: &ConnectorKey, cursor: Option<String>)
    -> Result<SyncState, StoreError>;

    /// Returns `false` when there was no row.
    async fn delete(&self, key: &ConnectorKey) -> Result<bool, StoreError>;

    /// Latest `last_sync_at` across the account scope and all of its collections.
    async fn last_sync_for(
        &self,
        source: &str,
        account_id: &AccountId,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Drop every row of the account. Returns how many were removed.
    async fn delete_account(&self, source: &str, account_id: &AccountId)
    -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySyncStateStore {
    rows: RwLock<HashMap<ConnectorKey, SyncState>>,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row with an explicit timestamp.
    pub fn insert(&self, state: SyncState) -> Result<(), StoreError> {
        self.rows
            .write()
            .map_err(|_| StoreError::poisoned("sync state"))?
            .insert(state.connector_key.clone(), state);
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn get(&self, key: &ConnectorKey) -> Result<Option<SyncState>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::poisoned("sync state"))?;
        Ok(rows.get(key).cloned())
    }

    async fn upsert(
        &self,
        key: &ConnectorKey,
        cursor: Option<String>,
    ) -> Result<SyncState, StoreError> {
        let state = SyncState {
            connector_key: key.clone(),
            cursor,
            last_sync_at: Utc::now(),
        };
        let mut rows = self.rows.write().map_err(|_| StoreError::poisoned("sync state"))?;
        rows.insert(key.clone(), state.clone());
        Ok(state)
    }

    async fn delete(&self, key: &ConnectorKey) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::poisoned("sync state"))?;
        Ok(rows.remove(key).is_some())
    }

    async fn last_sync_for(
        &self,
        source: &str,
        account_id: &AccountId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::poisoned("sync state"))?;
        Ok(rows
            .values()
            .filter(|s| s.connector_key.belongs_to(source, account_id))
            .map(|s| s.last_sync_at)
            .max())
    }

    async fn delete_account(
        &self,
        source: &str,
        account_id: &AccountId,
    ) -> Result<usize, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::poisoned("sync state"))?;
        let before = rows.len();
        rows.retain(|key, _| !key.belongs_to(source, account_id));
        Ok(before - rows.len())
    }
}
