//! In-memory runtime state store

use super::{RuntimeState, RuntimeStateStore};
use crate::error::Result;
use crate::profile::ProfileName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-local store, for tests and single-process setups
#[derive(Debug, Clone, Default)]
pub struct InMemoryRuntimeStateStore {
    rows: Arc<RwLock<BTreeMap<ProfileName, RuntimeState>>>,
}

impl InMemoryRuntimeStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStateStore for InMemoryRuntimeStateStore {
    async fn get(&self, profile: &ProfileName) -> Result<Option<RuntimeState>> {
        Ok(self.rows.read().await.get(profile).cloned())
    }

    async fn list(&self) -> Result<Vec<RuntimeState>> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn set_pause(
        &self,
        profile: &ProfileName,
        until: Option<DateTime<Utc>>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .entry(profile.clone())
            .or_insert_with(|| RuntimeState::new(profile.clone(), now));
        row.is_paused = true;
        row.pause_until = until;
        row.pause_reason = reason.map(str::to_string);
        row.last_updated = now;
        Ok(())
    }

    async fn expired_pauses(&self, now: DateTime<Utc>) -> Result<Vec<ProfileName>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.pause_expired(now))
            .map(|row| row.profile.clone())
            .collect())
    }

    async fn clear_pause_if_paused(
        &self,
        profile: &ProfileName,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(profile) {
            Some(row) if row.is_paused => {
                row.is_paused = false;
                row.pause_until = None;
                row.pause_reason = None;
                row.last_updated = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_current_action(
        &self,
        profile: &ProfileName,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .entry(profile.clone())
            .or_insert_with(|| RuntimeState::new(profile.clone(), now));
        row.current_action = Some(action.to_string());
        row.last_updated = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[tokio::test]
    async fn pause_and_expire() {
        contract::pause_and_expire(&InMemoryRuntimeStateStore::new()).await;
    }

    #[tokio::test]
    async fn conditional_clear_has_one_winner() {
        contract::conditional_clear_has_one_winner(&InMemoryRuntimeStateStore::new()).await;
    }

    #[tokio::test]
    async fn current_action_creates_row() {
        contract::current_action_creates_row(&InMemoryRuntimeStateStore::new()).await;
    }
}
