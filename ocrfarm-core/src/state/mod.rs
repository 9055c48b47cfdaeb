//! Durable per-profile runtime state shared with the dashboard and the limit detector
//!
//! The store is the only channel between the pause writer (the external rate-limit
//! detector), the pause scheduler that clears expired pauses, and the supervisor
//! that reports what a profile is currently doing.

mod memory;
mod sqlite;

pub use memory::InMemoryRuntimeStateStore;
pub use sqlite::SqliteRuntimeStateStore;

use crate::error::Result;
use crate::profile::ProfileName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Values written to `current_action` by the supervisor
pub mod actions {
    pub const STARTING: &str = "starting";
    pub const STOPPED: &str = "stopped";
}

/// Scheduling state of one profile.
///
/// When `is_paused` is false, `pause_until` and `pause_reason` are always `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub profile: ProfileName,
    pub is_paused: bool,
    /// End of the pause window; `None` while paused means paused indefinitely
    pub pause_until: Option<DateTime<Utc>>,
    /// Display-only
    pub pause_reason: Option<String>,
    pub current_action: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl RuntimeState {
    /// Fresh, unpaused row
    pub fn new(profile: ProfileName, now: DateTime<Utc>) -> Self {
        Self {
            profile,
            is_paused: false,
            pause_until: None,
            pause_reason: None,
            current_action: None,
            last_updated: now,
        }
    }

    /// Paused with a deadline at or before `now`
    pub fn pause_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_paused && self.pause_until.is_some_and(|until| until <= now)
    }

    /// Paused and the deadline, if any, still lies ahead
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.is_paused && !self.pause_expired(now)
    }
}

/// Persistence for [`RuntimeState`] rows.
///
/// Rows are created implicitly on first write and never deleted.
#[async_trait]
pub trait RuntimeStateStore: Send + Sync {
    /// Row for one profile
    async fn get(&self, profile: &ProfileName) -> Result<Option<RuntimeState>>;

    /// All rows, ordered by profile name
    async fn list(&self) -> Result<Vec<RuntimeState>>;

    /// Pause a profile until `until` (indefinitely when `None`)
    async fn set_pause(
        &self,
        profile: &ProfileName,
        until: Option<DateTime<Utc>>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Profiles whose pause deadline is at or before `now`
    async fn expired_pauses(&self, now: DateTime<Utc>) -> Result<Vec<ProfileName>>;

    /// Clear the pause fields, but only if the row is still paused.
    ///
    /// Returns `true` for the single caller whose update took effect.
    async fn clear_pause_if_paused(&self, profile: &ProfileName, now: DateTime<Utc>)
    -> Result<bool>;

    /// Record what the supervisor is doing with a profile
    async fn set_current_action(
        &self,
        profile: &ProfileName,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
}
