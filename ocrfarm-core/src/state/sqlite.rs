//! SQLite-backed runtime state store.
//!
//! The database file is shared with other processes (dashboard, limit detector),
//! so the connection runs in WAL mode with a busy timeout, and every mutation is
//! a single statement. Timestamps are stored as epoch milliseconds.

use super::{RuntimeState, RuntimeStateStore};
use crate::error::{FarmError, Result};
use crate::profile::ProfileName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS profile_runtime_state (
    profile_name   TEXT PRIMARY KEY,
    is_paused      INTEGER NOT NULL DEFAULT 0,
    pause_until    INTEGER,
    pause_reason   TEXT,
    current_action TEXT,
    last_updated   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_profile_runtime_state_pause
    ON profile_runtime_state (is_paused, pause_until);
";

const SELECT_COLUMNS: &str =
    "profile_name, is_paused, pause_until, pause_reason, current_action, last_updated";

#[derive(Clone)]
pub struct SqliteRuntimeStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRuntimeStateStore {
    /// Open (creating if needed) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Opened runtime state store {} (journal_mode={})", path.display(), mode);
        Self::with_connection(conn)
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| FarmError::Store("runtime state store lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| FarmError::Store(format!("runtime state store task failed: {}", e)))?
    }
}

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

struct RawRow {
    profile_name: String,
    is_paused: bool,
    pause_until: Option<i64>,
    pause_reason: Option<String>,
    current_action: Option<String>,
    last_updated: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            profile_name: row.get(0)?,
            is_paused: row.get(1)?,
            pause_until: row.get(2)?,
            pause_reason: row.get(3)?,
            current_action: row.get(4)?,
            last_updated: row.get(5)?,
        })
    }

    /// Rows written by other tools may carry names this crate rejects; those are skipped
    fn into_state(self) -> Option<RuntimeState> {
        let profile = match ProfileName::new(&self.profile_name) {
            Ok(profile) => profile,
            Err(e) => {
                warn!("Ignoring runtime state row {:?}: {}", self.profile_name, e);
                return None;
            }
        };
        let is_paused = self.is_paused;
        Some(RuntimeState {
            profile,
            is_paused,
            pause_until: if is_paused {
                self.pause_until.and_then(from_millis)
            } else {
                None
            },
            pause_reason: if is_paused { self.pause_reason } else { None },
            current_action: self.current_action,
            last_updated: from_millis(self.last_updated).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl RuntimeStateStore for SqliteRuntimeStateStore {
    async fn get(&self, profile: &ProfileName) -> Result<Option<RuntimeState>> {
        let name = profile.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM profile_runtime_state WHERE profile_name = ?1",
                        SELECT_COLUMNS
                    ),
                    params![name],
                    RawRow::read,
                )
                .optional()?;
            Ok(raw.and_then(RawRow::into_state))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<RuntimeState>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM profile_runtime_state ORDER BY profile_name",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map([], RawRow::read)?;
            let mut states = Vec::new();
            for row in rows {
                if let Some(state) = row?.into_state() {
                    states.push(state);
                }
            }
            Ok(states)
        })
        .await
    }

    async fn set_pause(
        &self,
        profile: &ProfileName,
        until: Option<DateTime<Utc>>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let name = profile.to_string();
        let until = until.map(to_millis);
        let reason = reason.map(str::to_string);
        let now = to_millis(now);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO profile_runtime_state
                     (profile_name, is_paused, pause_until, pause_reason, last_updated)
                 VALUES (?1, 1, ?2, ?3, ?4)
                 ON CONFLICT(profile_name) DO UPDATE SET
                     is_paused = 1,
                     pause_until = excluded.pause_until,
                     pause_reason = excluded.pause_reason,
                     last_updated = excluded.last_updated",
                params![name, until, reason, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn expired_pauses(&self, now: DateTime<Utc>) -> Result<Vec<ProfileName>> {
        let now = to_millis(now);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT profile_name FROM profile_runtime_state
                 WHERE is_paused = 1 AND pause_until IS NOT NULL AND pause_until <= ?1
                 ORDER BY profile_name",
            )?;
            let names = stmt.query_map(params![now], |row| row.get::<_, String>(0))?;
            let mut expired = Vec::new();
            for name in names {
                let name = name?;
                match ProfileName::new(&name) {
                    Ok(profile) => expired.push(profile),
                    Err(e) => warn!("Ignoring expired pause for {:?}: {}", name, e),
                }
            }
            Ok(expired)
        })
        .await
    }

    async fn clear_pause_if_paused(
        &self,
        profile: &ProfileName,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let name = profile.to_string();
        let now = to_millis(now);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE profile_runtime_state
                 SET is_paused = 0, pause_until = NULL, pause_reason = NULL, last_updated = ?2
                 WHERE profile_name = ?1 AND is_paused = 1",
                params![name, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn set_current_action(
        &self,
        profile: &ProfileName,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let name = profile.to_string();
        let action = action.to_string();
        let now = to_millis(now);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO profile_runtime_state (profile_name, current_action, last_updated)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(profile_name) DO UPDATE SET
                     current_action = excluded.current_action,
                     last_updated = excluded.last_updated",
                params![name, action, now],
            )?;
            Ok(())
        })
        .await
    }
}
