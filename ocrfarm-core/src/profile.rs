//! Profile identity and the on-disk locations derived from it

use crate::error::{FarmError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Maximum accepted profile name length
pub const MAX_PROFILE_NAME_LEN: usize = 64;

/// Validated profile name.
///
/// A profile is one independent worker/browser session. Names are restricted to
/// ASCII alphanumerics, `-`, `_` and `.` so they can be used verbatim in file
/// names, environment values and remote shell commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileName(String);

impl ProfileName {
    /// Validate and wrap a profile name
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref().trim();

        if name.is_empty() {
            return Err(FarmError::InvalidProfile(
                "profile name cannot be empty".to_string(),
            ));
        }

        if name.len() > MAX_PROFILE_NAME_LEN {
            return Err(FarmError::InvalidProfile(format!(
                "profile name too long: {}",
                name
            )));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(FarmError::InvalidProfile(format!(
                "invalid profile name format: {}",
                name
            )));
        }

        if name.contains("..") {
            return Err(FarmError::InvalidProfile(format!(
                "profile name contains path traversal characters: {}",
                name
            )));
        }

        Ok(Self(name.to_string()))
    }

    /// Borrow the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProfileName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ProfileName {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProfileName {
    type Error = FarmError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ProfileName> for String {
    fn from(value: ProfileName) -> Self {
        value.0
    }
}

const SESSION_MARKER: &str = ".session_start";

/// Filesystem layout shared with the workers and the dashboard
#[derive(Debug, Clone)]
pub struct ProfilePaths {
    logs_dir: PathBuf,
    profiles_root: PathBuf,
}

impl ProfilePaths {
    /// Create a layout rooted at the given logs and browser-profile directories
    pub fn new(logs_dir: impl Into<PathBuf>, profiles_root: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            profiles_root: profiles_root.into(),
        }
    }

    /// Directory holding one append-only log per profile
    pub fn profile_logs_dir(&self) -> PathBuf {
        self.logs_dir.join("profiles")
    }

    /// Append-only worker log for a profile
    pub fn log_file(&self, profile: &ProfileName) -> PathBuf {
        self.profile_logs_dir().join(format!("{}.log", profile))
    }

    /// Browser profile directory; `default` maps to the unsuffixed directory
    pub fn profile_dir(&self, profile: &ProfileName) -> PathBuf {
        if profile.as_str() == "default" {
            self.profiles_root.join("gemini-profile")
        } else {
            self.profiles_root
                .join(format!("gemini-profile-{}", profile))
        }
    }

    /// Marker file holding the start time of the current worker session
    pub fn session_marker(&self, profile: &ProfileName) -> PathBuf {
        self.profile_dir(profile).join(SESSION_MARKER)
    }

    /// Persist a new session start time for a profile
    pub fn stamp_session_start(
        &self,
        profile: &ProfileName,
        when: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let dir = self.profile_dir(profile);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            self.session_marker(profile),
            when.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )?;
        Ok(())
    }

    /// Read the session start time, if one was stamped
    pub fn session_start(&self, profile: &ProfileName) -> Option<chrono::DateTime<chrono::Utc>> {
        let raw = std::fs::read_to_string(self.session_marker(profile)).ok()?;
        chrono::DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }
}

/// Return the last `max_lines` lines of a log file, or an empty vector if unreadable
pub fn read_log_tail(path: &Path, max_lines: usize) -> Vec<String> {
    const MAX_TAIL_BYTES: u64 = 64 * 1024;

    use std::io::{Read, Seek, SeekFrom};

    let Ok(mut file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    if size > MAX_TAIL_BYTES && file.seek(SeekFrom::End(-(MAX_TAIL_BYTES as i64))).is_err() {
        return Vec::new();
    }

    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return Vec::new();
    }

    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
