//! Worker job options and the environment contract handed to worker processes
//!
//! Workers are configured exclusively through environment variables. This module
//! owns the mapping from the typed [`WorkerOptions`] onto those variables so the
//! local and remote launchers produce identical environments.

use crate::profile::ProfileName;
use crate::proxy::ProxySettings;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Environment variable identifying which profile a worker process serves
pub const PROFILE_TAG_VAR: &str = "OCR_PROFILE_SUFFIX";

/// Environment variable carrying the headed/headless flag
pub const HEADED_VAR: &str = "OCR_HEADED";

/// Environment variable carrying the resolved source directory
pub const SOURCE_DIR_VAR: &str = "OCR_SOURCE_DIR";

/// Database variables forwarded to workers alongside `OCR_*`
pub const INHERITED_DB_VARS: &[&str] = &[
    "GEMINI_OCR_PG_DSN",
    "PG_DSN",
    "PGUSER",
    "PGPASSWORD",
    "PGHOST",
    "PGPORT",
    "PGDATABASE",
];

/// Where a worker is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Spawned on this machine
    #[default]
    Local,
    /// Spawned on a remote host over SSH
    Worker,
    /// Spawned on a WSL-backed remote host over SSH
    WslWorker,
}

impl ExecutionMode {
    /// Whether this mode runs on a remote host
    pub fn is_remote(&self) -> bool {
        matches!(self, ExecutionMode::Worker | ExecutionMode::WslWorker)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Local => "local",
            ExecutionMode::Worker => "worker",
            ExecutionMode::WslWorker => "wsl_worker",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job configuration for a single worker start.
///
/// Unset options are omitted from the worker environment so the worker falls
/// back to its own defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Run the browser with a visible window
    pub headed: bool,
    pub windows: Option<u32>,
    pub tabs_per_window: Option<u32>,
    pub scans_per_worker: Option<u32>,
    pub collect_timeout_sec: Option<u64>,
    pub close_idle_tabs: Option<bool>,
    pub isolated_contexts: Option<bool>,
    pub pg_enabled: Option<bool>,
    pub pg_dsn: Option<String>,
    pub pg_table: Option<String>,
    pub continue_mode: Option<bool>,
    pub auto_advance: Option<bool>,
    pub pro_only: Option<bool>,
    pub execution_mode: Option<ExecutionMode>,
    /// Host registry id used when `execution_mode` is remote
    pub remote_host_id: Option<String>,
    pub source_path: Option<String>,
    /// Base directory relative source paths are joined onto
    pub source_root: Option<String>,
    pub debug_artifacts: Option<bool>,
    pub capture_video: Option<bool>,
    pub browser_id: Option<String>,
}

impl WorkerOptions {
    /// Remote host id when these options request remote execution
    pub fn remote_target(&self) -> Option<&str> {
        let remote = self.execution_mode.is_some_and(|m| m.is_remote());
        if !remote {
            return None;
        }
        self.remote_host_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Source directory the worker should scan, if any.
    ///
    /// A configured path equal to the home directory is ignored so a sticky
    /// default never points a worker at a whole home tree.
    pub fn effective_source_dir(&self, home: Option<&str>) -> Option<String> {
        let path = self
            .source_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .filter(|p| !is_home_dir(p, home));
        compose_source_path(path.unwrap_or(""), self.source_root.as_deref())
    }

    /// Serialize options into worker environment entries
    pub fn to_env(&self, home: Option<&str>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();

        set_int(&mut env, "OCR_WINDOWS", self.windows.map(u64::from));
        set_int(&mut env, "OCR_TABS_PER_WINDOW", self.tabs_per_window.map(u64::from));
        set_int(&mut env, "OCR_SCANS_PER_WORKER", self.scans_per_worker.map(u64::from));
        set_int(&mut env, "OCR_COLLECT_TIMEOUT_SEC", self.collect_timeout_sec);
        set_flag(&mut env, "OCR_CLOSE_IDLE_TABS", self.close_idle_tabs);
        set_word(&mut env, "OCR_USE_ISOLATED_CONTEXTS", self.isolated_contexts);

        set_flag(&mut env, "OCR_PG_ENABLED", self.pg_enabled);
        set_str(&mut env, "OCR_PG_DSN", self.pg_dsn.as_deref());
        set_str(&mut env, "OCR_PG_TABLE", self.pg_table.as_deref());

        set_flag(&mut env, "OCR_CONTINUE", self.continue_mode);
        set_flag(&mut env, "OCR_AUTO_ADVANCE", self.auto_advance);
        set_flag(&mut env, "OCR_PRO_ONLY", self.pro_only);
        set_str(
            &mut env,
            "OCR_EXECUTION_MODE",
            self.execution_mode.map(|m| m.as_str()),
        );

        set_str(
            &mut env,
            SOURCE_DIR_VAR,
            self.effective_source_dir(home).as_deref(),
        );
        set_word(&mut env, "OCR_DEBUG_ARTIFACTS", self.debug_artifacts);
        set_word(&mut env, "OCR_CAPTURE_VIDEO", self.capture_video);
        set_str(&mut env, "OCR_BROWSER_ID", self.browser_id.as_deref());

        env
    }
}

fn set_int(env: &mut BTreeMap<String, String>, key: &str, value: Option<u64>) {
    if let Some(value) = value {
        env.insert(key.to_string(), value.to_string());
    }
}

fn set_flag(env: &mut BTreeMap<String, String>, key: &str, value: Option<bool>) {
    if let Some(value) = value {
        env.insert(key.to_string(), if value { "1" } else { "0" }.to_string());
    }
}

fn set_word(env: &mut BTreeMap<String, String>, key: &str, value: Option<bool>) {
    if let Some(value) = value {
        env.insert(key.to_string(), value.to_string());
    }
}

fn set_str(env: &mut BTreeMap<String, String>, key: &str, value: Option<&str>) {
    if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
        env.insert(key.to_string(), value.to_string());
    }
}

fn is_home_dir(path: &str, home: Option<&str>) -> bool {
    match home.map(|h| h.trim_end_matches('/')).filter(|h| !h.is_empty()) {
        Some(home) => path.trim_end_matches('/') == home,
        None => false,
    }
}

static DRIVE_LETTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]:[/\\]").expect("valid regex"));

/// Whether a path is home-relative, UNC, a drive path or an `user@host:` SSH path
pub fn is_absolute_or_remote(path: &str) -> bool {
    if path.starts_with('~') || path.starts_with("\\\\") {
        return true;
    }
    if DRIVE_LETTER.is_match(path) {
        return true;
    }
    match path.split_once(':') {
        Some((head, _)) => head.contains('@'),
        None => false,
    }
}

/// Compose a worker source path from a configured path and an optional root.
///
/// - empty path: the root, if any
/// - home-relative, UNC, drive-letter and SSH paths: unchanged
/// - no root: the path unchanged
/// - a path already under the root: unchanged
/// - otherwise: the path joined onto the root, leading separators stripped
pub fn compose_source_path(path: &str, root: Option<&str>) -> Option<String> {
    let path = path.trim();
    let root = root.map(str::trim).filter(|r| !r.is_empty());

    if path.is_empty() {
        return root.map(str::to_string);
    }

    if is_absolute_or_remote(path) {
        return Some(path.to_string());
    }

    let Some(root) = root else {
        return Some(path.to_string());
    };

    if path.starts_with(root) {
        return Some(path.to_string());
    }

    let rel = path.trim_start_matches(['/', '\\']);
    if rel.is_empty() {
        return Some(root.to_string());
    }

    Some(format!("{}/{}", root.trim_end_matches(['/', '\\']), rel))
}

/// Builder for the complete environment of one worker process
#[derive(Debug, Clone, Default)]
pub struct WorkerEnv {
    vars: BTreeMap<String, String>,
}

impl WorkerEnv {
    /// Start from the profile tag, headed flag and serialized options
    pub fn new(profile: &ProfileName, options: &WorkerOptions, home: Option<&str>) -> Self {
        let mut vars = options.to_env(home);
        vars.insert(PROFILE_TAG_VAR.to_string(), profile.to_string());
        vars.insert(
            HEADED_VAR.to_string(),
            if options.headed { "1" } else { "0" }.to_string(),
        );
        Self { vars }
    }

    /// Merge proxy settings, overriding any inherited proxy variables
    pub fn with_proxy(mut self, proxy: Option<&ProxySettings>) -> Self {
        if let Some(proxy) = proxy {
            self.vars.extend(proxy.to_env());
        }
        self
    }

    /// Set a single variable
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Set a variable only if it is not already present
    pub fn set_default(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    /// Copy `OCR_*` and database variables that are not already set
    pub fn inherit<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let forwarded = key.starts_with("OCR_") || INHERITED_DB_VARS.contains(&key.as_str());
            if forwarded && !self.vars.contains_key(&key) {
                self.vars.insert(key, value);
            }
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn into_vars(self) -> BTreeMap<String, String> {
        self.vars
    }
}
