//! Remote host registry and connection parameter validation

use crate::error::{FarmError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Legacy key the host list was stored under
pub const LEGACY_HOSTS_KEY: &str = "OCR_REMOTE_HOSTS_LIST";

const DEFAULT_USER: &str = "root";
const DEFAULT_PYTHON: &str = "python3";

/// Connection parameters for one remote worker host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawHost")]
pub struct RemoteHost {
    pub id: String,
    /// Hostname or address, optionally with a port-less IPv6 literal
    pub host: String,
    pub user: String,
    /// Extra ssh options, whitespace separated
    pub ssh_opts: String,
    pub repo_dir: String,
    pub python: String,
    /// Browser profile root on the remote host
    pub profile_root: String,
    /// `user@host:/path` share mounted on the remote host before launch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nas_source: Option<String>,
}

impl RemoteHost {
    /// Check address, user and ssh options against the allow-lists
    pub fn validate(&self) -> Result<()> {
        validate_hostname(&self.host)?;
        validate_username(&self.user)?;
        validate_ssh_opts(&self.ssh_opts)?;
        Ok(())
    }

    /// `user@host` destination for ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Validated ssh options split into arguments
    pub fn ssh_args(&self) -> Vec<String> {
        self.ssh_opts.split_whitespace().map(str::to_string).collect()
    }
}

/// Accepts every spelling the dashboard has written over time
#[derive(Debug, Default, Deserialize)]
struct RawHost {
    #[serde(default)]
    id: serde_json::Value,
    host: Option<String>,
    address: Option<String>,
    user: Option<String>,
    ssh: Option<String>,
    #[serde(rename = "sshOpts")]
    ssh_opts_camel: Option<String>,
    ssh_opts: Option<String>,
    repo: Option<String>,
    #[serde(rename = "repoDir")]
    repo_dir_camel: Option<String>,
    repo_dir: Option<String>,
    python: Option<String>,
    #[serde(rename = "profileRoot")]
    profile_root_camel: Option<String>,
    profile_root: Option<String>,
    #[serde(rename = "nasSource")]
    nas_source_camel: Option<String>,
    nas_source: Option<String>,
}

fn first_non_empty(candidates: [Option<String>; 3]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

impl From<RawHost> for RemoteHost {
    fn from(raw: RawHost) -> Self {
        let id = match raw.id {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };

        Self {
            id,
            host: first_non_empty([raw.host, raw.address, None]).unwrap_or_default(),
            user: first_non_empty([raw.user, None, None])
                .unwrap_or_else(|| DEFAULT_USER.to_string()),
            ssh_opts: first_non_empty([raw.ssh, raw.ssh_opts_camel, raw.ssh_opts])
                .unwrap_or_default(),
            repo_dir: first_non_empty([raw.repo, raw.repo_dir_camel, raw.repo_dir])
                .unwrap_or_default(),
            python: first_non_empty([raw.python, None, None])
                .unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
            profile_root: first_non_empty([raw.profile_root_camel, raw.profile_root, None])
                .unwrap_or_default(),
            nas_source: first_non_empty([raw.nas_source_camel, raw.nas_source, None]),
        }
    }
}

static HOSTNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9.\-:_]+$").expect("valid regex"));
static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_\-.]+$").expect("valid regex"));

const SSH_OPT_FORBIDDEN_CHARS: &[char] = &[';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r'];
const SSH_OPT_FORBIDDEN_OPTIONS: &[&str] = &["proxycommand", "localcommand", "permitlocalcommand"];

/// Validate a hostname or IP literal
pub fn validate_hostname(host: &str) -> Result<()> {
    if host.is_empty() || !HOSTNAME_RE.is_match(host) {
        return Err(FarmError::InvalidHost(format!("invalid hostname: {:?}", host)));
    }
    Ok(())
}

/// Validate a remote login name
pub fn validate_username(user: &str) -> Result<()> {
    if user.is_empty() || user.len() > 64 || !USERNAME_RE.is_match(user) {
        return Err(FarmError::InvalidHost(format!("invalid username: {:?}", user)));
    }
    Ok(())
}

/// Reject ssh options that could run local commands or break out of quoting
pub fn validate_ssh_opts(opts: &str) -> Result<()> {
    if opts.trim().is_empty() {
        return Ok(());
    }

    if let Some(c) = opts.chars().find(|c| SSH_OPT_FORBIDDEN_CHARS.contains(c)) {
        return Err(FarmError::InvalidHost(format!(
            "ssh options contain forbidden character {:?}",
            c
        )));
    }

    let lowered = opts.to_ascii_lowercase();
    if let Some(option) = SSH_OPT_FORBIDDEN_OPTIONS
        .iter()
        .find(|o| lowered.contains(*o))
    {
        return Err(FarmError::InvalidHost(format!(
            "ssh options contain forbidden option {}",
            option
        )));
    }

    Ok(())
}

/// Lookup of remote hosts by id
pub trait HostRegistry: Send + Sync {
    /// All configured hosts
    fn list(&self) -> Result<Vec<RemoteHost>>;

    /// Host with the given id, if configured
    fn resolve(&self, id: &str) -> Result<Option<RemoteHost>> {
        let id = id.trim();
        Ok(self.list()?.into_iter().find(|h| h.id == id))
    }
}

/// Host registry backed by a JSON file, re-read on every lookup so edits made
/// by the dashboard apply to the next start.
#[derive(Debug, Clone)]
pub struct FileHostRegistry {
    path: PathBuf,
}

impl FileHostRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl HostRegistry for FileHostRegistry {
    fn list(&self) -> Result<Vec<RemoteHost>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        parse_host_list(&raw)
    }
}

/// Fixed in-memory host list
#[derive(Debug, Clone, Default)]
pub struct StaticHostRegistry {
    hosts: Vec<RemoteHost>,
}

impl StaticHostRegistry {
    pub fn new(hosts: Vec<RemoteHost>) -> Self {
        Self { hosts }
    }
}

impl HostRegistry for StaticHostRegistry {
    fn list(&self) -> Result<Vec<RemoteHost>> {
        Ok(self.hosts.clone())
    }
}

/// Parse a hosts document.
///
/// Accepts `{"hosts": [...]}`, the legacy `{"OCR_REMOTE_HOSTS_LIST": [...]}`
/// (where the list may itself be a JSON-encoded string) or a bare array.
pub fn parse_host_list(raw: &str) -> Result<Vec<RemoteHost>> {
    let doc: serde_json::Value = serde_json::from_str(raw)?;

    let list = match doc {
        serde_json::Value::Array(_) => doc,
        serde_json::Value::Object(mut map) => match map
            .remove("hosts")
            .or_else(|| map.remove(LEGACY_HOSTS_KEY))
        {
            Some(serde_json::Value::String(encoded)) => serde_json::from_str(&encoded)?,
            Some(value) => value,
            None => return Ok(Vec::new()),
        },
        _ => {
            return Err(FarmError::Configuration(
                "hosts file must be an object or an array".to_string(),
            ));
        }
    };

    let serde_json::Value::Array(entries) = list else {
        return Err(FarmError::Configuration(
            "host list must be an array".to_string(),
        ));
    };

    let mut hosts = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<RemoteHost>(entry) {
            Ok(host) if !host.id.is_empty() => hosts.push(host),
            Ok(_) => warn!("Skipping host entry without id"),
            Err(e) => warn!("Skipping malformed host entry: {}", e),
        }
    }
    Ok(hosts)
}
