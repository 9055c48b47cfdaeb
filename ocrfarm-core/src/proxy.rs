//! Per-profile proxy settings merged into the worker environment

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, error};

/// Environment variables carrying proxy settings, in both directions
pub const PROXY_SERVER_VAR: &str = "OCR_PROXY_SERVER";
pub const PROXY_USERNAME_VAR: &str = "OCR_PROXY_USERNAME";
pub const PROXY_PASSWORD_VAR: &str = "OCR_PROXY_PASSWORD";

/// Proxy endpoint and optional credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxySettings {
    /// Environment entries the worker reads its proxy from
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(PROXY_SERVER_VAR.to_string(), self.server.clone());
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            env.insert(PROXY_USERNAME_VAR.to_string(), username.to_string());
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            env.insert(PROXY_PASSWORD_VAR.to_string(), password.to_string());
        }
        env
    }
}

#[derive(Debug, Deserialize)]
struct ProxiesFile {
    #[serde(default)]
    proxies: HashMap<String, ProxySettings>,
}

/// Load proxy settings for a profile from the process environment and the proxies file
pub fn load_proxy_config(profile: &str, proxies_file: &Path) -> Option<ProxySettings> {
    load_proxy_config_with(profile, proxies_file, |key| std::env::var(key).ok())
}

/// Like [`load_proxy_config`] with an explicit environment lookup.
///
/// A non-empty `OCR_PROXY_SERVER` wins over the file. Otherwise the file entry
/// for the profile is used, falling back to its `default` entry.
pub fn load_proxy_config_with<F>(
    profile: &str,
    proxies_file: &Path,
    lookup: F,
) -> Option<ProxySettings>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(server) = non_empty(PROXY_SERVER_VAR) {
        return Some(ProxySettings {
            server,
            username: non_empty(PROXY_USERNAME_VAR),
            password: non_empty(PROXY_PASSWORD_VAR),
        });
    }

    if !proxies_file.exists() {
        return None;
    }

    let raw = match std::fs::read_to_string(proxies_file) {
        Ok(raw) => raw,
        Err(e) => {
            error!("Failed to read proxy config {}: {}", proxies_file.display(), e);
            return None;
        }
    };

    let mut parsed: ProxiesFile = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("Failed to parse proxy config {}: {}", proxies_file.display(), e);
            return None;
        }
    };

    let settings = parsed
        .proxies
        .remove(profile)
        .or_else(|| parsed.proxies.remove("default"));
    if settings.is_some() {
        debug!("Loaded proxy settings for profile {}", profile);
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_proxies(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("proxies.json");
        std::fs::write(
            &path,
            r#"{"proxies": {
                "alice": {"server": "http://alice-proxy:8080", "username": "a"},
                "default": {"server": "http://fallback:3128"}
            }}"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn profile_entry_then_default() {
        let dir = TempDir::new().unwrap();
        let path = write_proxies(&dir);

        let alice = load_proxy_config_with("alice", &path, |_| None).unwrap();
        assert_eq!(alice.server, "http://alice-proxy:8080");
        assert_eq!(alice.username.as_deref(), Some("a"));

        let bob = load_proxy_config_with("bob", &path, |_| None).unwrap();
        assert_eq!(bob.server, "http://fallback:3128");
    }

    #[test]
    fn environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = write_proxies(&dir);

        let settings = load_proxy_config_with("alice", &path, |key| match key {
            PROXY_SERVER_VAR => Some("socks5://env:1080".to_string()),
            PROXY_PASSWORD_VAR => Some("secret".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(settings.server, "socks5://env:1080");
        assert_eq!(settings.username, None);
        assert_eq!(settings.password.as_deref(), Some("secret"));
    }

    #[test]
    fn missing_or_broken_file_yields_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_proxy_config_with("alice", &dir.path().join("nope.json"), |_| None).is_none());

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{not json").unwrap();
        assert!(load_proxy_config_with("alice", &broken, |_| None).is_none());
    }

    #[test]
    fn env_entries_skip_empty_credentials() {
        let settings = ProxySettings {
            server: "http://p:1".to_string(),
            username: Some(String::new()),
            password: None,
        };
        let env = settings.to_env();
        assert_eq!(env.len(), 1);
        assert_eq!(env[PROXY_SERVER_VAR], "http://p:1");
    }
}
