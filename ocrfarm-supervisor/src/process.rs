//! Local worker launcher (subprocess management)

use crate::error::StartError;
use crate::launcher::{StartedInfo, WorkerLauncher};
use async_trait::async_trait;
use ocrfarm_core::profile::{ProfileName, ProfilePaths, read_log_tail};
use ocrfarm_core::proxy::load_proxy_config;
use ocrfarm_core::worker_env::{WorkerEnv, WorkerOptions};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lines of log returned with an immediate crash
const CRASH_LOG_TAIL_LINES: usize = 20;

/// Configuration for the local launcher
#[derive(Debug, Clone)]
pub struct LocalLauncherConfig {
    /// Worker repository
    pub repo_dir: PathBuf,

    /// Entry point, relative to the repository
    pub entry_point: String,

    /// Interpreter used when the repository has no virtualenv
    pub default_interpreter: String,

    /// Per-profile proxy settings
    pub proxies_file: PathBuf,

    /// Delay before checking the child is still alive
    pub crash_check_delay: Duration,
}

impl Default for LocalLauncherConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("."),
            entry_point: "run.py".to_string(),
            default_interpreter: "python3".to_string(),
            proxies_file: PathBuf::from("config/proxies.json"),
            crash_check_delay: Duration::from_millis(200),
        }
    }
}

/// Spawns workers as children of this process, each in its own process group
pub struct LocalLauncher {
    config: LocalLauncherConfig,
    paths: ProfilePaths,
    processes: Arc<RwLock<HashMap<ProfileName, Child>>>,
}

impl LocalLauncher {
    pub fn new(config: LocalLauncherConfig, paths: ProfilePaths) -> Self {
        Self {
            config,
            paths,
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Virtualenv interpreter if present, otherwise the configured default
    pub fn interpreter(&self) -> PathBuf {
        select_interpreter(&self.config.repo_dir, &self.config.default_interpreter)
    }

    /// Entry point path inside the repository
    pub fn entry_point_path(&self) -> PathBuf {
        self.config.repo_dir.join(&self.config.entry_point)
    }

    /// Collect exit statuses of finished children. Returns how many were reaped.
    pub async fn reap(&self) -> usize {
        let mut processes = self.processes.write().await;
        let before = processes.len();
        processes.retain(|profile, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Reaped worker for {} ({})", profile, status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll worker for {}: {}", profile, e);
                false
            }
        });
        before - processes.len()
    }

    fn build_env(&self, profile: &ProfileName, options: &WorkerOptions) -> WorkerEnv {
        let home = std::env::var("HOME").ok();
        let proxy = load_proxy_config(profile.as_str(), &self.config.proxies_file);
        let mut env = WorkerEnv::new(profile, options, home.as_deref()).with_proxy(proxy.as_ref());

        if options.headed && std::env::var_os("DISPLAY").is_none() {
            env = env.set("DISPLAY", ":0");
        }

        let src_dir = self.config.repo_dir.join("src");
        if src_dir.is_dir() {
            let src = src_dir.display().to_string();
            let python_path = match std::env::var("PYTHONPATH") {
                Ok(existing) if !existing.is_empty() => format!("{}:{}", src, existing),
                _ => src,
            };
            env = env.set("PYTHONPATH", python_path);
        }

        env
    }
}

/// Pick `venv/bin/python`, then `.venv/bin/python`, then `default`
pub fn select_interpreter(repo_dir: &Path, default: &str) -> PathBuf {
    ["venv", ".venv"]
        .iter()
        .map(|venv| repo_dir.join(venv).join("bin").join("python"))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(default))
}

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn launch(
        &self,
        profile: &ProfileName,
        options: &WorkerOptions,
    ) -> std::result::Result<StartedInfo, StartError> {
        let entry = self.entry_point_path();
        if !entry.is_file() {
            return Err(StartError::MissingEntryPoint(entry.display().to_string()));
        }

        let log_path = self.paths.log_file(profile);
        std::fs::create_dir_all(self.paths.profile_logs_dir())
            .map_err(|e| StartError::SpawnFailed(format!("cannot create log dir: {}", e)))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| {
                StartError::SpawnFailed(format!("cannot open {}: {}", log_path.display(), e))
            })?;
        let log_err = log
            .try_clone()
            .map_err(|e| StartError::SpawnFailed(format!("cannot duplicate log handle: {}", e)))?;

        let interpreter = self.interpreter();
        let env = self.build_env(profile, options);

        info!(
            "Starting local worker for {} ({} {})",
            profile,
            interpreter.display(),
            entry.display()
        );

        let mut cmd = Command::new(&interpreter);
        cmd.arg(&entry)
            .current_dir(&self.config.repo_dir)
            .envs(env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| StartError::SpawnFailed(format!("{}: {}", interpreter.display(), e)))?;

        let Some(pid) = child.id() else {
            return Err(StartError::SpawnFailed(
                "worker exited before its pid could be read".to_string(),
            ));
        };

        tokio::time::sleep(self.config.crash_check_delay).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                warn!("Worker for {} exited immediately ({})", profile, status);
                return Err(StartError::CrashedImmediately {
                    status: status.to_string(),
                    log_tail: read_log_tail(&log_path, CRASH_LOG_TAIL_LINES),
                });
            }
            Ok(None) => {}
            Err(e) => {
                return Err(StartError::SpawnFailed(format!(
                    "cannot poll worker pid {}: {}",
                    pid, e
                )));
            }
        }

        if let Some(mut previous) = self.processes.write().await.insert(profile.clone(), child) {
            if let Ok(None) = previous.try_wait() {
                debug!("Previous child handle for {} still running; detaching", profile);
            }
        }

        info!("Worker for {} started (PID: {})", profile, pid);
        Ok(StartedInfo::Local { pid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn launcher(repo: &Path, logs: &Path, interpreter: &str) -> LocalLauncher {
        LocalLauncher::new(
            LocalLauncherConfig {
                repo_dir: repo.to_path_buf(),
                entry_point: "run.py".to_string(),
                default_interpreter: interpreter.to_string(),
                proxies_file: repo.join("config/proxies.json"),
                crash_check_delay: Duration::from_millis(300),
            },
            ProfilePaths::new(logs, repo.join("cache")),
        )
    }

    #[test]
    fn test_interpreter_preference() {
        let dir = TempDir::new().unwrap();
        assert_eq!(select_interpreter(dir.path(), "python3"), PathBuf::from("python3"));

        let dot_venv = dir.path().join(".venv/bin");
        std::fs::create_dir_all(&dot_venv).unwrap();
        std::fs::write(dot_venv.join("python"), "").unwrap();
        assert_eq!(select_interpreter(dir.path(), "python3"), dot_venv.join("python"));

        let venv = dir.path().join("venv/bin");
        std::fs::create_dir_all(&venv).unwrap();
        std::fs::write(venv.join("python"), "").unwrap();
        assert_eq!(select_interpreter(dir.path(), "python3"), venv.join("python"));
    }

    #[tokio::test]
    async fn test_missing_entry_point() {
        let dir = TempDir::new().unwrap();
        let launcher = launcher(dir.path(), &dir.path().join("logs"), "sh");
        let profile = ProfileName::new("alice").unwrap();

        let err = launcher
            .launch(&profile, &WorkerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::MissingEntryPoint(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_immediate_crash_reports_log_tail() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("run.py"),
            "echo \"booting $OCR_PROFILE_SUFFIX\"\necho 'fatal: no session' >&2\nexit 3\n",
        )
        .unwrap();
        let logs = dir.path().join("logs");
        let launcher = launcher(dir.path(), &logs, "sh");
        let profile = ProfileName::new("alice").unwrap();

        let err = launcher
            .launch(&profile, &WorkerOptions::default())
            .await
            .unwrap_err();

        match err {
            StartError::CrashedImmediately { log_tail, .. } => {
                assert!(log_tail.iter().any(|l| l == "booting alice"));
                assert!(log_tail.iter().any(|l| l.contains("fatal: no session")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_long_running_worker_starts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("run.py"), "exec sleep 30\n").unwrap();
        let launcher = launcher(dir.path(), &dir.path().join("logs"), "sh");
        let profile = ProfileName::new("bob").unwrap();

        let started = launcher
            .launch(&profile, &WorkerOptions::default())
            .await
            .unwrap();
        let StartedInfo::Local { pid } = started else {
            panic!("expected a local start");
        };
        assert!(pid > 0);
        assert_eq!(launcher.reap().await, 0);

        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launcher.reap().await, 1);
    }
}
