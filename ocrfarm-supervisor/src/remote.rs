//! Remote worker execution over SSH
//!
//! Remote workers are started as detached background processes through
//! the system `ssh` client. Nothing on the remote side reports back, so the
//! supervisor remembers where each profile was launched in a
//! [`RemoteHandle`] persisted under `<state_dir>/remote/<profile>.remote`.

use crate::error::{Result, StartError, SupervisorError};
use crate::launcher::{StartedInfo, WorkerLauncher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ocrfarm_core::clock::Clock;
use ocrfarm_core::hosts::{HostRegistry, RemoteHost};
use ocrfarm_core::profile::{ProfileName, ProfilePaths};
use ocrfarm_core::proxy::load_proxy_config;
use ocrfarm_core::worker_env::{SOURCE_DIR_VAR, WorkerEnv, WorkerOptions};
use serde::{Deserialize, Serialize};
use shell_escape::escape;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

const MARKER_EXTENSION: &str = "remote";
const SSHFS_OPTIONS: &str = "allow_other,reconnect,ServerAliveInterval=15,ServerAliveCountMax=3";
const MOUNTED_TAG: &str = "MOUNTED";
const STDERR_EXCERPT_CHARS: usize = 200;

/// Where a profile's worker was launched remotely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHandle {
    pub host_id: String,
    #[serde(alias = "host_addr")]
    pub host_address: String,
    pub host_user: String,
    pub repo_dir: String,
    pub started_at: DateTime<Utc>,
}

/// Durable remote handles with an in-memory cache in front
pub struct RemoteHandleStore {
    dir: PathBuf,
    cache: RwLock<HashMap<ProfileName, RemoteHandle>>,
}

impl RemoteHandleStore {
    /// Markers live in `<state_dir>/remote`
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: state_dir.as_ref().join("remote"),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn marker_path(&self, profile: &ProfileName) -> PathBuf {
        self.dir
            .join(format!("{}.{}", profile.as_str(), MARKER_EXTENSION))
    }

    /// Cache the handle and write its marker atomically
    pub async fn save(&self, profile: &ProfileName, handle: &RemoteHandle) -> Result<()> {
        self.cache
            .write()
            .await
            .insert(profile.clone(), handle.clone());

        std::fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(handle)
            .map_err(|e| SupervisorError::Supervisor(format!("cannot encode handle: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.marker_path(profile))
            .map_err(|e| SupervisorError::Io(e.error))?;

        debug!("Saved remote handle for {} ({})", profile, handle.host_id);
        Ok(())
    }

    /// Cached handle, falling back to the marker on disk
    pub async fn load(&self, profile: &ProfileName) -> Option<RemoteHandle> {
        if let Some(handle) = self.cache.read().await.get(profile) {
            return Some(handle.clone());
        }

        let handle = read_marker(&self.marker_path(profile))?;
        self.cache
            .write()
            .await
            .insert(profile.clone(), handle.clone());
        Some(handle)
    }

    /// Forget a handle. Clearing a missing handle is not an error.
    pub async fn clear(&self, profile: &ProfileName) -> Result<()> {
        self.cache.write().await.remove(profile);
        match std::fs::remove_file(self.marker_path(profile)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every known handle, from markers and cache
    pub async fn list(&self) -> BTreeMap<ProfileName, RemoteHandle> {
        let mut handles = BTreeMap::new();

        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXTENSION) {
                    continue;
                }
                let Some(profile) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| ProfileName::new(s).ok())
                else {
                    continue;
                };
                if let Some(handle) = read_marker(&path) {
                    handles.insert(profile, handle);
                }
            }
        }

        for (profile, handle) in self.cache.read().await.iter() {
            handles.insert(profile.clone(), handle.clone());
        }
        handles
    }
}

fn read_marker(path: &Path) -> Option<RemoteHandle> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Cannot read remote marker {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Ignoring corrupt remote marker {}: {}", path.display(), e);
            None
        }
    }
}

/// Validated ssh destination and options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub destination: String,
    pub options: Vec<String>,
}

impl SshTarget {
    pub fn from_host(host: &RemoteHost) -> Self {
        Self {
            destination: host.destination(),
            options: host.ssh_args(),
        }
    }

    /// Arguments for `ssh`, ending with the remote command
    pub fn ssh_args(&self, connect_timeout: Duration, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
        ];
        args.extend(self.options.iter().cloned());
        args.push(self.destination.clone());
        args.push(command.to_string());
        args
    }
}

/// Result of a finished ssh invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// ssh itself failed (connection, auth) rather than the remote command
    pub fn is_transport_failure(&self) -> bool {
        self.status == Some(255)
    }
}

/// State of a detached launch once the settle delay has passed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStatus {
    /// Local ssh is still running
    Running,
    /// Local ssh already returned
    Exited(CommandOutput),
}

/// Runs commands on remote hosts
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` and wait for it, giving up after `timeout`
    async fn exec(
        &self,
        target: &SshTarget,
        command: &str,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Start `command` without waiting for it; report what ssh did within `settle`
    async fn launch_detached(
        &self,
        target: &SshTarget,
        command: &str,
        connect_timeout: Duration,
        settle: Duration,
    ) -> Result<LaunchStatus>;
}

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// [`RemoteShell`] using the OpenSSH client binary
#[derive(Debug, Clone)]
pub struct OpenSshShell {
    program: String,
    session_timeout: Duration,
}

impl OpenSshShell {
    pub fn new() -> Self {
        Self::with_program("ssh")
    }

    /// Use a different client binary
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    /// How long a detached launch's ssh may stay attached before it is killed
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    fn spawn(&self, args: Vec<String>, stdout: Stdio) -> Result<tokio::process::Child> {
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Remote(format!("cannot run {}: {}", self.program, e)))
    }
}

impl Default for OpenSshShell {
    fn default() -> Self {
        Self::new()
    }
}

fn into_output(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn exec(
        &self,
        target: &SshTarget,
        command: &str,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let child = self.spawn(target.ssh_args(connect_timeout, command), Stdio::piped())?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => Ok(into_output(output?)),
            Err(_) => Err(SupervisorError::RemoteTimeout(timeout)),
        }
    }

    async fn launch_detached(
        &self,
        target: &SshTarget,
        command: &str,
        connect_timeout: Duration,
        settle: Duration,
    ) -> Result<LaunchStatus> {
        let mut child = self.spawn(target.ssh_args(connect_timeout, command), Stdio::null())?;

        tokio::time::sleep(settle).await;

        if child.try_wait()?.is_some() {
            let output = child.wait_with_output().await?;
            return Ok(LaunchStatus::Exited(into_output(output)));
        }

        // ssh stays attached while the session drains; reap it in the background
        let destination = target.destination.clone();
        let limit = self.session_timeout;
        tokio::spawn(async move {
            let mut stderr_pipe = child.stderr.take();
            let drain = async {
                let mut stderr = String::new();
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                (child.wait().await, stderr)
            };
            let outcome = tokio::time::timeout(limit, drain).await;

            match outcome {
                Ok((Ok(status), stderr)) if !status.success() => {
                    warn!(
                        "Detached ssh to {} exited with {}: {}",
                        destination,
                        status,
                        stderr.trim()
                    );
                }
                Ok((Ok(_), _)) => {}
                Ok((Err(e), _)) => warn!("Failed to reap ssh to {}: {}", destination, e),
                Err(_) => {
                    warn!(
                        "Detached ssh to {} still attached after {:?}; killing it",
                        destination, limit
                    );
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill ssh to {}: {}", destination, e);
                    }
                }
            }
        });
        Ok(LaunchStatus::Running)
    }
}

/// Quote a remote path, leaving a leading `~/` unquoted so the remote shell expands it
pub fn quote_remote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) if !rest.is_empty() => format!("~/{}", escape(Cow::Borrowed(rest))),
        _ if path == "~" => "~".to_string(),
        _ => escape(Cow::Borrowed(path)).into_owned(),
    }
}

/// Idempotent check-then-mount of a `user@host:/path` share
pub fn build_mount_script(nas_source: &str) -> String {
    format!(
        "MP=\"$HOME/ocr_mounts/sources\"; \
         if mount | grep -q \" $MP \"; then echo \"{tag} $MP\"; \
         else mkdir -p \"$MP\" && sshfs -o {opts} {src} \"$MP\" && echo \"{tag} $MP\"; fi",
        tag = MOUNTED_TAG,
        opts = SSHFS_OPTIONS,
        src = escape(Cow::Borrowed(nas_source)),
    )
}

/// Mount point reported by [`build_mount_script`], if the mount succeeded
pub fn parse_mount_point(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix(MOUNTED_TAG))
        .map(str::trim)
        .find(|path| !path.is_empty())
        .map(str::to_string)
}

/// Entry point probe, printing `OK` when the file exists
pub fn build_probe_command(repo_dir: &str, entry_point: &str) -> String {
    format!(
        "test -f {}/{} && echo OK",
        quote_remote_path(repo_dir.trim_end_matches('/')),
        escape(Cow::Borrowed(entry_point))
    )
}

/// Backgrounded launch of the worker inside its repository
pub fn build_launch_command(
    repo_dir: &str,
    python: &str,
    entry_point: &str,
    profile: &ProfileName,
    env: &BTreeMap<String, String>,
) -> String {
    let env_str = env
        .iter()
        .filter(|(key, _)| is_env_name(key))
        .map(|(key, value)| format!("{}={}", key, escape(Cow::Borrowed(value.as_str()))))
        .collect::<Vec<_>>()
        .join(" ");
    let remote_log = format!("logs/profiles/{}.log", profile.as_str());

    format!(
        "cd {repo} && mkdir -p logs/profiles && \
         (source venv/bin/activate 2>/dev/null || . venv/bin/activate 2>/dev/null || true) && \
         {env} nohup {python} {entry} >> {log} 2>&1 &",
        repo = quote_remote_path(repo_dir),
        env = env_str,
        python = escape(Cow::Borrowed(python)),
        entry = escape(Cow::Borrowed(entry_point)),
        log = escape(Cow::Owned(remote_log)),
    )
}

fn is_env_name(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn excerpt(text: &str) -> String {
    text.trim().chars().take(STDERR_EXCERPT_CHARS).collect()
}

/// Configuration for the SSH launcher
#[derive(Debug, Clone)]
pub struct SshLauncherConfig {
    pub entry_point: String,
    pub proxies_file: PathBuf,
    /// `ConnectTimeout` passed to every ssh call
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub mount_timeout: Duration,
    /// Wait before checking the local ssh of a detached launch
    pub launch_settle: Duration,
    /// Forward `OCR_*` and database variables from this process
    pub inherit_env: bool,
}

impl Default for SshLauncherConfig {
    fn default() -> Self {
        Self {
            entry_point: "run.py".to_string(),
            proxies_file: PathBuf::from("config/proxies.json"),
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(15),
            mount_timeout: Duration::from_secs(45),
            launch_settle: Duration::from_millis(1500),
            inherit_env: true,
        }
    }
}

/// Starts workers on hosts from the registry
pub struct SshLauncher {
    config: SshLauncherConfig,
    registry: Arc<dyn HostRegistry>,
    shell: Arc<dyn RemoteShell>,
    handles: Arc<RemoteHandleStore>,
    paths: ProfilePaths,
    clock: Arc<dyn Clock>,
}

impl SshLauncher {
    pub fn new(
        config: SshLauncherConfig,
        registry: Arc<dyn HostRegistry>,
        shell: Arc<dyn RemoteShell>,
        handles: Arc<RemoteHandleStore>,
        paths: ProfilePaths,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            shell,
            handles,
            paths,
            clock,
        }
    }

    /// Look up and validate connection parameters
    pub fn resolve_host(&self, host_id: &str) -> std::result::Result<RemoteHost, StartError> {
        let host = self
            .registry
            .resolve(host_id)
            .map_err(|e| StartError::InvalidHostConfig(format!("host registry: {}", e)))?
            .ok_or_else(|| StartError::UnknownHost(host_id.to_string()))?;

        if host.host.trim().is_empty() {
            return Err(StartError::InvalidHostConfig(format!(
                "host {} has no address",
                host_id
            )));
        }
        if host.repo_dir.trim().is_empty() {
            return Err(StartError::MissingRepoDir(host_id.to_string()));
        }
        host.validate()
            .map_err(|e| StartError::InvalidHostConfig(e.to_string()))?;

        Ok(host)
    }

    /// Environment of the remote worker
    pub fn build_env(
        &self,
        profile: &ProfileName,
        options: &WorkerOptions,
        host: &RemoteHost,
        source_dir: Option<&str>,
    ) -> WorkerEnv {
        let proxy = load_proxy_config(profile.as_str(), &self.config.proxies_file);
        let mut env = WorkerEnv::new(profile, options, None)
            .set("PYTHONUNBUFFERED", "1")
            .with_proxy(proxy.as_ref());

        if !host.profile_root.is_empty() {
            env = env.set("OCR_BROWSER_PROFILE_ROOT", host.profile_root.clone());
        }
        if let Some(dir) = source_dir {
            env = env.set(SOURCE_DIR_VAR, dir);
        }
        if self.config.inherit_env {
            env = env.inherit(std::env::vars());
        }
        env
    }

    fn append_profile_log(&self, profile: &ProfileName, lines: &[String]) {
        let path = self.paths.log_file(profile);
        let written = std::fs::create_dir_all(self.paths.profile_logs_dir()).and_then(|_| {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            for line in lines {
                writeln!(file, "{}", line)?;
            }
            Ok(())
        });
        if let Err(e) = written {
            warn!("Cannot append to {}: {}", path.display(), e);
        }
    }

    /// Mount the host's source share; `None` if unset or the mount failed
    async fn ensure_mount(
        &self,
        profile: &ProfileName,
        host: &RemoteHost,
        target: &SshTarget,
    ) -> Option<String> {
        let nas_source = host.nas_source.as_deref().filter(|s| s.contains(':'))?;

        let result = self
            .shell
            .exec(
                target,
                &build_mount_script(nas_source),
                self.config.connect_timeout,
                self.config.mount_timeout,
            )
            .await;

        let failure = match result {
            Ok(output) => match parse_mount_point(&output.stdout) {
                Some(mount_point) => {
                    info!("Mounted {} on {} at {}", nas_source, host.id, mount_point);
                    self.append_profile_log(
                        profile,
                        &[format!(
                            "[AUTO-MOUNT] Mounted {} at {}",
                            nas_source, mount_point
                        )],
                    );
                    return Some(mount_point);
                }
                None => excerpt(&output.stderr),
            },
            Err(e) => e.to_string(),
        };

        warn!("Mounting {} on {} failed: {}", nas_source, host.id, failure);
        self.append_profile_log(
            profile,
            &[format!("[AUTO-MOUNT ERROR] Mounting {} failed: {}", nas_source, failure)],
        );
        None
    }

    /// Confirm the entry point exists on the host
    async fn probe_entry_point(
        &self,
        host: &RemoteHost,
        target: &SshTarget,
    ) -> std::result::Result<(), StartError> {
        let output = self
            .shell
            .exec(
                target,
                &build_probe_command(&host.repo_dir, &self.config.entry_point),
                self.config.connect_timeout.min(self.config.probe_timeout),
                self.config.probe_timeout,
            )
            .await
            .map_err(|e| StartError::SpawnFailed(format!("probe on {}: {}", host.id, e)))?;

        if output.is_transport_failure() {
            return Err(StartError::SpawnFailed(format!(
                "ssh to {} failed: {}",
                host.id,
                excerpt(&output.stderr)
            )));
        }
        if !output.stdout.lines().any(|l| l.trim() == "OK") {
            return Err(StartError::MissingEntryPoint(format!(
                "{}:{}/{}",
                host.id,
                host.repo_dir.trim_end_matches('/'),
                self.config.entry_point
            )));
        }
        Ok(())
    }

    /// Start a worker on `host_id`
    pub async fn start_remote(
        &self,
        profile: &ProfileName,
        host_id: &str,
        options: &WorkerOptions,
    ) -> std::result::Result<StartedInfo, StartError> {
        let host = self.resolve_host(host_id)?;
        let target = SshTarget::from_host(&host);

        let source_dir = self.ensure_mount(profile, &host, &target).await;
        let env = self.build_env(profile, options, &host, source_dir.as_deref());
        let command = build_launch_command(
            &host.repo_dir,
            &host.python,
            &self.config.entry_point,
            profile,
            env.vars(),
        );

        let rule = "=".repeat(60);
        self.append_profile_log(
            profile,
            &[
                String::new(),
                rule.clone(),
                format!("[REMOTE START] Host: {} ({})", host.host, host.id),
                format!("[REMOTE START] User: {}", host.user),
                format!("[REMOTE START] Repo: {}", host.repo_dir),
                format!("[REMOTE START] Command: ssh {} ...", target.destination),
                rule,
            ],
        );

        if let Err(e) = self.probe_entry_point(&host, &target).await {
            self.append_profile_log(profile, &[format!("[REMOTE ERROR] {}", e)]);
            return Err(e);
        }

        info!("Launching {} on {} ({})", profile, host.id, host.host);
        let launch = self
            .shell
            .launch_detached(
                &target,
                &command,
                self.config.connect_timeout,
                self.config.launch_settle,
            )
            .await;

        let failure = match launch {
            Ok(LaunchStatus::Running) => None,
            Ok(LaunchStatus::Exited(output)) if output.success() => None,
            Ok(LaunchStatus::Exited(output)) => Some(format!(
                "ssh exited with {}: {}",
                output
                    .status
                    .map_or_else(|| "signal".to_string(), |c| c.to_string()),
                excerpt(&output.stderr)
            )),
            Err(e) => Some(e.to_string()),
        };
        if let Some(message) = failure {
            self.append_profile_log(profile, &[format!("[REMOTE ERROR] {}", message)]);
            return Err(StartError::SpawnFailed(message));
        }

        let handle = RemoteHandle {
            host_id: host.id.clone(),
            host_address: host.host.clone(),
            host_user: host.user.clone(),
            repo_dir: host.repo_dir.clone(),
            started_at: self.clock.now(),
        };
        if let Err(e) = self.handles.save(profile, &handle).await {
            error!("Remote handle for {} not persisted: {}", profile, e);
        }

        self.append_profile_log(
            profile,
            &[format!(
                "[REMOTE SUCCESS] Worker started on {} ({})",
                host.host, host.id
            )],
        );
        info!("Worker for {} started on {}", profile, host.id);

        Ok(StartedInfo::Remote {
            host_id: host.id,
            host_address: host.host,
        })
    }
}

#[async_trait]
impl WorkerLauncher for SshLauncher {
    async fn launch(
        &self,
        profile: &ProfileName,
        options: &WorkerOptions,
    ) -> std::result::Result<StartedInfo, StartError> {
        let host_id = options.remote_target().ok_or_else(|| {
            StartError::InvalidHostConfig("remote execution needs a remote_host_id".to_string())
        })?;
        self.start_remote(profile, host_id, options).await
    }
}
