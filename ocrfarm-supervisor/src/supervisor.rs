//! Worker supervisor trait and the process-based implementation

use crate::error::{Result, StartError};
use crate::launcher::{StartedInfo, WorkerLauncher};
use crate::ledger::StartAttemptLedger;
use crate::locator::{ProcessLocator, ProcessTable, SysinfoProcessTable};
use crate::process::{LocalLauncher, LocalLauncherConfig};
use crate::remote::{
    OpenSshShell, RemoteHandle, RemoteHandleStore, RemoteShell, SshLauncher, SshLauncherConfig,
};
use async_trait::async_trait;
use ocrfarm_core::clock::{Clock, SystemClock};
use ocrfarm_core::config::FarmConfig;
use ocrfarm_core::hosts::{FileHostRegistry, HostRegistry};
use ocrfarm_core::profile::{ProfileName, ProfilePaths};
use ocrfarm_core::state::{RuntimeStateStore, actions};
use ocrfarm_core::worker_env::WorkerOptions;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// Workers observed at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    /// Local PIDs per profile
    pub local: BTreeMap<ProfileName, Vec<u32>>,
    /// Remote handles per profile
    pub remote: BTreeMap<ProfileName, RemoteHandle>,
}

impl WorkerSnapshot {
    pub fn is_running(&self, profile: &ProfileName) -> bool {
        self.local.get(profile).is_some_and(|pids| !pids.is_empty())
            || self.remote.contains_key(profile)
    }

    pub fn pids(&self, profile: &ProfileName) -> Vec<u32> {
        self.local.get(profile).cloned().unwrap_or_default()
    }
}

/// Starts, stops and observes workers wherever they run
#[async_trait]
pub trait WorkerSupervisor: Send + Sync {
    /// Live local PID or a remote handle
    async fn is_running(&self, profile: &ProfileName) -> bool;

    /// Start a worker for the profile
    async fn start(
        &self,
        profile: &ProfileName,
        options: &WorkerOptions,
    ) -> std::result::Result<StartedInfo, StartError>;

    /// Stop every worker of the profile; idempotent
    async fn stop(&self, profile: &ProfileName, wait_timeout: Duration) -> Result<()>;

    /// Local PIDs serving the profile
    async fn pids(&self, profile: &ProfileName) -> Vec<u32>;

    /// Where the profile runs remotely, if it does
    async fn remote_handle(&self, profile: &ProfileName) -> Option<RemoteHandle>;

    /// Every running worker, from one process scan
    async fn snapshot(&self) -> WorkerSnapshot;
}

/// Builder for [`ProcessSupervisor`]; unset collaborators get production defaults
pub struct ProcessSupervisorBuilder {
    config: FarmConfig,
    store: Arc<dyn RuntimeStateStore>,
    clock: Option<Arc<dyn Clock>>,
    table: Option<Arc<dyn ProcessTable>>,
    registry: Option<Arc<dyn HostRegistry>>,
    shell: Option<Arc<dyn RemoteShell>>,
}

impl ProcessSupervisorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn process_table(mut self, table: Arc<dyn ProcessTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn host_registry(mut self, registry: Arc<dyn HostRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn remote_shell(mut self, shell: Arc<dyn RemoteShell>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn build(self) -> ProcessSupervisor {
        let paths_cfg = &self.config.paths;
        let sup_cfg = &self.config.supervisor;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let table = self
            .table
            .unwrap_or_else(|| Arc::new(SysinfoProcessTable::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(FileHostRegistry::new(&paths_cfg.hosts_file)));
        let shell = self.shell.unwrap_or_else(|| {
            Arc::new(OpenSshShell::new().with_session_timeout(sup_cfg.ssh_session_timeout))
        });

        let paths = ProfilePaths::new(&paths_cfg.logs_dir, &paths_cfg.profiles_root);
        let handles = Arc::new(RemoteHandleStore::new(&paths_cfg.state_dir));

        let locator = Arc::new(ProcessLocator::new(
            table,
            Arc::clone(&clock),
            sup_cfg.entry_point.clone(),
            sup_cfg.process_cache_ttl,
        ));
        let ledger = StartAttemptLedger::new(
            Arc::clone(&clock),
            sup_cfg.start_window,
            sup_cfg.ledger_horizon,
        );

        let local = LocalLauncher::new(
            LocalLauncherConfig {
                repo_dir: paths_cfg.repo_dir.clone(),
                entry_point: sup_cfg.entry_point.clone(),
                default_interpreter: sup_cfg.default_interpreter.clone(),
                proxies_file: paths_cfg.proxies_file.clone(),
                crash_check_delay: sup_cfg.crash_check_delay,
            },
            paths.clone(),
        );
        let remote = SshLauncher::new(
            SshLauncherConfig {
                entry_point: sup_cfg.entry_point.clone(),
                proxies_file: paths_cfg.proxies_file.clone(),
                connect_timeout: sup_cfg.ssh_connect_timeout,
                probe_timeout: sup_cfg.ssh_probe_timeout,
                mount_timeout: sup_cfg.ssh_mount_timeout,
                launch_settle: sup_cfg.remote_launch_settle,
                inherit_env: true,
            },
            registry,
            shell,
            Arc::clone(&handles),
            paths.clone(),
            Arc::clone(&clock),
        );

        ProcessSupervisor {
            locator,
            ledger,
            local,
            remote,
            handles,
            store: self.store,
            paths,
            clock,
        }
    }
}

/// Supervisor managing local child processes and SSH-launched remote workers
pub struct ProcessSupervisor {
    locator: Arc<ProcessLocator>,
    ledger: StartAttemptLedger,
    local: LocalLauncher,
    remote: SshLauncher,
    handles: Arc<RemoteHandleStore>,
    store: Arc<dyn RuntimeStateStore>,
    paths: ProfilePaths,
    clock: Arc<dyn Clock>,
}

impl ProcessSupervisor {
    pub fn builder(
        config: FarmConfig,
        store: Arc<dyn RuntimeStateStore>,
    ) -> ProcessSupervisorBuilder {
        ProcessSupervisorBuilder {
            config,
            store,
            clock: None,
            table: None,
            registry: None,
            shell: None,
        }
    }

    /// Production supervisor for `config`
    pub fn new(config: FarmConfig, store: Arc<dyn RuntimeStateStore>) -> Self {
        Self::builder(config, store).build()
    }

    pub fn locator(&self) -> &ProcessLocator {
        &self.locator
    }

    /// Run a locator query on the blocking pool; process table scans read `/proc`
    async fn query<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&ProcessLocator) -> T + Send + 'static,
        T: Default + Send + 'static,
    {
        let locator = Arc::clone(&self.locator);
        match tokio::task::spawn_blocking(move || f(&locator)).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Process table query failed: {}", e);
                T::default()
            }
        }
    }

    async fn profile_pids(&self, profile: &ProfileName) -> Vec<u32> {
        let profile = profile.clone();
        self.query(move |locator| locator.profile_pids(&profile).into_iter().collect())
            .await
    }

    async fn record_action(&self, profile: &ProfileName, action: &str) {
        if let Err(e) = self
            .store
            .set_current_action(profile, action, self.clock.now())
            .await
        {
            warn!("Cannot record action {} for {}: {}", action, profile, e);
        }
    }

    async fn launch(
        &self,
        profile: &ProfileName,
        options: &WorkerOptions,
    ) -> std::result::Result<StartedInfo, StartError> {
        if options.remote_target().is_some() {
            return self.remote.launch(profile, options).await;
        }

        if let Err(e) = self.handles.clear(profile).await {
            warn!("Cannot clear stale remote marker for {}: {}", profile, e);
        }
        self.local.launch(profile, options).await
    }

    async fn alive(&self, pids: &[u32]) -> Vec<u32> {
        let pids = pids.to_vec();
        self.query(move |locator| {
            pids.into_iter()
                .filter(|pid| locator.is_running(*pid))
                .collect()
        })
        .await
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match nix::sys::signal::kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {} to {}: {}", signal, pid, e),
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn force_kill(pid: u32) {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    warn!("Signals are not supported on this platform; cannot stop {}", pid);
}

#[cfg(not(unix))]
fn force_kill(pid: u32) {
    warn!("Signals are not supported on this platform; cannot kill {}", pid);
}

#[async_trait]
impl WorkerSupervisor for ProcessSupervisor {
    async fn is_running(&self, profile: &ProfileName) -> bool {
        !self.profile_pids(profile).await.is_empty()
            || self.handles.load(profile).await.is_some()
    }

    async fn start(
        &self,
        profile: &ProfileName,
        options: &WorkerOptions,
    ) -> std::result::Result<StartedInfo, StartError> {
        if self.is_running(profile).await {
            debug!("{} is already running", profile);
            return Err(StartError::AlreadyRunning(profile.clone()));
        }
        if !self.ledger.try_claim(profile) {
            debug!("{} has a start attempt in flight", profile);
            return Err(StartError::AlreadyRunning(profile.clone()));
        }

        let started = match self.launch(profile, options).await {
            Ok(started) => started,
            Err(e) => {
                self.ledger.release(profile);
                warn!("Failed to start {}: {}", profile, e);
                return Err(e);
            }
        };

        self.locator.invalidate();
        if let Err(e) = self.paths.stamp_session_start(profile, self.clock.now()) {
            warn!("Cannot stamp session start for {}: {}", profile, e);
        }
        self.record_action(profile, actions::STARTING).await;

        info!("Started {} ({})", profile, started);
        Ok(started)
    }

    async fn stop(&self, profile: &ProfileName, wait_timeout: Duration) -> Result<()> {
        if let Err(e) = self.handles.clear(profile).await {
            warn!("Cannot clear remote handle for {}: {}", profile, e);
        }

        self.locator.invalidate();
        let pids = self.profile_pids(profile).await;
        if !pids.is_empty() {
            info!("Stopping {} (PIDs: {:?})", profile, pids);
        }
        for pid in &pids {
            terminate(*pid);
        }

        let mut survivors = pids;
        if !wait_timeout.is_zero() {
            let deadline = Instant::now() + wait_timeout;
            loop {
                self.local.reap().await;
                survivors = self.alive(&survivors).await;
                if survivors.is_empty() || Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
            }
        } else {
            survivors = self.alive(&survivors).await;
        }

        if !survivors.is_empty() {
            warn!("Force killing {} (PIDs: {:?})", profile, survivors);
            for pid in &survivors {
                force_kill(*pid);
            }
            tokio::time::sleep(KILL_SETTLE).await;
        }

        self.local.reap().await;
        self.locator.invalidate();
        self.ledger.release(profile);
        self.record_action(profile, actions::STOPPED).await;
        Ok(())
    }

    async fn pids(&self, profile: &ProfileName) -> Vec<u32> {
        self.profile_pids(profile).await
    }

    async fn remote_handle(&self, profile: &ProfileName) -> Option<RemoteHandle> {
        self.handles.load(profile).await
    }

    async fn snapshot(&self) -> WorkerSnapshot {
        self.local.reap().await;
        WorkerSnapshot {
            local: self.query(|locator| locator.running_profiles()).await,
            remote: self.handles.list().await,
        }
    }
}
