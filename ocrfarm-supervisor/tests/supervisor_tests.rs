//! Process supervisor tests against real child processes and a fake SSH shell

mod common;

use async_trait::async_trait;
use common::profile;
use ocrfarm_core::config::FarmConfig;
use ocrfarm_core::hosts::{RemoteHost, StaticHostRegistry};
use ocrfarm_core::profile::ProfilePaths;
use ocrfarm_core::state::{InMemoryRuntimeStateStore, RuntimeStateStore};
use ocrfarm_core::worker_env::{ExecutionMode, WorkerOptions};
use ocrfarm_supervisor::{
    CommandOutput, LaunchStatus, ProcessSupervisor, RemoteShell, SshTarget, StartError,
    StartedInfo, WorkerSupervisor,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn test_config(root: &Path) -> FarmConfig {
    let mut config = FarmConfig::default();
    config.paths.repo_dir = root.join("repo");
    config.paths.logs_dir = root.join("logs");
    config.paths.state_dir = root.join("state");
    config.paths.profiles_root = root.join("cache");
    config.paths.hosts_file = root.join("remote_hosts.json");
    config.paths.proxies_file = root.join("proxies.json");
    config.supervisor.default_interpreter = "sh".to_string();
    config.supervisor.crash_check_delay = Duration::from_millis(200);
    std::fs::create_dir_all(&config.paths.repo_dir).expect("Failed to create repo dir");
    config
}

fn write_worker(config: &FarmConfig, script: &str) {
    std::fs::write(config.paths.repo_dir.join("run.py"), script).expect("Failed to write run.py");
}

const STUBBORN_WORKER: &str = "trap '' TERM\nwhile true; do sleep 1; done\n";

/// Fake shell: the entry point probe answers per `has_entry_point`, launches are recorded
struct FakeShell {
    has_entry_point: bool,
    launches: Mutex<Vec<String>>,
}

impl FakeShell {
    fn new(has_entry_point: bool) -> Self {
        Self {
            has_entry_point,
            launches: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(
        &self,
        _target: &SshTarget,
        command: &str,
        _connect_timeout: Duration,
        _timeout: Duration,
    ) -> ocrfarm_supervisor::Result<CommandOutput> {
        let found = command.starts_with("test -f") && self.has_entry_point;
        Ok(CommandOutput {
            status: Some(if found { 0 } else { 1 }),
            stdout: if found { "OK\n".to_string() } else { String::new() },
            stderr: String::new(),
        })
    }

    async fn launch_detached(
        &self,
        _target: &SshTarget,
        command: &str,
        _connect_timeout: Duration,
        _settle: Duration,
    ) -> ocrfarm_supervisor::Result<LaunchStatus> {
        self.launches.lock().unwrap().push(command.to_string());
        Ok(LaunchStatus::Running)
    }
}

fn h1() -> RemoteHost {
    serde_json::from_value(serde_json::json!({
        "id": "h1",
        "host": "192.168.50.11",
        "user": "ocr",
        "repoDir": "/srv/ocr-worker",
    }))
    .expect("valid host")
}

fn remote_options() -> WorkerOptions {
    WorkerOptions {
        execution_mode: Some(ExecutionMode::Worker),
        remote_host_id: Some("h1".to_string()),
        ..Default::default()
    }
}

fn remote_supervisor(
    config: &FarmConfig,
    store: Arc<dyn RuntimeStateStore>,
    shell: Arc<FakeShell>,
) -> ProcessSupervisor {
    ProcessSupervisor::builder(config.clone(), store)
        .host_registry(Arc::new(StaticHostRegistry::new(vec![h1()])))
        .remote_shell(shell)
        .build()
}

#[cfg(unix)]
#[tokio::test]
async fn test_stop_force_kills_worker_ignoring_sigterm() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(dir.path());
    write_worker(&config, STUBBORN_WORKER);
    let store = Arc::new(InMemoryRuntimeStateStore::new());
    let supervisor = ProcessSupervisor::new(config.clone(), store.clone());
    let alice = profile("ft-alice");

    let started = supervisor
        .start(&alice, &WorkerOptions::default())
        .await
        .expect("Failed to start worker");
    assert!(matches!(started, StartedInfo::Local { .. }));
    assert!(supervisor.is_running(&alice).await);
    assert_eq!(
        store.get(&alice).await.unwrap().unwrap().current_action.as_deref(),
        Some("starting")
    );

    let paths = ProfilePaths::new(&config.paths.logs_dir, &config.paths.profiles_root);
    assert!(paths.session_start(&alice).is_some());

    supervisor
        .stop(&alice, Duration::from_millis(300))
        .await
        .expect("Failed to stop worker");

    assert!(!supervisor.is_running(&alice).await);
    assert!(supervisor.pids(&alice).await.is_empty());
    assert_eq!(
        store.get(&alice).await.unwrap().unwrap().current_action.as_deref(),
        Some("stopped")
    );

    // Stop is idempotent
    supervisor
        .stop(&alice, Duration::from_millis(100))
        .await
        .expect("Second stop failed");
}

#[cfg(unix)]
#[tokio::test]
async fn test_duplicate_start_reports_already_running() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(dir.path());
    write_worker(&config, STUBBORN_WORKER);
    let supervisor = ProcessSupervisor::new(config, Arc::new(InMemoryRuntimeStateStore::new()));
    let bob = profile("dup-bob");

    supervisor
        .start(&bob, &WorkerOptions::default())
        .await
        .expect("Failed to start worker");

    for _ in 0..3 {
        let err = supervisor
            .start(&bob, &WorkerOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, StartError::AlreadyRunning(bob.clone()));
    }
    assert_eq!(supervisor.pids(&bob).await.len(), 1);

    supervisor
        .stop(&bob, Duration::ZERO)
        .await
        .expect("Failed to stop worker");
    assert!(!supervisor.is_running(&bob).await);
}

#[tokio::test]
async fn test_missing_local_entry_point_releases_claim() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(dir.path());
    let supervisor = ProcessSupervisor::new(config, Arc::new(InMemoryRuntimeStateStore::new()));
    let erin = profile("erin");

    for _ in 0..2 {
        let err = supervisor
            .start(&erin, &WorkerOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StartError::MissingEntryPoint(_)), "{err:?}");
    }
}

#[tokio::test]
async fn test_remote_start_without_entry_point_never_launches() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(dir.path());
    let shell = Arc::new(FakeShell::new(false));
    let supervisor = remote_supervisor(
        &config,
        Arc::new(InMemoryRuntimeStateStore::new()),
        shell.clone(),
    );
    let carol = profile("carol");

    let err = supervisor
        .start(&carol, &remote_options())
        .await
        .unwrap_err();

    assert!(matches!(err, StartError::MissingEntryPoint(_)), "{err:?}");
    assert!(shell.launches.lock().unwrap().is_empty());
    assert!(supervisor.remote_handle(&carol).await.is_none());
    assert!(!supervisor.is_running(&carol).await);

    let log = std::fs::read_to_string(config.paths.logs_dir.join("profiles/carol.log"))
        .expect("profile log written");
    assert!(log.contains("[REMOTE ERROR]"));
}

#[tokio::test]
async fn test_remote_handle_survives_supervisor_restart() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(dir.path());
    let store: Arc<dyn RuntimeStateStore> = Arc::new(InMemoryRuntimeStateStore::new());
    let dave = profile("dave");

    let shell = Arc::new(FakeShell::new(true));
    let first = remote_supervisor(&config, store.clone(), shell.clone());
    let started = first
        .start(&dave, &remote_options())
        .await
        .expect("Failed to start remote worker");
    assert_eq!(
        started,
        StartedInfo::Remote {
            host_id: "h1".to_string(),
            host_address: "192.168.50.11".to_string(),
        }
    );
    assert_eq!(shell.launches.lock().unwrap().len(), 1);
    drop(first);

    let second = remote_supervisor(&config, store.clone(), shell.clone());
    let handle = second
        .remote_handle(&dave)
        .await
        .expect("handle survives restart");
    assert_eq!(handle.host_id, "h1");
    assert_eq!(handle.host_user, "ocr");
    assert!(second.is_running(&dave).await);
    assert!(second.snapshot().await.is_running(&dave));

    let err = second.start(&dave, &remote_options()).await.unwrap_err();
    assert!(err.is_already_running());
    assert_eq!(shell.launches.lock().unwrap().len(), 1);

    second
        .stop(&dave, Duration::ZERO)
        .await
        .expect("Failed to stop remote worker");
    drop(second);

    let third = remote_supervisor(&config, store, shell);
    assert!(third.remote_handle(&dave).await.is_none());
    assert!(!third.is_running(&dave).await);
}
