//! Discovery of worker processes in the OS process table

use chrono::{DateTime, Utc};
use ocrfarm_core::clock::Clock;
use ocrfarm_core::profile::ProfileName;
use ocrfarm_core::worker_env::PROFILE_TAG_VAR;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, System, UpdateKind};
use tracing::{debug, warn};

/// A worker process found in the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: u32,
    /// Profile tag from the process environment, if readable and valid
    pub profile: Option<ProfileName>,
}

/// Read-only view of the OS process table
pub trait ProcessTable: Send + Sync {
    /// Live (non-zombie) processes whose command line runs `entry_point`
    fn scan(&self, entry_point: &str) -> Vec<WorkerProcess>;

    /// Whether `pid` exists and is not a zombie
    fn is_alive(&self, pid: u32) -> bool;
}

/// Whether a command line invokes the worker entry point
pub fn runs_entry_point(cmd: &[String], entry_point: &str) -> bool {
    let entry_name = Path::new(entry_point)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(entry_point);
    cmd.iter().any(|arg| {
        arg == entry_point
            || Path::new(arg)
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n == entry_name)
    })
}

/// Extract the profile tag from `KEY=VALUE` environment entries
pub fn profile_from_environ(environ: &[String]) -> Option<ProfileName> {
    let prefix = format!("{}=", PROFILE_TAG_VAR);
    environ
        .iter()
        .find_map(|entry| entry.strip_prefix(&prefix))
        .and_then(|value| ProfileName::new(value).ok())
}

/// Process table backed by `sysinfo`
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn scan(&self, entry_point: &str) -> Vec<WorkerProcess> {
        let Ok(mut system) = self.system.lock() else {
            warn!("Process table lock poisoned; reporting no workers");
            return Vec::new();
        };

        // A process first seen before its exec keeps a stale command line
        // unless it is re-read on every scan.
        system.refresh_processes_specifics(
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );

        let matched: Vec<Pid> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
            .filter(|(_, process)| runs_entry_point(process.cmd(), entry_point))
            .map(|(pid, _)| *pid)
            .collect();

        let mut workers = Vec::with_capacity(matched.len());
        for pid in matched {
            // The profile tag is only known after exec, so re-read it too
            if !system.refresh_process_specifics(
                pid,
                ProcessRefreshKind::new().with_environ(UpdateKind::Always),
            ) {
                continue;
            }
            if let Some(process) = system.process(pid) {
                workers.push(WorkerProcess {
                    pid: pid.as_u32(),
                    profile: profile_from_environ(process.environ()),
                });
            }
        }
        workers.sort_by_key(|w| w.pid);
        workers
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return false;
        };
        let pid = Pid::from_u32(pid);
        if !system.refresh_process_specifics(pid, ProcessRefreshKind::new()) {
            return false;
        }
        system
            .process(pid)
            .is_some_and(|p| p.status() != ProcessStatus::Zombie)
    }
}

struct CachedScan {
    taken_at: DateTime<Utc>,
    workers: Arc<Vec<WorkerProcess>>,
}

/// Cached view of worker processes.
///
/// Scans are reused for `ttl` as measured by the injected clock; call
/// [`ProcessLocator::invalidate`] after sending signals.
pub struct ProcessLocator {
    table: Arc<dyn ProcessTable>,
    clock: Arc<dyn Clock>,
    entry_point: String,
    ttl: Duration,
    cache: Mutex<Option<CachedScan>>,
}

impl ProcessLocator {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        clock: Arc<dyn Clock>,
        entry_point: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            table,
            clock,
            entry_point: entry_point.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// All worker processes, tagged with their profile where known
    pub fn list_worker_processes(&self) -> Arc<Vec<WorkerProcess>> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());

        let Ok(mut cache) = self.cache.lock() else {
            return Arc::new(self.table.scan(&self.entry_point));
        };

        if let Some(cached) = cache.as_ref() {
            let age = now - cached.taken_at;
            if age >= chrono::Duration::zero() && age < ttl {
                return Arc::clone(&cached.workers);
            }
        }

        let workers = Arc::new(self.table.scan(&self.entry_point));
        debug!("Scanned process table: {} worker(s)", workers.len());
        *cache = Some(CachedScan {
            taken_at: now,
            workers: Arc::clone(&workers),
        });
        workers
    }

    /// Whether `pid` is alive, bypassing the cache
    pub fn is_running(&self, pid: u32) -> bool {
        self.table.is_alive(pid)
    }

    /// PIDs serving a profile
    pub fn profile_pids(&self, profile: &ProfileName) -> BTreeSet<u32> {
        self.list_worker_processes()
            .iter()
            .filter(|w| w.profile.as_ref() == Some(profile))
            .map(|w| w.pid)
            .collect()
    }

    /// PIDs grouped by profile, from a single scan
    pub fn running_profiles(&self) -> BTreeMap<ProfileName, Vec<u32>> {
        let mut grouped: BTreeMap<ProfileName, Vec<u32>> = BTreeMap::new();
        for worker in self.list_worker_processes().iter() {
            if let Some(profile) = &worker.profile {
                grouped.entry(profile.clone()).or_default().push(worker.pid);
            }
        }
        grouped
    }

    /// Drop the cached scan
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocrfarm_core::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTable {
        workers: Mutex<Vec<WorkerProcess>>,
        scans: AtomicUsize,
    }

    impl FakeTable {
        fn new(workers: Vec<WorkerProcess>) -> Self {
            Self {
                workers: Mutex::new(workers),
                scans: AtomicUsize::new(0),
            }
        }
    }

    impl ProcessTable for FakeTable {
        fn scan(&self, _entry_point: &str) -> Vec<WorkerProcess> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            self.workers.lock().unwrap().clone()
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.workers.lock().unwrap().iter().any(|w| w.pid == pid)
        }
    }

    fn worker(pid: u32, profile: Option<&str>) -> WorkerProcess {
        WorkerProcess {
            pid,
            profile: profile.map(|p| ProfileName::new(p).unwrap()),
        }
    }

    #[test]
    fn test_entry_point_matching() {
        let cmd = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        assert!(runs_entry_point(&cmd(&["python3", "run.py"]), "run.py"));
        assert!(runs_entry_point(&cmd(&["/opt/venv/bin/python", "/srv/ocr/run.py"]), "run.py"));
        assert!(!runs_entry_point(&cmd(&["python3", "rerun.py"]), "run.py"));
        assert!(!runs_entry_point(&cmd(&["python3", "-m", "http.server"]), "run.py"));
    }

    #[test]
    fn test_profile_tag_extraction() {
        let env = vec![
            "PATH=/usr/bin".to_string(),
            "OCR_PROFILE_SUFFIX=alice".to_string(),
        ];
        assert_eq!(profile_from_environ(&env).unwrap().as_str(), "alice");
        assert!(profile_from_environ(&["OCR_PROFILE_SUFFIX=a/b".to_string()]).is_none());
        assert!(profile_from_environ(&[]).is_none());
    }

    #[test]
    fn test_cache_honours_ttl_and_invalidate() {
        let table = Arc::new(FakeTable::new(vec![worker(10, Some("alice"))]));
        let clock = ManualClock::default();
        let locator = ProcessLocator::new(
            table.clone(),
            Arc::new(clock.clone()),
            "run.py",
            Duration::from_secs(2),
        );

        assert_eq!(locator.list_worker_processes().len(), 1);
        table.workers.lock().unwrap().push(worker(11, Some("bob")));

        // Still cached
        assert_eq!(locator.list_worker_processes().len(), 1);
        assert_eq!(table.scans.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(2));
        assert_eq!(locator.list_worker_processes().len(), 2);
        assert_eq!(table.scans.load(Ordering::SeqCst), 2);

        table.workers.lock().unwrap().clear();
        locator.invalidate();
        assert!(locator.list_worker_processes().is_empty());
    }

    #[test]
    fn test_grouping_by_profile() {
        let table = Arc::new(FakeTable::new(vec![
            worker(10, Some("alice")),
            worker(12, Some("alice")),
            worker(20, Some("bob")),
            worker(30, None),
        ]));
        let locator = ProcessLocator::new(
            table,
            Arc::new(ManualClock::default()),
            "run.py",
            Duration::from_secs(2),
        );

        let alice = ProfileName::new("alice").unwrap();
        assert_eq!(locator.profile_pids(&alice), BTreeSet::from([10, 12]));

        let grouped = locator.running_profiles();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&ProfileName::new("bob").unwrap()], vec![20]);
        assert!(locator.is_running(30));
        assert!(!locator.is_running(99));
    }

    #[test]
    fn test_sysinfo_table_sees_current_process() {
        let table = SysinfoProcessTable::new();
        assert!(table.is_alive(std::process::id()));
        assert!(table.scan("definitely-not-a-worker-entry.py").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_sysinfo_table_matches_worker_after_exec() {
        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let script = dir.path().join("exec_worker_entry.py");
        std::fs::write(&script, "while true; do sleep 1; done\n")
            .expect("Failed to write worker script");

        // The command line only names the entry point once `exec` has run
        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 1; exec sh \"$WORKER_SCRIPT\"")
            .env("WORKER_SCRIPT", &script)
            .env(PROFILE_TAG_VAR, "alice")
            .spawn()
            .expect("Failed to spawn worker");

        let table = SysinfoProcessTable::new();
        assert!(table.scan("exec_worker_entry.py").is_empty());

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let found = loop {
            let workers = table.scan("exec_worker_entry.py");
            if !workers.is_empty() || std::time::Instant::now() >= deadline {
                break workers;
            }
            std::thread::sleep(Duration::from_millis(200));
        };

        child.kill().expect("Failed to kill worker");
        child.wait().expect("Failed to reap worker");

        assert_eq!(
            found,
            vec![WorkerProcess {
                pid: child.id(),
                profile: Some(ProfileName::new("alice").unwrap()),
            }]
        );
    }
}
