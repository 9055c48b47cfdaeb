//! Shared fakes for supervisor scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use ocrfarm_core::profile::ProfileName;
use ocrfarm_core::worker_env::WorkerOptions;
use ocrfarm_supervisor::{
    RemoteHandle, Result, StartError, StartedInfo, WorkerSnapshot, WorkerSupervisor,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub fn profile(name: &str) -> ProfileName {
    ProfileName::new(name).expect("valid profile name")
}

/// In-memory supervisor that records every start.
///
/// Successful starts mark the profile running; `crash` and `stop` clear it.
#[derive(Default)]
pub struct MockSupervisor {
    running: Mutex<BTreeMap<ProfileName, Vec<u32>>>,
    failing: Mutex<BTreeSet<ProfileName>>,
    report_already_running: Mutex<BTreeSet<ProfileName>>,
    starts: Mutex<Vec<ProfileName>>,
    next_pid: AtomicU32,
}

impl MockSupervisor {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    pub fn fail(&self, profile: &ProfileName) {
        self.failing.lock().unwrap().insert(profile.clone());
    }

    pub fn heal(&self, profile: &ProfileName) {
        self.failing.lock().unwrap().remove(profile);
    }

    pub fn claim_already_running(&self, profile: &ProfileName) {
        self.report_already_running
            .lock()
            .unwrap()
            .insert(profile.clone());
    }

    pub fn crash(&self, profile: &ProfileName) {
        self.running.lock().unwrap().remove(profile);
    }

    pub fn starts(&self) -> Vec<ProfileName> {
        self.starts.lock().unwrap().clone()
    }

    pub fn start_count(&self, profile: &ProfileName) -> usize {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| *p == profile)
            .count()
    }
}

#[async_trait]
impl WorkerSupervisor for MockSupervisor {
    async fn is_running(&self, profile: &ProfileName) -> bool {
        self.running.lock().unwrap().contains_key(profile)
    }

    async fn start(
        &self,
        profile: &ProfileName,
        _options: &WorkerOptions,
    ) -> std::result::Result<StartedInfo, StartError> {
        if self.report_already_running.lock().unwrap().contains(profile) {
            return Err(StartError::AlreadyRunning(profile.clone()));
        }
        if self.running.lock().unwrap().contains_key(profile) {
            return Err(StartError::AlreadyRunning(profile.clone()));
        }

        self.starts.lock().unwrap().push(profile.clone());
        if self.failing.lock().unwrap().contains(profile) {
            return Err(StartError::CrashedImmediately {
                status: "exit status: 1".to_string(),
                log_tail: vec!["Traceback (most recent call last):".to_string()],
            });
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.running
            .lock()
            .unwrap()
            .insert(profile.clone(), vec![pid]);
        Ok(StartedInfo::Local { pid })
    }

    async fn stop(&self, profile: &ProfileName, _wait_timeout: Duration) -> Result<()> {
        self.running.lock().unwrap().remove(profile);
        Ok(())
    }

    async fn pids(&self, profile: &ProfileName) -> Vec<u32> {
        self.running
            .lock()
            .unwrap()
            .get(profile)
            .cloned()
            .unwrap_or_default()
    }

    async fn remote_handle(&self, _profile: &ProfileName) -> Option<RemoteHandle> {
        None
    }

    async fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            local: self.running.lock().unwrap().clone(),
            remote: BTreeMap::new(),
        }
    }
}
