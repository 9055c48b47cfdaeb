//! Self-healing control loop over the managed profiles
//!
//! Each cycle takes one snapshot of running workers and then walks the
//! profiles in configuration order. A profile that is not running is started
//! unless one of the gates holds it back:
//!
//! 1. an unexpired pause in the runtime state store
//! 2. restart backoff after consecutive failures
//! 3. the per-cycle launch cap
//! 4. host memory and load ceilings
//! 5. the stagger delay between starts (waived after a failure)

use crate::launcher::StartedInfo;
use crate::readiness::{ReadinessProbe, wait_until_ready};
use crate::supervisor::{WorkerSnapshot, WorkerSupervisor};
use chrono::{DateTime, Utc};
use ocrfarm_core::clock::Clock;
use ocrfarm_core::config::ConductorConfig;
use ocrfarm_core::profile::ProfileName;
use ocrfarm_core::resource::ResourceMonitor;
use ocrfarm_core::state::RuntimeStateStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READINESS_POLL: Duration = Duration::from_secs(5);
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// What the conductor knows about one profile between cycles
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConductorProfileState {
    pub running: bool,
    pub pids: Vec<u32>,
    pub last_start_time: Option<DateTime<Utc>>,
    pub last_crash_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_restarts: u32,
    pub last_error: Option<String>,
    pub backoff_until: Option<DateTime<Utc>>,
}

impl ConductorProfileState {
    /// Remaining backoff, if the deadline is still ahead of `now`
    pub fn backoff_remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.backoff_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Per-profile line of a cycle summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileSummary {
    pub running: bool,
    pub pids: Vec<u32>,
    pub failures: u32,
    pub restarts: u32,
}

/// Decision taken for a profile in a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    Paused {
        #[serde(skip_serializing_if = "Option::is_none")]
        until: Option<DateTime<Utc>>,
    },
    Backoff {
        wait_s: i64,
    },
    SkipMaxConcurrency,
    SkipResources {
        reason: String,
    },
    StaggerWait,
    DryRunStart,
    DryRunRestart,
    Start {
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        backoff_sec: Option<u64>,
    },
    Restart {
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        backoff_sec: Option<u64>,
    },
    AlreadyRunning,
}

impl ActionKind {
    /// Stable name, as serialized in the `action` field
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Paused { .. } => "paused",
            ActionKind::Backoff { .. } => "backoff",
            ActionKind::SkipMaxConcurrency => "skip_max_concurrency",
            ActionKind::SkipResources { .. } => "skip_resources",
            ActionKind::StaggerWait => "stagger_wait",
            ActionKind::DryRunStart => "dry_run_start",
            ActionKind::DryRunRestart => "dry_run_restart",
            ActionKind::Start { .. } => "start",
            ActionKind::Restart { .. } => "restart",
            ActionKind::AlreadyRunning => "already_running",
        }
    }

    /// Whether a start was issued and succeeded
    pub fn is_successful_start(&self) -> bool {
        matches!(
            self,
            ActionKind::Start { success: true, .. } | ActionKind::Restart { success: true, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleAction {
    pub profile: ProfileName,
    #[serde(flatten)]
    pub kind: ActionKind,
}

/// Result of one conductor cycle, serializable as JSON
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub time: DateTime<Utc>,
    pub profiles: BTreeMap<ProfileName, ProfileSummary>,
    pub actions: Vec<CycleAction>,
}

impl CycleSummary {
    pub fn running_count(&self) -> usize {
        self.profiles.values().filter(|p| p.running).count()
    }

    /// Actions taken for one profile
    pub fn actions_for<'a>(
        &'a self,
        profile: &'a str,
    ) -> impl Iterator<Item = &'a ActionKind> + 'a {
        self.actions
            .iter()
            .filter(move |a| a.profile.as_str() == profile)
            .map(|a| &a.kind)
    }
}

/// `base * 2^min(failures, 6)`, capped at `max`
pub fn compute_backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << failures.min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(factor).min(max)
}

#[derive(Debug, Clone, Copy)]
struct ResourceReading {
    memory_percent: Option<f64>,
    load_1m: Option<f64>,
}

/// Keeps every managed profile running
pub struct FarmConductor {
    config: ConductorConfig,
    supervisor: Arc<dyn WorkerSupervisor>,
    resources: Arc<dyn ResourceMonitor>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn RuntimeStateStore>>,
    readiness: Option<Arc<dyn ReadinessProbe>>,
    states: Vec<(ProfileName, ConductorProfileState)>,
    cycles: u64,
}

impl FarmConductor {
    pub fn new(
        config: ConductorConfig,
        supervisor: Arc<dyn WorkerSupervisor>,
        resources: Arc<dyn ResourceMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let states = config
            .profiles
            .iter()
            .filter(|p| seen.insert((*p).clone()))
            .map(|p| (p.clone(), ConductorProfileState::default()))
            .collect();

        Self {
            config,
            supervisor,
            resources,
            clock,
            store: None,
            readiness: None,
            states,
            cycles: 0,
        }
    }

    /// Skip profiles that hold an unexpired pause in `store`
    pub fn with_state_store(mut self, store: Arc<dyn RuntimeStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Wait for `probe` before the first cycle of [`FarmConductor::run`]
    pub fn with_readiness_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.readiness = Some(probe);
        self
    }

    pub fn state(&self, profile: &ProfileName) -> Option<&ConductorProfileState> {
        self.states
            .iter()
            .find(|(name, _)| name == profile)
            .map(|(_, state)| state)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ProfileName> {
        self.states.iter().map(|(name, _)| name)
    }

    /// Number of cycles run so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    async fn paused_profiles(
        &self,
        now: DateTime<Utc>,
    ) -> BTreeMap<ProfileName, Option<DateTime<Utc>>> {
        let Some(store) = &self.store else {
            return BTreeMap::new();
        };
        match store.list().await {
            Ok(rows) => rows
                .into_iter()
                .filter(|row| row.is_paused_at(now))
                .map(|row| (row.profile, row.pause_until))
                .collect(),
            Err(e) => {
                warn!("Cannot read pauses, ignoring them this cycle: {}", e);
                BTreeMap::new()
            }
        }
    }

    async fn sample_resources(&self) -> ResourceReading {
        let memory_percent = match self.resources.get_memory_usage_percent().await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Memory sampling failed: {}", e);
                None
            }
        };
        let load_1m = match self.resources.get_load_average_1m().await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Load sampling failed: {}", e);
                None
            }
        };
        ResourceReading {
            memory_percent,
            load_1m,
        }
    }

    fn resource_block(&self, reading: ResourceReading) -> Option<String> {
        if let Some(mem) = reading.memory_percent
            && mem > self.config.max_memory_percent
        {
            return Some(format!(
                "Memory too high: {:.1}% > {:.1}%",
                mem, self.config.max_memory_percent
            ));
        }
        if let Some(load) = reading.load_1m
            && load > self.config.max_cpu_load_1m
        {
            return Some(format!(
                "CPU load too high: {:.2} > {:.2}",
                load, self.config.max_cpu_load_1m
            ));
        }
        None
    }

    fn last_start_any(&self) -> Option<DateTime<Utc>> {
        self.states
            .iter()
            .filter_map(|(_, state)| state.last_start_time)
            .max()
    }

    fn refresh(
        &mut self,
        snapshot: &WorkerSnapshot,
        now: DateTime<Utc>,
    ) -> BTreeMap<ProfileName, ProfileSummary> {
        let mut profiles = BTreeMap::new();
        for (name, state) in self.states.iter_mut() {
            let running = snapshot.is_running(name);
            if state.running && !running {
                warn!("[{}] Worker is no longer running", name);
                state.last_crash_time = Some(now);
            }
            state.running = running;
            state.pids = snapshot.pids(name);

            profiles.insert(
                name.clone(),
                ProfileSummary {
                    running: state.running,
                    pids: state.pids.clone(),
                    failures: state.consecutive_failures,
                    restarts: state.total_restarts,
                },
            );
        }
        profiles
    }

    /// Run one monitoring and management cycle
    pub async fn run_cycle(&mut self) -> CycleSummary {
        self.cycles += 1;
        let now = self.clock.now();
        let snapshot = self.supervisor.snapshot().await;
        let profiles = self.refresh(&snapshot, now);
        let paused = self.paused_profiles(now).await;

        let mut actions = Vec::new();
        let mut launched = 0usize;
        let mut reading: Option<ResourceReading> = None;

        for index in 0..self.states.len() {
            let name = self.states[index].0.clone();
            let record = |actions: &mut Vec<CycleAction>, kind: ActionKind| {
                actions.push(CycleAction {
                    profile: name.clone(),
                    kind,
                });
            };

            {
                let state = &mut self.states[index].1;
                if state.running {
                    if state.consecutive_failures > 0 {
                        info!(
                            "[{}] Recovered after {} failures; resetting counter",
                            name, state.consecutive_failures
                        );
                        state.consecutive_failures = 0;
                    }
                    continue;
                }
            }

            if let Some(until) = paused.get(&name) {
                debug!("[{}] Paused", name);
                record(&mut actions, ActionKind::Paused { until: *until });
                continue;
            }

            if let Some(remaining) = self.states[index].1.backoff_remaining(now) {
                debug!("[{}] In backoff ({}s remaining)", name, remaining.num_seconds());
                record(
                    &mut actions,
                    ActionKind::Backoff {
                        wait_s: remaining.num_seconds(),
                    },
                );
                continue;
            }

            // Caps starts per cycle, not running workers
            if launched >= self.config.max_concurrency {
                info!(
                    "[{}] Skipping start: max_concurrency={} starts this cycle",
                    name, self.config.max_concurrency
                );
                record(&mut actions, ActionKind::SkipMaxConcurrency);
                continue;
            }

            let sample = match reading {
                Some(sample) => sample,
                None => {
                    let sample = self.sample_resources().await;
                    reading = Some(sample);
                    sample
                }
            };
            if let Some(reason) = self.resource_block(sample) {
                warn!("[{}] Skipping start: {}", name, reason);
                record(&mut actions, ActionKind::SkipResources { reason });
                continue;
            }

            let startup_delay = chrono::Duration::from_std(self.config.startup_delay)
                .unwrap_or(chrono::Duration::zero());
            let failures = self.states[index].1.consecutive_failures;
            if let Some(last) = self.last_start_any()
                && now - last < startup_delay
                && failures == 0
            {
                debug!(
                    "[{}] Stagger delay: {}s since last start",
                    name,
                    (now - last).num_seconds()
                );
                record(&mut actions, ActionKind::StaggerWait);
                continue;
            }

            let restart = self.states[index].1.total_restarts > 0;
            if self.config.dry_run {
                info!(
                    "[DRY-RUN] Would {} profile {}",
                    if restart { "restart" } else { "start" },
                    name
                );
                record(
                    &mut actions,
                    if restart {
                        ActionKind::DryRunRestart
                    } else {
                        ActionKind::DryRunStart
                    },
                );
                continue;
            }

            info!(
                "[{}] {} (failures={}, restarts={})",
                name,
                if restart { "Restarting" } else { "Starting" },
                failures,
                self.states[index].1.total_restarts
            );

            let options = self.config.defaults.clone();
            let result = self.supervisor.start(&name, &options).await;
            let state = &mut self.states[index].1;

            let (success, message, backoff_sec) = match result {
                Ok(started) => {
                    state.last_start_time = Some(now);
                    state.total_restarts += 1;
                    state.running = true;
                    state.last_error = None;
                    if let StartedInfo::Local { pid } = &started {
                        state.pids = vec![*pid];
                    }
                    launched += 1;
                    info!("[{}] Started: {}", name, started);
                    (true, started.to_string(), None)
                }
                Err(e) if e.is_already_running() => {
                    debug!("[{}] Already running", name);
                    state.running = true;
                    record(&mut actions, ActionKind::AlreadyRunning);
                    continue;
                }
                Err(e) => {
                    state.consecutive_failures += 1;
                    state.last_error = Some(e.detailed());
                    state.last_crash_time = Some(now);
                    let backoff = compute_backoff(
                        state.consecutive_failures,
                        self.config.backoff_base,
                        self.config.backoff_max,
                    );
                    state.backoff_until = chrono::Duration::from_std(backoff)
                        .ok()
                        .map(|b| now + b);
                    error!(
                        "[{}] Failed to start: {} (backoff={}s, failures={})",
                        name,
                        e,
                        backoff.as_secs(),
                        state.consecutive_failures
                    );
                    (false, e.to_string(), Some(backoff.as_secs()))
                }
            };

            let kind = if restart {
                ActionKind::Restart {
                    success,
                    message,
                    backoff_sec,
                }
            } else {
                ActionKind::Start {
                    success,
                    message,
                    backoff_sec,
                }
            };
            record(&mut actions, kind);
        }

        CycleSummary {
            time: now,
            profiles,
            actions,
        }
    }

    /// Run cycles until `token` is cancelled
    pub async fn run(&mut self, token: CancellationToken) {
        let interval = self.config.effective_interval();
        info!(
            "Farm conductor starting: {} profile(s), interval {:?}, max_concurrency {}{}",
            self.states.len(),
            interval,
            self.config.max_concurrency,
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        if let Some(probe) = self.readiness.clone() {
            info!("Waiting for dashboard to be ready...");
            wait_until_ready(probe.as_ref(), READINESS_POLL, self.config.dashboard_wait, &token)
                .await;
        }

        while !token.is_cancelled() {
            let summary = self.run_cycle().await;
            info!(
                "Cycle #{}: {}/{} profiles running, {} actions",
                self.cycles,
                summary.running_count(),
                summary.profiles.len(),
                summary.actions.len()
            );

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Farm conductor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(300);
        let delays: Vec<u64> = (1..=8)
            .map(|f| compute_backoff(f, base, max).as_secs())
            .collect();
        assert_eq!(delays, vec![20, 40, 80, 160, 300, 300, 300, 300]);
        assert_eq!(compute_backoff(0, base, max), base);
    }

    #[test]
    fn test_backoff_exponent_is_bounded() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(u64::MAX / 2);
        assert_eq!(compute_backoff(40, base, max), Duration::from_secs(64));
    }

    #[test]
    fn test_action_serialization() {
        let action = CycleAction {
            profile: ProfileName::new("bob").unwrap(),
            kind: ActionKind::SkipMaxConcurrency,
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            serde_json::json!({"profile": "bob", "action": "skip_max_concurrency"})
        );

        let action = CycleAction {
            profile: ProfileName::new("alice").unwrap(),
            kind: ActionKind::Start {
                success: false,
                message: "worker exited immediately".to_string(),
                backoff_sec: Some(20),
            },
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            serde_json::json!({
                "profile": "alice",
                "action": "start",
                "success": false,
                "message": "worker exited immediately",
                "backoff_sec": 20
            })
        );
        assert_eq!(action.kind.name(), "start");
    }
}
