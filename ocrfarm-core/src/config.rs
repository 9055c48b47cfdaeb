//! Configuration types for the OCR farm

use crate::error::{FarmError, Result};
use crate::profile::ProfileName;
use crate::worker_env::WorkerOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the farm orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FarmConfig {
    /// Filesystem layout
    pub paths: PathsConfig,

    /// Runtime state store
    pub store: StoreConfig,

    /// Process supervisor and remote launcher
    pub supervisor: SupervisorConfig,

    /// Farm conductor control loop
    pub conductor: ConductorConfig,

    /// Pause/resume scheduler
    pub scheduler: SchedulerConfig,
}

/// Filesystem layout shared with the workers and the dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Worker repository holding the entry point and its virtualenv
    pub repo_dir: PathBuf,

    /// Root of per-profile log files (`<logs_dir>/profiles/<profile>.log`)
    pub logs_dir: PathBuf,

    /// Orchestrator-owned state such as remote handle markers
    pub state_dir: PathBuf,

    /// Parent of the per-profile browser directories
    pub profiles_root: PathBuf,

    /// Remote host registry
    pub hosts_file: PathBuf,

    /// Per-profile proxy settings
    pub proxies_file: PathBuf,
}

fn default_profiles_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".cache"))
        .unwrap_or_else(|| PathBuf::from(".cache"))
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            repo_dir: PathBuf::from("."),
            logs_dir: PathBuf::from("logs"),
            state_dir: PathBuf::from("logs/state"),
            profiles_root: default_profiles_root(),
            hosts_file: PathBuf::from("config/remote_hosts.json"),
            proxies_file: PathBuf::from("config/proxies.json"),
        }
    }
}

/// Runtime state store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database shared with the dashboard and the limit detector
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("logs/state/runtime.db"),
        }
    }
}

/// Process supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker entry point, relative to the repository
    pub entry_point: String,

    /// Interpreter used when the repository has no virtualenv
    pub default_interpreter: String,

    /// How long a process table snapshot is reused
    #[serde(with = "humantime_serde")]
    pub process_cache_ttl: Duration,

    /// Window in which a recorded start suppresses another start
    #[serde(with = "humantime_serde")]
    pub start_window: Duration,

    /// Age after which start attempts are forgotten
    #[serde(with = "humantime_serde")]
    pub ledger_horizon: Duration,

    /// Delay before checking that a fresh child is still alive
    #[serde(with = "humantime_serde")]
    pub crash_check_delay: Duration,

    /// Delay before checking the local ssh of a detached remote launch
    #[serde(with = "humantime_serde")]
    pub remote_launch_settle: Duration,

    /// ssh `ConnectTimeout` for the launch call
    #[serde(with = "humantime_serde")]
    pub ssh_connect_timeout: Duration,

    /// Local timeout for the entry point probe
    #[serde(with = "humantime_serde")]
    pub ssh_probe_timeout: Duration,

    /// Local timeout for the source share mount
    #[serde(with = "humantime_serde")]
    pub ssh_mount_timeout: Duration,

    /// How long a detached launch's ssh may stay attached before it is killed
    #[serde(with = "humantime_serde")]
    pub ssh_session_timeout: Duration,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(with = "humantime_serde")]
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            entry_point: "run.py".to_string(),
            default_interpreter: "python3".to_string(),
            process_cache_ttl: Duration::from_secs(2),
            start_window: Duration::from_secs(20),
            ledger_horizon: Duration::from_secs(240),
            crash_check_delay: Duration::from_millis(200),
            remote_launch_settle: Duration::from_millis(1500),
            ssh_connect_timeout: Duration::from_secs(10),
            ssh_probe_timeout: Duration::from_secs(15),
            ssh_mount_timeout: Duration::from_secs(45),
            ssh_session_timeout: Duration::from_secs(120),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Farm conductor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Managed profiles, in scheduling order
    pub profiles: Vec<ProfileName>,

    /// Options passed to every start
    pub defaults: WorkerOptions,

    /// Maximum starts issued in one cycle.
    ///
    /// Workers already running do not count against it, so this is not a
    /// cap on the size of the fleet.
    pub max_concurrency: usize,

    /// Minimum spacing between starts of healthy profiles
    #[serde(with = "humantime_serde")]
    pub startup_delay: Duration,

    /// Base restart backoff
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Cycle interval (never below 5s)
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Memory usage ceiling in percent
    pub max_memory_percent: f64,

    /// 1-minute load average ceiling
    pub max_cpu_load_1m: f64,

    /// Dashboard base URL polled for readiness before the first cycle
    pub dashboard_url: Option<String>,

    /// How long to wait for the dashboard
    #[serde(with = "humantime_serde")]
    pub dashboard_wait: Duration,

    /// Record decisions without starting anything
    pub dry_run: bool,
}

/// Lower bound on the conductor cycle interval
pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

impl ConductorConfig {
    /// Cycle interval with the lower bound applied
    pub fn effective_interval(&self) -> Duration {
        self.health_check_interval.max(MIN_HEALTH_CHECK_INTERVAL)
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            defaults: WorkerOptions::default(),
            max_concurrency: 4,
            startup_delay: Duration::from_secs(30),
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            max_memory_percent: 85.0,
            max_cpu_load_1m: 7.0,
            dashboard_url: Some("http://localhost:9090".to_string()),
            dashboard_wait: Duration::from_secs(120),
            dry_run: false,
        }
    }
}

/// Pause/resume scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether `run` starts the scheduler alongside the conductor
    pub enabled: bool,

    /// Expiry check interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

impl FarmConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `ocrfarm.toml` in the working directory
    /// 3. The file named by `OCRFARM_CONFIG_PATH`
    /// 4. `OCRFARM_` environment variables, nested with `__`
    ///    (e.g. `OCRFARM_CONDUCTOR__MAX_CONCURRENCY=2`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is malformed or the result
    /// fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(FarmConfig::default()))
            .merge(Toml::file("ocrfarm.toml"));

        if let Ok(path) = std::env::var("OCRFARM_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: FarmConfig = figment
            .merge(Env::prefixed("OCRFARM_").split("__"))
            .extract()
            .map_err(|e| {
                FarmError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or fails validation.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: FarmConfig = Figment::from(Serialized::defaults(FarmConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                FarmError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        let conductor = &self.conductor;

        if conductor.max_concurrency == 0 {
            return Err(FarmError::Configuration(
                "conductor.max_concurrency must be at least 1".to_string(),
            ));
        }

        if conductor.backoff_base > conductor.backoff_max {
            return Err(FarmError::Configuration(format!(
                "conductor.backoff_base ({:?}) exceeds conductor.backoff_max ({:?})",
                conductor.backoff_base, conductor.backoff_max
            )));
        }

        if !(0.0..=100.0).contains(&conductor.max_memory_percent) {
            return Err(FarmError::Configuration(format!(
                "conductor.max_memory_percent out of range: {}",
                conductor.max_memory_percent
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for profile in &conductor.profiles {
            if !seen.insert(profile) {
                return Err(FarmError::Configuration(format!(
                    "profile listed twice: {}",
                    profile
                )));
            }
        }

        if self.supervisor.entry_point.trim().is_empty() {
            return Err(FarmError::Configuration(
                "supervisor.entry_point cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
