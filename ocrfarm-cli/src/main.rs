//! ocrfarm CLI - run and operate an OCR worker farm

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use ocrfarm_core::prelude::*;
use ocrfarm_supervisor::{
    FarmConductor, HttpReadinessProbe, PauseScheduler, ProcessSupervisor, WorkerSupervisor,
    install_shutdown_handler, run_farm,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ocrfarm")]
#[command(about = "OCR worker farm orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ocrfarm.toml, OCRFARM_CONFIG_PATH and OCRFARM_* variables)
    #[arg(short, long, global = true, env = "OCRFARM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the conductor and the pause scheduler until interrupted
    Run,
    /// Run the farm conductor
    Conductor {
        /// Run a single cycle and print its summary as JSON
        #[arg(long)]
        once: bool,
        /// Record decisions without starting workers
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the pause/resume scheduler
    Scheduler {
        /// Resume expired pauses once and exit
        #[arg(long)]
        once: bool,
    },
    /// Start a worker for a profile
    Start {
        profile: String,
        /// Run on this host from the host registry
        #[arg(long)]
        remote_host: Option<String>,
        /// Remote execution flavour
        #[arg(long, value_enum, default_value_t = RemoteMode::Worker)]
        mode: RemoteMode,
        /// Show the browser
        #[arg(long)]
        headed: bool,
        #[arg(long)]
        windows: Option<u32>,
        #[arg(long)]
        tabs_per_window: Option<u32>,
        /// Directory the worker scans
        #[arg(long)]
        source: Option<String>,
    },
    /// Stop every worker of a profile
    Stop {
        profile: String,
        /// Seconds to wait after SIGTERM before SIGKILL
        #[arg(long)]
        wait_secs: Option<u64>,
    },
    /// Show workers and pauses
    Status {
        /// Profiles to show (defaults to configured and known profiles)
        profiles: Vec<String>,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Pause a profile
    Pause {
        profile: String,
        /// Pause for this many minutes (indefinite when omitted)
        #[arg(long, conflicts_with = "until")]
        minutes: Option<i64>,
        /// Pause until this RFC 3339 instant
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Clear a pause
    Resume {
        profile: String,
        /// Start the worker after clearing the pause
        #[arg(long)]
        start: bool,
    },
    /// List remote hosts from the registry
    Hosts,
    /// Version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum RemoteMode {
    Worker,
    WslWorker,
}

impl From<RemoteMode> for ExecutionMode {
    fn from(mode: RemoteMode) -> Self {
        match mode {
            RemoteMode::Worker => ExecutionMode::Worker,
            RemoteMode::WslWorker => ExecutionMode::WslWorker,
        }
    }
}

#[derive(Serialize)]
struct ProfileStatus {
    profile: ProfileName,
    running: bool,
    pids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_host: Option<String>,
    paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pause_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pause_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_action: Option<String>,
}

struct Farm {
    config: FarmConfig,
    store: Arc<dyn RuntimeStateStore>,
    supervisor: Arc<ProcessSupervisor>,
}

impl Farm {
    fn open(config: FarmConfig) -> Result<Self> {
        let store: Arc<dyn RuntimeStateStore> = Arc::new(
            SqliteRuntimeStateStore::open(&config.store.db_path).with_context(|| {
                format!("opening state store {}", config.store.db_path.display())
            })?,
        );
        let supervisor = Arc::new(ProcessSupervisor::new(config.clone(), Arc::clone(&store)));
        Ok(Self {
            config,
            store,
            supervisor,
        })
    }

    fn conductor(&self, dry_run: bool) -> Result<FarmConductor> {
        let mut config = self.config.conductor.clone();
        config.dry_run |= dry_run;
        if config.profiles.is_empty() {
            bail!("no profiles configured (conductor.profiles)");
        }

        let mut conductor = FarmConductor::new(
            config.clone(),
            self.supervisor.clone(),
            Arc::new(SysinfoResourceMonitor::new()),
            Arc::new(SystemClock),
        )
        .with_state_store(Arc::clone(&self.store));

        if let Some(url) = &config.dashboard_url {
            conductor = conductor.with_readiness_probe(Arc::new(HttpReadinessProbe::new(url)?));
        }
        Ok(conductor)
    }

    fn scheduler(&self) -> PauseScheduler {
        PauseScheduler::new(
            Arc::clone(&self.store),
            self.supervisor.clone(),
            Arc::new(SystemClock),
            self.config.scheduler.interval,
        )
        .with_options(self.config.conductor.defaults.clone())
    }

    async fn status(&self, requested: Vec<ProfileName>) -> Result<Vec<ProfileStatus>> {
        let snapshot = self.supervisor.snapshot().await;
        let rows = self.store.list().await?;

        let profiles: Vec<ProfileName> = if requested.is_empty() {
            let mut all: std::collections::BTreeSet<ProfileName> =
                self.config.conductor.profiles.iter().cloned().collect();
            all.extend(snapshot.local.keys().cloned());
            all.extend(snapshot.remote.keys().cloned());
            all.extend(rows.iter().map(|r| r.profile.clone()));
            all.into_iter().collect()
        } else {
            requested
        };

        let now = Utc::now();
        Ok(profiles
            .into_iter()
            .map(|profile| {
                let row = rows.iter().find(|r| r.profile == profile);
                ProfileStatus {
                    running: snapshot.is_running(&profile),
                    pids: snapshot.pids(&profile),
                    remote_host: snapshot.remote.get(&profile).map(|h| h.host_id.clone()),
                    paused: row.is_some_and(|r| r.is_paused_at(now)),
                    pause_until: row.and_then(|r| r.pause_until),
                    pause_reason: row.and_then(|r| r.pause_reason.clone()),
                    current_action: row.and_then(|r| r.current_action.clone()),
                    profile,
                }
            })
            .collect())
    }
}

fn load_config(path: Option<PathBuf>) -> Result<FarmConfig> {
    let config = match path {
        Some(path) => FarmConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FarmConfig::load()?,
    };
    Ok(config)
}

fn parse_profile(name: &str) -> Result<ProfileName> {
    ProfileName::new(name).with_context(|| format!("invalid profile name {:?}", name))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("ocrfarm {}", env!("CARGO_PKG_VERSION"));
        println!("ocrfarm-core {}", ocrfarm_core::VERSION);
        return Ok(());
    }

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Version => {}
        Commands::Hosts => {
            let registry = FileHostRegistry::new(&config.paths.hosts_file);
            for host in registry.list()? {
                let validity = match host.validate() {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("invalid: {}", e),
                };
                println!(
                    "{}\t{}\t{}\t{}",
                    host.id,
                    host.destination(),
                    host.repo_dir,
                    validity
                );
            }
        }
        Commands::Run => {
            let farm = Farm::open(config)?;
            let conductor = farm.conductor(false)?;
            let scheduler = farm
                .config
                .scheduler
                .enabled
                .then(|| farm.scheduler());
            run_farm(conductor, scheduler, install_shutdown_handler()).await;
        }
        Commands::Conductor { once, dry_run } => {
            let farm = Farm::open(config)?;
            let mut conductor = farm.conductor(dry_run)?;
            if once {
                let summary = conductor.run_cycle().await;
                print_json(&summary)?;
            } else {
                conductor.run(install_shutdown_handler()).await;
            }
        }
        Commands::Scheduler { once } => {
            let farm = Farm::open(config)?;
            let scheduler = farm.scheduler();
            if once {
                let resumed = scheduler.resume_expired().await;
                print_json(&resumed)?;
            } else {
                scheduler.run(install_shutdown_handler()).await;
            }
        }
        Commands::Start {
            profile,
            remote_host,
            mode,
            headed,
            windows,
            tabs_per_window,
            source,
        } => {
            let profile = parse_profile(&profile)?;
            let farm = Farm::open(config)?;

            let mut options = farm.config.conductor.defaults.clone();
            options.headed |= headed;
            options.windows = windows.or(options.windows);
            options.tabs_per_window = tabs_per_window.or(options.tabs_per_window);
            options.source_path = source.or(options.source_path);
            if let Some(host) = remote_host {
                options.execution_mode = Some(mode.into());
                options.remote_host_id = Some(host);
            }

            match farm.supervisor.start(&profile, &options).await {
                Ok(started) => print_json(&started)?,
                Err(e) if e.is_already_running() => {
                    warn!("{}", e);
                }
                Err(e) => bail!("{}", e.detailed()),
            }
        }
        Commands::Stop { profile, wait_secs } => {
            let profile = parse_profile(&profile)?;
            let farm = Farm::open(config)?;
            let wait = wait_secs
                .map(Duration::from_secs)
                .unwrap_or(farm.config.supervisor.stop_timeout);
            farm.supervisor.stop(&profile, wait).await?;
            info!("Stopped {}", profile);
        }
        Commands::Status { profiles, json } => {
            let requested = profiles
                .iter()
                .map(|p| parse_profile(p))
                .collect::<Result<Vec<_>>>()?;
            let farm = Farm::open(config)?;
            let statuses = farm.status(requested).await?;

            if json {
                print_json(&statuses)?;
            } else {
                for s in &statuses {
                    let location = match (&s.remote_host, s.pids.is_empty()) {
                        (Some(host), _) => format!("remote:{}", host),
                        (None, false) => format!("pids:{:?}", s.pids),
                        (None, true) => "-".to_string(),
                    };
                    let pause = match (s.paused, s.pause_until) {
                        (true, Some(until)) => format!("paused until {}", until.to_rfc3339()),
                        (true, None) => "paused".to_string(),
                        (false, _) => "-".to_string(),
                    };
                    println!(
                        "{:<20} {:<8} {:<24} {:<40} {}",
                        s.profile,
                        if s.running { "running" } else { "stopped" },
                        location,
                        pause,
                        s.current_action.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Pause {
            profile,
            minutes,
            until,
            reason,
        } => {
            let profile = parse_profile(&profile)?;
            let store = SqliteRuntimeStateStore::open(&config.store.db_path)?;
            let now = Utc::now();
            let until = until.or_else(|| minutes.map(|m| now + chrono::Duration::minutes(m)));
            store
                .set_pause(&profile, until, reason.as_deref(), now)
                .await?;
            match until {
                Some(until) => info!("Paused {} until {}", profile, until.to_rfc3339()),
                None => info!("Paused {} indefinitely", profile),
            }
        }
        Commands::Resume { profile, start } => {
            let profile = parse_profile(&profile)?;
            let farm = Farm::open(config)?;
            if farm.store.clear_pause_if_paused(&profile, Utc::now()).await? {
                info!("Cleared pause for {}", profile);
            } else {
                info!("{} was not paused", profile);
            }

            if start {
                let options = farm.config.conductor.defaults.clone();
                match farm.supervisor.start(&profile, &options).await {
                    Ok(started) => print_json(&started)?,
                    Err(e) if e.is_already_running() => warn!("{}", e),
                    Err(e) => bail!("{}", e.detailed()),
                }
            }
        }
    }

    Ok(())
}
