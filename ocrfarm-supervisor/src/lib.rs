//! ocrfarm supervisor - runs and heals a farm of OCR workers
//!
//! Three cooperating pieces share one runtime state store:
//!
//! - [`ProcessSupervisor`] starts, stops and observes workers, locally as
//!   child processes or on remote hosts over SSH.
//! - [`FarmConductor`] restarts crashed or never-started workers with a
//!   per-cycle launch cap, resource ceilings, stagger delay and backoff.
//! - [`PauseScheduler`] clears expired rate-limit pauses and brings the
//!   affected workers back.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ocrfarm_core::prelude::*;
//! use ocrfarm_supervisor::{FarmConductor, ProcessSupervisor, install_shutdown_handler};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = FarmConfig::load()?;
//! let store = Arc::new(SqliteRuntimeStateStore::open(&config.store.db_path)?);
//! let supervisor = Arc::new(ProcessSupervisor::new(config.clone(), store));
//!
//! let mut conductor = FarmConductor::new(
//!     config.conductor.clone(),
//!     supervisor,
//!     Arc::new(SysinfoResourceMonitor::new()),
//!     Arc::new(SystemClock),
//! );
//! conductor.run(install_shutdown_handler()).await;
//! # Ok(())
//! # }
//! ```

mod conductor;
mod error;
mod farm;
mod launcher;
mod ledger;
mod locator;
mod pause;
mod process;
mod readiness;
mod remote;
mod shutdown;
mod supervisor;

pub use conductor::{
    ActionKind, ConductorProfileState, CycleAction, CycleSummary, FarmConductor, ProfileSummary,
    compute_backoff,
};
pub use error::{Result, StartError, SupervisorError};
pub use farm::run_farm;
pub use launcher::{StartedInfo, WorkerLauncher};
pub use ledger::StartAttemptLedger;
pub use locator::{ProcessLocator, ProcessTable, SysinfoProcessTable, WorkerProcess};
pub use pause::PauseScheduler;
pub use process::{LocalLauncher, LocalLauncherConfig, select_interpreter};
pub use readiness::{HttpReadinessProbe, ReadinessProbe, wait_until_ready};
pub use remote::{
    CommandOutput, LaunchStatus, OpenSshShell, RemoteHandle, RemoteHandleStore, RemoteShell,
    SshLauncher, SshLauncherConfig, SshTarget,
};
pub use shutdown::install_shutdown_handler;
pub use supervisor::{
    ProcessSupervisor, ProcessSupervisorBuilder, WorkerSnapshot, WorkerSupervisor,
};
