//! Error types for supervisor operations

use ocrfarm_core::profile::ProfileName;
use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Remote command timed out after {0:?}")]
    RemoteTimeout(std::time::Duration),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error(transparent)]
    Farm(#[from] ocrfarm_core::error::FarmError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Why a worker start did not happen.
///
/// `AlreadyRunning` is informational; callers decide whether it counts as a
/// failure. Every other variant is a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("profile {0} is already running")]
    AlreadyRunning(ProfileName),

    #[error("worker entry point not found: {0}")]
    MissingEntryPoint(String),

    #[error("worker exited immediately ({status})")]
    CrashedImmediately {
        status: String,
        /// Last lines of the profile log
        log_tail: Vec<String>,
    },

    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("unknown remote host: {0}")]
    UnknownHost(String),

    #[error("remote host {0} has no repo_dir configured")]
    MissingRepoDir(String),

    #[error("invalid host configuration: {0}")]
    InvalidHostConfig(String),
}

impl StartError {
    /// Short machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            StartError::AlreadyRunning(_) => "already_running",
            StartError::MissingEntryPoint(_) => "missing_entry_point",
            StartError::CrashedImmediately { .. } => "crashed_immediately",
            StartError::SpawnFailed(_) => "spawn_failed",
            StartError::UnknownHost(_) => "unknown_host",
            StartError::MissingRepoDir(_) => "missing_repo_dir",
            StartError::InvalidHostConfig(_) => "invalid_host_config",
        }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, StartError::AlreadyRunning(_))
    }

    /// Message including the log tail for immediate crashes
    pub fn detailed(&self) -> String {
        match self {
            StartError::CrashedImmediately { log_tail, .. } if !log_tail.is_empty() => {
                format!("{}:\n{}", self, log_tail.join("\n"))
            }
            _ => self.to_string(),
        }
    }
}
