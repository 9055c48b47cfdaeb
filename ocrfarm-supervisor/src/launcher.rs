//! Worker launch strategies

use crate::error::StartError;
use async_trait::async_trait;
use ocrfarm_core::profile::ProfileName;
use ocrfarm_core::worker_env::WorkerOptions;
use serde::Serialize;

/// Where a freshly started worker runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "location", rename_all = "snake_case")]
pub enum StartedInfo {
    Local { pid: u32 },
    Remote { host_id: String, host_address: String },
}

impl std::fmt::Display for StartedInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartedInfo::Local { pid } => write!(f, "pid {}", pid),
            StartedInfo::Remote {
                host_id,
                host_address,
            } => write!(f, "host {} ({})", host_id, host_address),
        }
    }
}

/// Starts a worker process for a profile somewhere
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Spawn the worker and confirm it did not die straight away
    async fn launch(
        &self,
        profile: &ProfileName,
        options: &WorkerOptions,
    ) -> std::result::Result<StartedInfo, StartError>;
}
