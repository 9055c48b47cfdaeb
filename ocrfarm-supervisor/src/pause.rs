//! Automatic resume of profiles whose pause has expired

use crate::supervisor::WorkerSupervisor;
use ocrfarm_core::clock::Clock;
use ocrfarm_core::profile::ProfileName;
use ocrfarm_core::state::RuntimeStateStore;
use ocrfarm_core::worker_env::WorkerOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Clears expired pauses and restarts the affected profiles.
///
/// Only `pause_until` matters here; the reason is for display. Several
/// schedulers may share one store: the conditional clear lets exactly one of
/// them resume a given expiry.
pub struct PauseScheduler {
    store: Arc<dyn RuntimeStateStore>,
    supervisor: Arc<dyn WorkerSupervisor>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    options: WorkerOptions,
}

impl PauseScheduler {
    pub fn new(
        store: Arc<dyn RuntimeStateStore>,
        supervisor: Arc<dyn WorkerSupervisor>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            supervisor,
            clock,
            interval,
            options: WorkerOptions::default(),
        }
    }

    /// Options used when restarting a resumed profile
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Resume every profile whose pause has expired.
    ///
    /// Returns the profiles this scheduler cleared. A failed restart is logged
    /// and still counts as resumed; the conductor owns retries from there.
    pub async fn resume_expired(&self) -> Vec<ProfileName> {
        let now = self.clock.now();
        let expired = match self.store.expired_pauses(now).await {
            Ok(expired) => expired,
            Err(e) => {
                warn!("Cannot query expired pauses: {}", e);
                return Vec::new();
            }
        };

        let mut resumed = Vec::new();
        for profile in expired {
            match self.store.clear_pause_if_paused(&profile, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Pause for {} already cleared elsewhere", profile);
                    continue;
                }
                Err(e) => {
                    warn!("Cannot clear pause for {}: {}", profile, e);
                    continue;
                }
            }

            info!("Pause expired for {}; resuming", profile);
            match self.supervisor.start(&profile, &self.options).await {
                Ok(started) => info!("Resumed {} ({})", profile, started),
                Err(e) if e.is_already_running() => {
                    debug!("{} was already running at resume", profile)
                }
                Err(e) => error!("Failed to restart {} after pause: {}", profile, e.detailed()),
            }
            resumed.push(profile);
        }
        resumed
    }

    /// Check for expiries every interval until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) {
        info!("Pause scheduler started (interval {:?})", self.interval);
        while !token.is_cancelled() {
            let resumed = self.resume_expired().await;
            if !resumed.is_empty() {
                info!("Resumed {} profile(s)", resumed.len());
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Pause scheduler stopped");
    }
}
