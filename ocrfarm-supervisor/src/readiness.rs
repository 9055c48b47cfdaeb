//! Dashboard readiness polling

use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can report whether a dependency is up
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self) -> bool;
}

/// Probe that treats a 2xx from `GET {base}/api/profiles` as ready
pub struct HttpReadinessProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpReadinessProbe {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| SupervisorError::Supervisor(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}/api/profiles", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn is_ready(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Readiness probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// Poll `probe` every `poll` until it is ready, `max_wait` passes or `token` is cancelled.
///
/// Returns whether the probe reported ready. Callers proceed either way.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    poll: Duration,
    max_wait: Duration,
    token: &CancellationToken,
) -> bool {
    let deadline = Instant::now() + max_wait;
    loop {
        if probe.is_ready().await {
            info!("Dashboard is ready");
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            warn!("Dashboard not ready after {:?}; continuing anyway", max_wait);
            return false;
        }
        let nap = poll.min(deadline - now);
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(nap) => {}
        }
    }
}
