//! Host resource monitoring used to gate worker launches

use crate::error::{FarmError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sysinfo::System;

/// Trait for resource monitoring
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    /// Get memory usage percentage (0.0-100.0)
    async fn get_memory_usage_percent(&self) -> Result<f64>;

    /// Get the 1-minute load average
    async fn get_load_average_1m(&self) -> Result<f64>;
}

/// Resource monitor backed by `sysinfo`.
///
/// Refreshes read `/proc`, so they run on the blocking pool.
pub struct SysinfoResourceMonitor {
    system: Arc<Mutex<System>>,
}

impl SysinfoResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SysinfoResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn sample_memory_percent(system: &Mutex<System>) -> Result<f64> {
    let mut system = system
        .lock()
        .map_err(|e| FarmError::Other(format!("resource monitor poisoned: {}", e)))?;
    system.refresh_memory();

    let total = system.total_memory();
    if total == 0 {
        return Ok(0.0);
    }
    let used = total.saturating_sub(system.available_memory());
    Ok(used as f64 / total as f64 * 100.0)
}

#[async_trait]
impl ResourceMonitor for SysinfoResourceMonitor {
    async fn get_memory_usage_percent(&self) -> Result<f64> {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || sample_memory_percent(&system))
            .await
            .map_err(|e| FarmError::Other(format!("memory sampling task failed: {}", e)))?
    }

    async fn get_load_average_1m(&self) -> Result<f64> {
        tokio::task::spawn_blocking(|| System::load_average().one)
            .await
            .map_err(|e| FarmError::Other(format!("load sampling task failed: {}", e)))
    }
}

/// Fixed readings, for tests and for hosts where sampling is unwanted
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticResourceMonitor {
    pub memory_percent: f64,
    pub load_1m: f64,
}

impl StaticResourceMonitor {
    pub fn new(memory_percent: f64, load_1m: f64) -> Self {
        Self {
            memory_percent,
            load_1m,
        }
    }
}

#[async_trait]
impl ResourceMonitor for StaticResourceMonitor {
    async fn get_memory_usage_percent(&self) -> Result<f64> {
        Ok(self.memory_percent)
    }

    async fn get_load_average_1m(&self) -> Result<f64> {
        Ok(self.load_1m)
    }
}
