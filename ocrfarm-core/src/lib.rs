//! # ocrfarm-core
//!
//! Shared building blocks for orchestrating a farm of OCR worker processes:
//! - Validated profile names and the on-disk layout derived from them
//! - The durable runtime state store shared with the dashboard and the
//!   rate-limit detector
//! - The remote host registry with strict connection parameter validation
//! - The worker environment contract (job options, proxy settings)
//! - Layered configuration, a clock abstraction and host resource sampling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ocrfarm_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = FarmConfig::load()?;
//!     let store = SqliteRuntimeStateStore::open(&config.store.db_path)?;
//!
//!     for state in store.list().await? {
//!         println!("{} paused={}", state.profile, state.is_paused);
//!     }
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod hosts;
pub mod profile;
pub mod proxy;
pub mod resource;
pub mod state;
pub mod worker_env;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{
        ConductorConfig, FarmConfig, PathsConfig, SchedulerConfig, StoreConfig, SupervisorConfig,
    };
    pub use crate::error::{FarmError, Result};
    pub use crate::hosts::{FileHostRegistry, HostRegistry, RemoteHost, StaticHostRegistry};
    pub use crate::profile::{ProfileName, ProfilePaths};
    pub use crate::proxy::{ProxySettings, load_proxy_config};
    pub use crate::resource::{ResourceMonitor, StaticResourceMonitor, SysinfoResourceMonitor};
    pub use crate::state::{
        InMemoryRuntimeStateStore, RuntimeState, RuntimeStateStore, SqliteRuntimeStateStore,
    };
    pub use crate::worker_env::{ExecutionMode, WorkerEnv, WorkerOptions};
}
