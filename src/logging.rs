//! Structured logging setup for harness binaries.
//!
//! The library itself only emits `tracing` events; whoever drives it
//! installs a subscriber once at startup.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Environment variable that switches on JSON output regardless of config.
pub const JSON_LOG_ENV: &str = "EPIFUSE_LOG_JSON";

/// Initialise the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `cfg.filter`. Fails if a global
/// subscriber is already installed.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.filter))
        .map_err(|e| anyhow!("Invalid log filter '{}': {e}", cfg.filter))?;

    let json_logging = cfg.json || std::env::var(JSON_LOG_ENV).is_ok();

    let installed = if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .try_init()
    } else {
        fmt().with_env_filter(env_filter).with_target(true).try_init()
    };

    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))
}
