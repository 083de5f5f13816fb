//! Logging setup for the daemon using `tracing` + `tracing-subscriber`.
//!
//! The level and destination come from the supervisor config: with a
//! `log_file` the subscriber appends plain lines to that file, otherwise
//! output goes to stderr so it lands in whatever started the daemon.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Context as _;
use tracing_subscriber::fmt;

use crate::jm::config::SupervisorConfig;

/// Initialise the global subscriber. Call once at daemon startup.
pub fn init(cfg: &SupervisorConfig) -> anyhow::Result<()> {
    match &cfg.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            fmt()
                .with_max_level(cfg.log_level)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            fmt()
                .with_max_level(cfg.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
