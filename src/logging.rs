//! Log initialization.
//!
//! With `--debug`, logs go to ~/.config/unimail/debug.log at debug level for
//! this crate; otherwise warnings and errors go to stderr. `RUST_LOG`
//! overrides the filter either way.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config;

const LOG_FILE: &str = "debug.log";

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("unimail=debug,info")
        } else {
            EnvFilter::new("warn")
        }
    })
}

/// Installs the global subscriber. Call once at startup.
pub fn init(debug: bool) -> Result<()> {
    if debug {
        let dir = config::ensure_config_dir()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .context("Failed to open debug log")?;

        // Separator so consecutive sessions are easy to tell apart
        writeln!(
            file,
            "\n========== Session started at {} ==========",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )
        .context("Failed to write debug log")?;

        tracing_subscriber::fmt()
            .with_env_filter(filter(true))
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter(false))
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))?;
    }

    Ok(())
}
