//! Tracing subscriber setup for host applications.
//!
//! Use `RUST_LOG` to control the level (e.g. `RUST_LOG=spendguard_core=debug`).
//! Defaults to `warn`.

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file name prefix; the appender adds the date
const LOG_FILE_PREFIX: &str = "spendguard.log";

#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    /// Daily rolling files in this directory
    Directory(PathBuf),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process when logging to files, or buffered lines are lost.
pub fn init_tracing(target: LogTarget) -> Result<Option<WorkerGuard>> {
    match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(env_filter())
                .try_init()?;
            Ok(None)
        }
        LogTarget::Directory(dir) => {
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(env_filter())
                .try_init()?;
            Ok(Some(guard))
        }
    }
}
