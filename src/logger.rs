use std::fs;
use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LogConfig;

/// Name of the host's rolling log file inside `LogConfig::dir`.
pub const LOG_FILE: &str = "botcore.log";

static INSTALLED: Mutex<bool> = Mutex::new(false);

/// Installs the global subscriber: human-readable output on stderr and, when
/// `config.dir` is set, a daily rolling plain-text file. Only the first
/// successful call installs anything.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_new(&config.level)?;

    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if *installed {
        return Ok(());
    }

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);
    let file_layer = match &config.dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE);
            Some(fmt::layer().with_ansi(false).with_writer(appender))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    *installed = true;
    Ok(())
}
