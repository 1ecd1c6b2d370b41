//! Host configuration, read from the environment (optionally seeded from an
//! env file).

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs, io};

use bot_plugin::BridgeOptions;
use thiserror::Error;
use tracing::{debug, info};

pub const PLUGIN_DIR_ENV: &str = "BOT_PLUGIN_DIR";
pub const LOG_LEVEL_ENV: &str = "BOT_LOG_LEVEL";
pub const LOG_DIR_ENV: &str = "BOT_LOG_DIR";
pub const TICK_INTERVAL_ENV: &str = "BOT_TICK_INTERVAL_MS";
pub const STOP_GRACE_ENV: &str = "BOT_STOP_GRACE_MS";
pub const CALL_TIMEOUT_ENV: &str = "BOT_CALL_TIMEOUT_MS";
pub const PLUGIN_SETTINGS_ENV: &str = "BOT_PLUGIN_SETTINGS";

/// File inside a plugin's directory that overrides the global settings.
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("could not load env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("settings in {path} are not valid JSON: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `botcore=debug,bot_plugin=trace`.
    pub level: String,
    /// Also write a daily rolling log file here.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub plugin_dir: PathBuf,
    pub log: LogConfig,
    /// Period of the `Update` broadcast.
    pub tick_interval: Duration,
    pub stop_grace: Duration,
    pub call_timeout: Option<Duration>,
    /// JSON text handed to plugins in `Started`.
    pub settings: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            log: LogConfig::default(),
            tick_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            call_timeout: None,
            settings: "{}".to_string(),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads `path` into the process environment (variables already set win)
    /// and then reads the configuration from it. A missing file is not an
    /// error.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            dotenvy::from_path(path).map_err(|source| ConfigError::EnvFile {
                path: path.to_path_buf(),
                source,
            })?;
            info!("Loaded env from {}", path.display());
        } else {
            debug!("no env file at {}", path.display());
        }
        Self::from_env()
    }

    /// Builds the configuration from `lookup`, falling back to defaults for
    /// unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(dir) = lookup(PLUGIN_DIR_ENV) {
            config.plugin_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            config.log.level = level;
        }
        config.log.dir = lookup(LOG_DIR_ENV).filter(|d| !d.is_empty()).map(PathBuf::from);
        if let Some(raw) = lookup(TICK_INTERVAL_ENV) {
            config.tick_interval = millis(TICK_INTERVAL_ENV, &raw)?;
            if config.tick_interval.is_zero() {
                return Err(ConfigError::Invalid {
                    var: TICK_INTERVAL_ENV,
                    value: raw,
                    expected: "a positive number of milliseconds",
                });
            }
        }
        if let Some(raw) = lookup(STOP_GRACE_ENV) {
            config.stop_grace = millis(STOP_GRACE_ENV, &raw)?;
        }
        if let Some(raw) = lookup(CALL_TIMEOUT_ENV) {
            // 0 disables the timeout
            config.call_timeout = Some(millis(CALL_TIMEOUT_ENV, &raw)?).filter(|d| !d.is_zero());
        }
        if let Some(settings) = lookup(PLUGIN_SETTINGS_ENV) {
            if serde_json::from_str::<serde_json::Value>(&settings).is_err() {
                return Err(ConfigError::Invalid {
                    var: PLUGIN_SETTINGS_ENV,
                    value: settings,
                    expected: "a JSON document",
                });
            }
            config.settings = settings;
        }
        Ok(config)
    }

    /// Directory holding plugin `name`.
    pub fn plugin_path(&self, name: &str) -> PathBuf {
        self.plugin_dir.join(name)
    }

    /// Settings for plugin `name`: its own `settings.json` if present,
    /// otherwise the global settings.
    pub fn plugin_settings(&self, name: &str) -> Result<String, ConfigError> {
        let path = self.plugin_path(name).join(SETTINGS_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(self.settings.clone()),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        serde_json::from_str::<serde_json::Value>(&text)
            .map_err(|source| ConfigError::Settings {
                path: path.clone(),
                source,
            })?;
        Ok(text)
    }

    /// Bridge options for plugin `name`. Plugins log next to the host when a
    /// log directory is set, otherwise into their own directory.
    pub fn bridge_options(&self, name: &str) -> BridgeOptions {
        let log_dir = self.log.dir.clone().unwrap_or_else(|| self.plugin_path(name));
        BridgeOptions {
            stop_grace: self.stop_grace,
            call_timeout: self.call_timeout,
            env: vec![
                (LOG_DIR_ENV.to_string(), log_dir.display().to_string()),
                (LOG_LEVEL_ENV.to_string(), self.log.level.clone()),
            ],
        }
    }
}

fn millis(var: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::Invalid {
            var,
            value: raw.to_string(),
            expected: "a number of milliseconds",
        })
}
