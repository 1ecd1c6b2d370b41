pub mod bot;
pub mod config;
pub mod logger;
pub mod manager;

pub use bot::{BotAction, RelayBot};
pub use config::{ConfigError, HostConfig, LogConfig};
pub use manager::PluginManager;
