//! Discovers plugin executables, runs them through the process bridge and
//! addresses them as a group.
//!
//! A plugin named `feeds` lives at `<plugin_dir>/feeds/feeds`, with optional
//! settings in `<plugin_dir>/feeds/settings.json`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use bot_plugin::vocabulary::Update;
use bot_plugin::{PluginHandle, PluginProcess, Reply};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::bot::{BotAction, RelayBot};
use crate::config::HostConfig;

pub struct PluginManager {
    config: HostConfig,
    bot: Arc<RelayBot>,
    processes: Arc<DashMap<String, Arc<PluginProcess>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PluginManager {
    pub fn new(config: HostConfig) -> (Self, mpsc::UnboundedReceiver<BotAction>) {
        let (bot, actions) = RelayBot::new();
        (
            Self {
                config,
                bot,
                processes: Arc::new(DashMap::new()),
                ticker: Mutex::new(None),
            },
            actions,
        )
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn bot(&self) -> &Arc<RelayBot> {
        &self.bot
    }

    /// Plugins found under the plugin directory, sorted by name. Entries
    /// without a matching executable are skipped.
    pub fn discover(&self) -> anyhow::Result<Vec<(String, PathBuf)>> {
        let dir = &self.config.plugin_dir;
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading plugin directory {}", dir.display()))?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %entry.path().display(), "skipping plugin directory with a non-UTF-8 name");
                continue;
            };
            let exe = entry.path().join(&name);
            if is_executable(&exe) {
                found.push((name, exe));
            } else {
                debug!(plugin = %name, "no executable, skipped");
            }
        }
        found.sort();
        Ok(found)
    }

    /// Spawns every discovered plugin. Plugins that fail to start are logged
    /// and skipped; returns how many are running.
    pub async fn start_all(&self) -> anyhow::Result<usize> {
        for (name, exe) in self.discover()? {
            if let Err(e) = self.load(&name, &exe).await {
                error!(plugin = %name, error = %e, "plugin not started");
            }
        }
        Ok(self.processes.len())
    }

    /// Spawns one plugin and sends it `Started` with its settings.
    pub async fn load(&self, name: &str, exe: &Path) -> anyhow::Result<PluginHandle> {
        if self.processes.contains_key(name) {
            anyhow::bail!("plugin `{name}` is already running");
        }
        let settings = self.config.plugin_settings(name)?;
        let process = PluginProcess::spawn(
            exe,
            name,
            self.bot.clone(),
            self.config.bridge_options(name),
        )
        .await?;
        let process = Arc::new(process);
        let handle = process.handle().clone();
        self.processes.insert(name.to_string(), process.clone());

        // forget the plugin once it ends, unless it has been replaced
        let processes = self.processes.clone();
        let id = handle.id();
        let key = name.to_string();
        tokio::spawn(async move {
            process.closed().await;
            processes.remove_if(&key, |_, p| p.handle().id() == id);
            debug!(plugin = %key, "plugin forgotten");
        });

        watch_reply(name, "started", handle.started(settings)?);
        Ok(handle)
    }

    pub fn plugin(&self, name: &str) -> Option<PluginHandle> {
        self.processes.get(name).map(|p| p.handle().clone())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.processes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Sends `Update` to every live plugin. Returns how many were reached.
    pub fn tick(&self) -> usize {
        self.for_each_plugin("update", |p| p.send(Update {}).map(|()| None))
    }

    pub fn broadcast_privmsg(&self, server_id: i32, user: &str, channel: &str, message: &str) -> usize {
        self.for_each_plugin("privmsg", |p| p.privmsg(server_id, user, channel, message).map(Some))
    }

    pub fn broadcast_joined(&self, server_id: i32, channel: &str) -> usize {
        self.for_each_plugin("joined", |p| p.joined(server_id, channel).map(Some))
    }

    pub fn broadcast_invited(&self, server_id: i32, channel: &str) -> usize {
        self.for_each_plugin("invited", |p| p.invited(server_id, channel).map(Some))
    }

    /// Starts the periodic `Update` broadcast. Calling it again restarts it.
    pub fn start_ticking(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let period = self.config.tick_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                let reached = manager.tick();
                trace!(reached, "tick");
            }
        });
        let previous = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops plugin `name` and waits for it to end. Returns false if no such
    /// plugin is running.
    pub async fn stop(&self, name: &str) -> bool {
        let Some((_, process)) = self.processes.remove(name) else {
            return false;
        };
        process.request_stop().await;
        true
    }

    /// Stops ticking and every plugin, concurrently.
    pub async fn shutdown(&self) {
        if let Some(ticker) = self.ticker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            ticker.abort();
        }
        let names = self.plugin_names();
        info!(count = names.len(), "stopping plugins");

        let mut stopping = JoinSet::new();
        for name in names {
            if let Some((_, process)) = self.processes.remove(&name) {
                stopping.spawn(async move { process.request_stop().await });
            }
        }
        while let Some(res) = stopping.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "plugin stop task failed");
            }
        }
    }

    fn for_each_plugin(
        &self,
        what: &'static str,
        send: impl Fn(&PluginHandle) -> Result<Option<Reply>, bot_plugin::ProtocolError>,
    ) -> usize {
        let handles: Vec<_> = self.processes.iter().map(|e| e.handle().clone()).collect();
        let mut reached = 0;
        for handle in handles {
            match send(&handle) {
                Ok(reply) => {
                    reached += 1;
                    if let Some(reply) = reply {
                        watch_reply(handle.name(), what, reply);
                    }
                }
                Err(e) => debug!(plugin = handle.name(), what, error = %e, "plugin not reached"),
            }
        }
        reached
    }
}

/// Logs the outcome of an asked call once it completes.
fn watch_reply(plugin: &str, what: &'static str, reply: Reply) {
    let plugin = plugin.to_string();
    tokio::spawn(async move {
        match reply.await {
            Ok(()) => trace!(plugin = %plugin, what, "acknowledged"),
            Err(e) => warn!(plugin = %plugin, what, error = %e, "call failed"),
        }
    });
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
