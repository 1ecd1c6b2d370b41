//! The bot side of the plugin contract: what plugins ask for is relayed to
//! the chat core as [`BotAction`]s, and live plugins are tracked by id.

use std::sync::Arc;

use anyhow::anyhow;
use bot_plugin::vocabulary::{Join, Say};
use bot_plugin::{Bot, PluginHandle};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Something a plugin asked the bot to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotAction {
    Say {
        plugin: String,
        server_id: i32,
        channel: String,
        message: String,
    },
    Join {
        plugin: String,
        server_id: i32,
        channel: String,
    },
}

#[derive(Debug)]
pub struct RelayBot {
    actions: mpsc::UnboundedSender<BotAction>,
    plugins: DashMap<Uuid, PluginHandle>,
}

impl RelayBot {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BotAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                actions: tx,
                plugins: DashMap::new(),
            }),
            rx,
        )
    }

    /// Handles of every plugin that has started and not yet ended, by name.
    pub fn plugins(&self) -> Vec<PluginHandle> {
        let mut all: Vec<_> = self.plugins.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn plugin(&self, name: &str) -> Option<PluginHandle> {
        self.plugins
            .iter()
            .find(|e| e.value().name() == name)
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn relay(&self, action: BotAction) -> anyhow::Result<()> {
        self.actions
            .send(action)
            .map_err(|_| anyhow!("bot core stopped listening"))
    }
}

impl Bot for RelayBot {
    fn plugin_started(&self, plugin: &PluginHandle) {
        info!(plugin = plugin.name(), id = %plugin.id(), "plugin registered");
        self.plugins.insert(plugin.id(), plugin.clone());
    }

    fn plugin_ended(&self, plugin: &PluginHandle) {
        if self.plugins.remove(&plugin.id()).is_some() {
            info!(plugin = plugin.name(), id = %plugin.id(), "plugin unregistered");
        }
    }

    fn say(&self, plugin: &PluginHandle, say: Say) -> anyhow::Result<()> {
        debug!(plugin = plugin.name(), channel = %say.channel, "say");
        self.relay(BotAction::Say {
            plugin: plugin.name().to_string(),
            server_id: say.server_id,
            channel: say.channel,
            message: say.message,
        })
    }

    fn join(&self, plugin: &PluginHandle, join: Join) -> anyhow::Result<()> {
        debug!(plugin = plugin.name(), channel = %join.channel, "join");
        self.relay(BotAction::Join {
            plugin: plugin.name().to_string(),
            server_id: join.server_id,
            channel: join.channel,
        })
    }
}

#[cfg(test)]
mod tests {
    use bot_plugin::vocabulary::PLUGIN_RESPONDERS;
    use bot_plugin::Channel;

    use super::*;

    fn handle(name: &str) -> PluginHandle {
        PluginHandle::new(name, Channel::new(PLUGIN_RESPONDERS))
    }

    #[test]
    fn tracks_plugins_between_start_and_end() {
        let (bot, _rx) = RelayBot::new();
        let feeds = handle("feeds");
        let echo = handle("echo");
        bot.plugin_started(&feeds);
        bot.plugin_started(&echo);

        let names: Vec<_> = bot.plugins().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, ["echo", "feeds"]);
        assert_eq!(bot.plugin("feeds").map(|p| p.id()), Some(feeds.id()));

        bot.plugin_ended(&feeds);
        bot.plugin_ended(&feeds);
        assert_eq!(bot.len(), 1);
        assert!(bot.plugin("feeds").is_none());
    }

    #[test]
    fn relays_say_and_join() {
        let (bot, mut rx) = RelayBot::new();
        let echo = handle("echo");
        bot.say(
            &echo,
            Say {
                server_id: 3,
                channel: "#ops".into(),
                message: "hi".into(),
            },
        )
        .unwrap();
        bot.join(
            &echo,
            Join {
                server_id: 3,
                channel: "#new".into(),
            },
        )
        .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            BotAction::Say {
                plugin: "echo".into(),
                server_id: 3,
                channel: "#ops".into(),
                message: "hi".into(),
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), BotAction::Join { channel, .. } if channel == "#new"));

        drop(rx);
        assert!(bot.say(&echo, Say::default()).is_err());
    }
}
