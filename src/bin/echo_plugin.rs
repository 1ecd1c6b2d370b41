//! Reference plugin: answers `!ping`, repeats `!echo <text>`, joins channels
//! it is invited to and greets channels the bot joins.

use bot_plugin::plugin_runtime::{run, Host, Plugin};
use bot_plugin::vocabulary::Privmsg;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EchoSettings {
    greeting: String,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            greeting: "hi".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct EchoPlugin {
    settings: EchoSettings,
    ticks: u64,
}

impl Plugin for EchoPlugin {
    fn name(&self) -> &str {
        "echo"
    }

    fn started(&mut self, _host: &Host, settings: String) -> anyhow::Result<()> {
        self.settings = serde_json::from_str(&settings)?;
        info!(greeting = %self.settings.greeting, "echo started");
        Ok(())
    }

    fn update(&mut self, _host: &Host) -> anyhow::Result<()> {
        self.ticks += 1;
        debug!(ticks = self.ticks, "tick");
        Ok(())
    }

    fn privmsg(&mut self, host: &Host, msg: Privmsg) -> anyhow::Result<()> {
        let text = msg.message.trim();
        if text == "!ping" {
            host.say(msg.server_id, msg.channel, "pong")?;
        } else if let Some(rest) = text.strip_prefix("!echo ") {
            host.say(msg.server_id, msg.channel, rest)?;
        }
        Ok(())
    }

    fn joined(&mut self, host: &Host, server_id: i32, channel: String) -> anyhow::Result<()> {
        host.say(server_id, channel, self.settings.greeting.as_str())?;
        Ok(())
    }

    fn invited(&mut self, host: &Host, server_id: i32, channel: String) -> anyhow::Result<()> {
        info!(server_id, channel = %channel, "invited");
        host.join(server_id, channel)?;
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    run(EchoPlugin::default()).await
}
