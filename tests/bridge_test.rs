// Drives the real echo_plugin binary through the process bridge.
use std::sync::Arc;
use std::time::Duration;

use bot_plugin::{BridgeOptions, CallError, PluginProcess};
use botcore::{BotAction, RelayBot};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const ECHO: &str = env!("CARGO_BIN_EXE_echo_plugin");

async fn spawn_echo(logs: &TempDir) -> (PluginProcess, Arc<RelayBot>, UnboundedReceiver<BotAction>) {
    let (bot, actions) = RelayBot::new();
    let options = BridgeOptions {
        stop_grace: Duration::from_secs(10),
        env: vec![
            ("BOT_LOG_DIR".to_string(), logs.path().display().to_string()),
            ("BOT_LOG_LEVEL".to_string(), "debug".to_string()),
        ],
        ..BridgeOptions::default()
    };
    let process = PluginProcess::spawn(ECHO, "echo", bot.clone(), options)
        .await
        .expect("echo_plugin spawns");
    (process, bot, actions)
}

async fn next_action(actions: &mut UnboundedReceiver<BotAction>) -> BotAction {
    timeout(Duration::from_secs(5), actions.recv())
        .await
        .expect("plugin did not act in time")
        .expect("action stream ended")
}

async fn settle<T>(fut: impl std::future::Future<Output = T>) -> T {
    timeout(Duration::from_secs(5), fut).await.expect("timed out")
}

#[tokio::test]
async fn joined_channel_is_greeted() {
    let logs = TempDir::new().unwrap();
    let (process, bot, mut actions) = spawn_echo(&logs).await;
    let plugin = process.handle().clone();
    assert_eq!(bot.len(), 1);

    settle(plugin.started("{}").unwrap()).await.unwrap();
    settle(plugin.joined(3, "#ops").unwrap()).await.unwrap();

    assert_eq!(
        next_action(&mut actions).await,
        BotAction::Say {
            plugin: "echo".into(),
            server_id: 3,
            channel: "#ops".into(),
            message: "hi".into(),
        }
    );

    settle(process.request_stop()).await;
    assert!(bot.is_empty());
    assert!(logs.path().join("echo.log").exists());
}

#[tokio::test]
async fn commands_and_invites_round_trip() {
    let logs = TempDir::new().unwrap();
    let (process, _bot, mut actions) = spawn_echo(&logs).await;
    let plugin = process.handle().clone();

    settle(plugin.started(r#"{"greeting":"hello"}"#).unwrap()).await.unwrap();
    let ping = plugin.privmsg(1, "alice", "#lab", "!ping").unwrap();
    let echo = plugin.privmsg(1, "alice", "#lab", "!echo  spaced out").unwrap();
    let chat = plugin.privmsg(1, "alice", "#lab", "just talking").unwrap();
    let invite = plugin.invited(2, "#new").unwrap();

    // answers may complete in any order relative to each other
    settle(invite).await.unwrap();
    settle(chat).await.unwrap();
    settle(echo).await.unwrap();
    settle(ping).await.unwrap();

    let said: Vec<_> = [
        next_action(&mut actions).await,
        next_action(&mut actions).await,
    ]
    .into_iter()
    .map(|a| match a {
        BotAction::Say { message, .. } => message,
        other => panic!("expected a say, got {other:?}"),
    })
    .collect();
    assert_eq!(said, ["pong", " spaced out"]);
    assert!(matches!(
        next_action(&mut actions).await,
        BotAction::Join { server_id: 2, ref channel, .. } if channel == "#new"
    ));

    settle(process.request_stop()).await;
}

#[tokio::test]
async fn bad_settings_come_back_as_an_error_answer() {
    let logs = TempDir::new().unwrap();
    let (process, _bot, _actions) = spawn_echo(&logs).await;

    let outcome = settle(process.handle().started("not json").unwrap()).await;
    match outcome {
        Err(CallError::Remote { code, .. }) => assert_eq!(code, "UNHANDLED"),
        other => panic!("expected a remote error, got {other:?}"),
    }

    // the plugin is still serving
    settle(process.handle().update().unwrap()).await.unwrap();
    settle(process.request_stop()).await;
}

#[tokio::test]
async fn stop_closes_stdin_and_plugin_exits_on_its_own() {
    let logs = TempDir::new().unwrap();
    let (process, bot, _actions) = spawn_echo(&logs).await;
    settle(process.handle().update().unwrap()).await.unwrap();

    // grace is 10s; a plugin that drains and exits finishes well before
    let started = tokio::time::Instant::now();
    settle(process.request_stop()).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(process.is_closed());
    assert!(!process.handle().is_connected());
    assert!(bot.is_empty());

    settle(process.request_stop()).await;
}
