//! Host side of the bridge: runs a plugin executable and speaks the command
//! protocol over its stdin/stdout.
//!
//! The process and the protocol are kept apart. [`PluginProcess`] owns the
//! child and its pipes; the [`Channel`] inside [`PluginHandle`] owns protocol
//! state. Process events are forwarded into the channel and into the
//! [`Bot`] lifecycle hooks.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::channel::{Channel, Reply};
use crate::descriptor::Command;
use crate::endpoint::{Endpoint, Router};
use crate::error::{BridgeError, ProtocolError};
use crate::vocabulary::{
    Invited, Join, Joined, Privmsg, Say, Started, Update, HOST_RESPONDERS, PLUGIN_RESPONDERS,
};

const READ_CHUNK: usize = 4096;

/// What the bot core exposes to its plugins.
///
/// `say` and `join` are invoked synchronously from the plugin's read loop,
/// in the order the plugin sent them.
pub trait Bot: Send + Sync + 'static {
    /// The plugin is up and its channel is connected.
    fn plugin_started(&self, plugin: &PluginHandle);
    /// The plugin is gone. Called once per plugin.
    fn plugin_ended(&self, plugin: &PluginHandle);
    fn say(&self, plugin: &PluginHandle, say: Say) -> anyhow::Result<()>;
    fn join(&self, plugin: &PluginHandle, join: Join) -> anyhow::Result<()>;
}

/// Host-side address of one running plugin.
#[derive(Clone)]
pub struct PluginHandle {
    name: Arc<str>,
    id: Uuid,
    channel: Channel,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.channel.state())
            .finish()
    }
}

impl PluginHandle {
    pub fn new(name: impl Into<Arc<str>>, channel: Channel) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            channel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn started(&self, settings: impl Into<String>) -> Result<Reply, ProtocolError> {
        self.channel.call(Started {
            settings: settings.into(),
        })
    }

    pub fn update(&self) -> Result<Reply, ProtocolError> {
        self.channel.call(Update {})
    }

    pub fn privmsg(
        &self,
        server_id: i32,
        user: impl Into<String>,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Reply, ProtocolError> {
        self.channel.call(Privmsg {
            server_id,
            user: user.into(),
            channel: channel.into(),
            message: message.into(),
        })
    }

    pub fn joined(&self, server_id: i32, channel: impl Into<String>) -> Result<Reply, ProtocolError> {
        self.channel.call(Joined {
            server_id,
            channel: channel.into(),
        })
    }

    pub fn invited(&self, server_id: i32, channel: impl Into<String>) -> Result<Reply, ProtocolError> {
        self.channel.call(Invited {
            server_id,
            channel: channel.into(),
        })
    }

    /// Fire-and-forget variant of the typed calls above.
    pub fn send<C: Command>(&self, command: C) -> Result<(), ProtocolError> {
        self.channel.send(command)
    }
}

pub(crate) struct HostState {
    bot: Arc<dyn Bot>,
    plugin: PluginHandle,
}

pub(crate) fn host_router() -> Router<HostState> {
    Router::<HostState>::new(HOST_RESPONDERS)
        .on::<Say>(|s, _, say| s.bot.say(&s.plugin, say))
        .on::<Join>(|s, _, join| s.bot.join(&s.plugin, join))
}

/// Tunables for one bridged plugin.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// How long a stopping plugin may keep writing before it is killed.
    pub stop_grace: Duration,
    /// Fail calls that get no answer within this long. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Extra environment for the child, on top of the host's own.
    pub env: Vec<(String, String)>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            call_timeout: None,
            env: Vec::new(),
        }
    }
}

/// A running plugin child process.
///
/// Dropping it requests a stop, like [`PluginProcess::request_stop`] without
/// waiting.
pub struct PluginProcess {
    handle: PluginHandle,
    pid: Option<u32>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed: watch::Receiver<bool>,
}

impl fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginProcess")
            .field("handle", &self.handle)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PluginProcess {
    /// Launches `exe`, connects its pipes to a fresh channel and reports the
    /// plugin to `bot` as started. Must be called inside a tokio runtime.
    pub async fn spawn(
        exe: impl AsRef<Path>,
        name: &str,
        bot: Arc<dyn Bot>,
        options: BridgeOptions,
    ) -> Result<Self, BridgeError> {
        let path = exe.as_ref();
        let mut child = TokioCommand::new(path)
            .envs(options.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::ProcessSpawnFailure {
                plugin: name.to_owned(),
                path: path.display().to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::MissingPipe(name.to_owned(), "stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::MissingPipe(name.to_owned(), "stdout"))?;
        let pid = child.id();

        let channel = Channel::with_call_timeout(PLUGIN_RESPONDERS, options.call_timeout);
        let handle = PluginHandle::new(name, channel);
        let state = HostState {
            bot: bot.clone(),
            plugin: handle.clone(),
        };
        let mut endpoint = Endpoint::new(handle.channel.clone(), host_router(), state)?;

        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let close_stdin = Arc::new(Notify::new());
        tokio::spawn(pump_stdin(stdin, rx, close_stdin.clone(), handle.name.clone()));

        endpoint.connection_made(Arc::new(tx));
        info!(plugin = %handle.name, ?pid, path = %path.display(), "plugin started");
        bot.plugin_started(&handle);

        let (stop_tx, stop_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(supervise(Supervisor {
            child,
            stdout,
            endpoint,
            handle: handle.clone(),
            bot,
            close_stdin,
            stop_rx,
            closed_tx,
            stop_grace: options.stop_grace,
        }));

        Ok(Self {
            handle,
            pid,
            stop_tx: Mutex::new(Some(stop_tx)),
            closed: closed_rx,
        })
    }

    pub fn handle(&self) -> &PluginHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once the child is gone and `plugin_ended` has been delivered.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Closes the plugin's stdin, lets it flush its remaining output for up
    /// to the stop grace period, then kills it. Resolves once teardown is
    /// complete. Further calls only wait.
    pub async fn request_stop(&self) {
        let stop = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            info!(plugin = %self.handle.name, "stopping plugin");
            let _ = stop.send(());
        }
        self.closed().await;
    }

    /// Resolves when the plugin has ended, however that happened.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn pump_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    close: Arc<Notify>,
    plugin: Arc<str>,
) {
    loop {
        tokio::select! {
            biased;
            chunk = rx.recv() => {
                let Some(bytes) = chunk else { break };
                trace!(plugin = %plugin, len = bytes.len(), "to plugin");
                if let Err(e) = stdin.write_all(&bytes).await {
                    warn!(plugin = %plugin, error = %e, "write to plugin stdin failed");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!(plugin = %plugin, error = %e, "flush of plugin stdin failed");
                    break;
                }
            }
            _ = close.notified() => break,
        }
    }
    debug!(plugin = %plugin, "plugin stdin closed");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    Eof,
    Malformed,
    Failed,
}

async fn pump_stdout(mut stdout: ChildStdout, mut endpoint: Endpoint<HostState>, plugin: Arc<str>) -> ReadEnd {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                return match endpoint.finish_input() {
                    Ok(()) => ReadEnd::Eof,
                    Err(_) => ReadEnd::Malformed,
                };
            }
            Ok(n) => {
                trace!(plugin = %plugin, len = n, "from plugin");
                if endpoint.data_received(&buf[..n]).is_err() {
                    return ReadEnd::Malformed;
                }
            }
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "read from plugin stdout failed");
                return ReadEnd::Failed;
            }
        }
    }
}

struct Supervisor {
    child: Child,
    stdout: ChildStdout,
    endpoint: Endpoint<HostState>,
    handle: PluginHandle,
    bot: Arc<dyn Bot>,
    close_stdin: Arc<Notify>,
    stop_rx: oneshot::Receiver<()>,
    closed_tx: watch::Sender<bool>,
    stop_grace: Duration,
}

/// Drives one plugin from start to `plugin_ended`. Output is read until EOF;
/// a stop request closes stdin and bounds the remaining read by the grace
/// period. The channel is lost only after the child is reaped.
async fn supervise(s: Supervisor) {
    let Supervisor {
        mut child,
        stdout,
        endpoint,
        handle,
        bot,
        close_stdin,
        mut stop_rx,
        closed_tx,
        stop_grace,
    } = s;
    let name = handle.name.clone();

    let mut reader = tokio::spawn(pump_stdout(stdout, endpoint, name.clone()));
    let mut exited = false;
    let mut stopping = false;
    let mut deadline: Option<Instant> = None;

    let end = loop {
        tokio::select! {
            res = &mut reader => {
                break res.unwrap_or_else(|e| {
                    error!(plugin = %name, error = %e, "plugin reader task failed");
                    ReadEnd::Failed
                });
            }
            status = child.wait(), if !exited => {
                exited = true;
                match status {
                    Ok(status) => info!(plugin = %name, %status, "plugin process exited"),
                    Err(e) => warn!(plugin = %name, error = %e, "waiting on plugin failed"),
                }
            }
            _ = &mut stop_rx, if !stopping => {
                stopping = true;
                close_stdin.notify_one();
                deadline = Some(Instant::now() + stop_grace);
            }
            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                warn!(plugin = %name, ?stop_grace, "plugin kept its output open past the grace period");
                reader.abort();
                // a frame being dispatched finishes before the channel is lost
                let _ = (&mut reader).await;
                break ReadEnd::Failed;
            }
        }
    };

    if !exited {
        if end == ReadEnd::Malformed || deadline.is_some_and(|d| d <= Instant::now()) {
            kill(&mut child, &name).await;
        } else {
            let grace = deadline.map_or(stop_grace, |d| d.saturating_duration_since(Instant::now()));
            match time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => info!(plugin = %name, %status, "plugin process exited"),
                Ok(Err(e)) => warn!(plugin = %name, error = %e, "waiting on plugin failed"),
                Err(_) => {
                    warn!(plugin = %name, "plugin closed its output but did not exit");
                    kill(&mut child, &name).await;
                }
            }
        }
    }

    close_stdin.notify_one();
    let failed = handle.channel.connection_lost(match end {
        ReadEnd::Eof => "plugin closed its output",
        ReadEnd::Malformed => "plugin sent a malformed stream",
        ReadEnd::Failed => "plugin output lost",
    });
    if failed > 0 {
        debug!(plugin = %name, failed, "failed pending calls");
    }
    info!(plugin = %name, "plugin ended");
    bot.plugin_ended(&handle);
    closed_tx.send_replace(true);
}

async fn kill(child: &mut Child, name: &str) {
    match child.kill().await {
        Ok(()) => info!(plugin = %name, "plugin killed"),
        Err(e) => warn!(plugin = %name, error = %e, "failed to kill plugin"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::channel::ChannelState;
    use crate::codec::encode;
    use crate::error::CallError;
    use crate::message::Message;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl Recording {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Bot for Recording {
        fn plugin_started(&self, plugin: &PluginHandle) {
            self.events.lock().unwrap().push(format!("started {}", plugin.name()));
        }
        fn plugin_ended(&self, plugin: &PluginHandle) {
            self.events.lock().unwrap().push(format!("ended {}", plugin.name()));
        }
        fn say(&self, _: &PluginHandle, say: Say) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("say {}", say.message));
            Ok(())
        }
        fn join(&self, _: &PluginHandle, join: Join) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("join {}", join.channel));
            Ok(())
        }
    }

    fn quick() -> BridgeOptions {
        BridgeOptions {
            stop_grace: Duration::from_millis(200),
            ..BridgeOptions::default()
        }
    }

    /// Writes an executable shell script that ignores its stdin.
    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_failure() {
        let bot = Arc::new(Recording::default());
        let err = PluginProcess::spawn("/nonexistent/plugin", "ghost", bot.clone(), quick())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ProcessSpawnFailure { ref plugin, .. } if plugin == "ghost"));
        assert!(bot.events().is_empty());
    }

    #[tokio::test]
    async fn child_exit_ends_plugin_once() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "quiet", "exit 0");
        let bot = Arc::new(Recording::default());
        let p = PluginProcess::spawn(&exe, "quiet", bot.clone(), quick()).await.unwrap();
        time::timeout(Duration::from_secs(5), p.closed()).await.unwrap();

        assert!(p.is_closed());
        assert_eq!(p.handle().channel().state(), ChannelState::Lost);
        assert_eq!(bot.events(), vec!["started quiet", "ended quiet"]);

        p.request_stop().await;
        assert_eq!(bot.events().len(), 2);
    }

    #[tokio::test]
    async fn stop_fails_pending_calls_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "sleepy", "exec sleep 30");
        let bot = Arc::new(Recording::default());
        let p = PluginProcess::spawn(&exe, "sleepy", bot.clone(), quick()).await.unwrap();
        let reply = p.handle().started("{}").unwrap();

        time::timeout(Duration::from_secs(5), p.request_stop()).await.unwrap();
        assert_eq!(reply.await, Err(CallError::Disconnected));
        assert_eq!(p.handle().started("{}").unwrap_err(), ProtocolError::NotConnected);

        time::timeout(Duration::from_secs(1), p.request_stop()).await.unwrap();
        assert_eq!(bot.events(), vec!["started sleepy", "ended sleepy"]);
    }

    /// Writes one encoded `Say` frame next to the scripts.
    fn say_frame(dir: &TempDir, message: &str) -> PathBuf {
        let say = Say {
            server_id: 1,
            channel: "#c".into(),
            message: message.into(),
        };
        let frame = Message::Request {
            command: Say::DESCRIPTOR,
            ask: None,
            arguments: say.into_arguments(),
        }
        .to_frame();
        let path = dir.path().join(format!("{message}.frame"));
        std::fs::write(&path, encode(&frame).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn output_written_after_stdin_closes_is_dispatched_before_end() {
        let dir = TempDir::new().unwrap();
        let frame = say_frame(&dir, "bye");
        let exe = script(&dir, "late", &format!("cat >/dev/null\nsleep 0.3\ncat '{}'", frame.display()));
        let bot = Arc::new(Recording::default());
        let options = BridgeOptions {
            stop_grace: Duration::from_secs(5),
            ..BridgeOptions::default()
        };
        let p = PluginProcess::spawn(&exe, "late", bot.clone(), options).await.unwrap();

        time::timeout(Duration::from_secs(5), p.request_stop()).await.unwrap();
        assert_eq!(bot.events(), vec!["started late", "say bye", "ended late"]);
    }

    #[tokio::test]
    async fn output_after_the_grace_period_is_discarded() {
        let dir = TempDir::new().unwrap();
        let frame = say_frame(&dir, "late");
        let exe = script(&dir, "slow", &format!("cat >/dev/null\nsleep 2\ncat '{}'", frame.display()));
        let bot = Arc::new(Recording::default());
        let p = PluginProcess::spawn(&exe, "slow", bot.clone(), quick()).await.unwrap();

        time::timeout(Duration::from_secs(5), p.request_stop()).await.unwrap();
        assert_eq!(bot.events(), vec!["started slow", "ended slow"]);
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bot.events(), vec!["started slow", "ended slow"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nothing_is_said_after_a_chatty_plugin_ends() {
        let dir = TempDir::new().unwrap();
        let frame = say_frame(&dir, "more");
        let exe = script(
            &dir,
            "chatty",
            &format!("while :; do cat '{}'; sleep 0.01; done", frame.display()),
        );
        let bot = Arc::new(Recording::default());
        let p = PluginProcess::spawn(&exe, "chatty", bot.clone(), quick()).await.unwrap();

        time::timeout(Duration::from_secs(5), async {
            while !bot.events().iter().any(|e| e == "say more") {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        time::timeout(Duration::from_secs(5), p.request_stop()).await.unwrap();
        let events = bot.events();
        assert_eq!(events.last().map(String::as_str), Some("ended chatty"));
        assert_eq!(events.iter().filter(|e| e.starts_with("ended")).count(), 1);

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bot.events(), events);
    }

    #[tokio::test]
    async fn malformed_output_tears_the_plugin_down() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "garbage", "printf '\\377\\377xx'\nexec sleep 30");
        let bot = Arc::new(Recording::default());
        let options = BridgeOptions {
            stop_grace: Duration::from_secs(10),
            ..BridgeOptions::default()
        };
        let p = PluginProcess::spawn(&exe, "garbage", bot.clone(), options).await.unwrap();

        // killed right away, not after the grace period
        time::timeout(Duration::from_secs(3), p.closed()).await.unwrap();
        assert_eq!(bot.events(), vec!["started garbage", "ended garbage"]);
    }
}
