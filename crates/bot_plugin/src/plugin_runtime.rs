//! Plugin side of the bridge: serves the command protocol on stdin/stdout
//! and dispatches host calls to a [`Plugin`] implementation.
//!
//! Usage:
//! ```ignore
//! use bot_plugin::plugin_runtime::{run, Plugin};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     run(MyPlugin::default()).await
//! }
//! ```
//!
//! Stdout carries the protocol. Logging goes to `<BOT_LOG_DIR>/<name>.log`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::channel::{Channel, Reply};
use crate::descriptor::Command;
use crate::endpoint::{Endpoint, Router};
use crate::error::ProtocolError;
use crate::vocabulary::{
    Invited, Join, Joined, Privmsg, Say, Started, Update, HOST_RESPONDERS, PLUGIN_RESPONDERS,
};

/// Directory for the plugin log file; defaults to the working directory.
pub const LOG_DIR_ENV: &str = "BOT_LOG_DIR";
/// Filter directive for the plugin log, e.g. `debug` or `bot_plugin=trace`.
pub const LOG_LEVEL_ENV: &str = "BOT_LOG_LEVEL";

const READ_CHUNK: usize = 4096;

/// Behaviour of a plugin. Every hook defaults to doing nothing.
///
/// Hooks run on the read loop, one at a time, in the order the host sent
/// them. An `Err` is logged and, if the host asked for an answer, reported
/// back as an error answer.
pub trait Plugin: Send + 'static {
    /// Used for the log file name.
    fn name(&self) -> &str;

    fn started(&mut self, _host: &Host, _settings: String) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&mut self, _host: &Host) -> anyhow::Result<()> {
        Ok(())
    }

    fn privmsg(&mut self, _host: &Host, _msg: Privmsg) -> anyhow::Result<()> {
        Ok(())
    }

    fn joined(&mut self, _host: &Host, _server_id: i32, _channel: String) -> anyhow::Result<()> {
        Ok(())
    }

    fn invited(&mut self, _host: &Host, _server_id: i32, _channel: String) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The plugin's view of the host. Cheap to clone; clones share the channel.
#[derive(Debug, Clone)]
pub struct Host {
    channel: Channel,
}

impl Host {
    pub fn new(channel: &Channel) -> Self {
        Self {
            channel: channel.clone(),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn say(
        &self,
        server_id: i32,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.channel.send(Say {
            server_id,
            channel: channel.into(),
            message: message.into(),
        })
    }

    pub fn join(&self, server_id: i32, channel: impl Into<String>) -> Result<(), ProtocolError> {
        self.channel.send(Join {
            server_id,
            channel: channel.into(),
        })
    }

    /// Asking variant: the returned [`Reply`] completes when the host has
    /// handled the command.
    pub fn call<C: Command>(&self, command: C) -> Result<Reply, ProtocolError> {
        self.channel.call(command)
    }
}

pub(crate) fn plugin_router<P: Plugin>() -> Router<P> {
    Router::<P>::new(PLUGIN_RESPONDERS)
        .on::<Started>(|p, ch, cmd| p.started(&Host::new(ch), cmd.settings))
        .on::<Update>(|p, ch, _| p.update(&Host::new(ch)))
        .on::<Privmsg>(|p, ch, msg| p.privmsg(&Host::new(ch), msg))
        .on::<Joined>(|p, ch, cmd| p.joined(&Host::new(ch), cmd.server_id, cmd.channel))
        .on::<Invited>(|p, ch, cmd| p.invited(&Host::new(ch), cmd.server_id, cmd.channel))
}

/// Serves `plugin` over an arbitrary byte stream until `reader` reaches EOF,
/// then hands the plugin back. Output written by hooks is flushed before
/// returning.
pub async fn serve<P, R, W>(plugin: P, mut reader: R, writer: W) -> anyhow::Result<P>
where
    P: Plugin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(async move {
        let mut w = BufWriter::new(writer);
        while let Some(bytes) = rx.recv().await {
            w.write_all(&bytes).await?;
            w.flush().await?;
        }
        w.shutdown().await
    });

    let mut endpoint = Endpoint::new(Channel::new(HOST_RESPONDERS), plugin_router::<P>(), plugin)?;
    endpoint.connection_made(Arc::new(tx));

    let mut buf = vec![0u8; READ_CHUNK];
    let result: anyhow::Result<()> = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break endpoint.end_of_stream().map_err(Into::into),
            Ok(n) => {
                if let Err(e) = endpoint.data_received(&buf[..n]) {
                    break Err(e.into());
                }
            }
            Err(e) => {
                endpoint.connection_lost("input read failed");
                break Err(e.into());
            }
        }
    };

    // the channel dropped its sender on connection loss; the writer drains
    // what is queued and exits
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "output closed early"),
        Err(e) => error!(error = %e, "writer task failed"),
    }
    result.map(|()| endpoint.into_state())
}

/// Entry point for plugin binaries: sets up file logging, then serves the
/// plugin on stdin/stdout until the host closes stdin.
pub async fn run<P: Plugin>(plugin: P) -> anyhow::Result<()> {
    let name = plugin.name().to_owned();
    let dir = std::env::var_os(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    init_logging(&name, &dir);

    info!(plugin = %name, "plugin runtime starting");
    match serve(plugin, io::stdin(), io::stdout()).await {
        Ok(_) => {
            info!(plugin = %name, "host closed the connection");
            Ok(())
        }
        Err(e) => {
            error!(plugin = %name, error = %e, "plugin runtime stopped");
            Err(e)
        }
    }
}

/// Installs a global subscriber writing to `<dir>/<name>.log`. Only the first
/// call has any effect. Never writes to stdout; failures are reported on
/// stderr and leave logging off.
pub fn init_logging(name: &str, dir: &Path) {
    static LOG_INIT: Once = Once::new();
    LOG_INIT.call_once(|| {
        if let Err(e) = install_file_logging(name, dir) {
            eprintln!("{name}: logging setup failed: {e}");
        }
    });
}

fn install_file_logging(name: &str, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .filename_suffix("log")
        .build(dir)?;
    let filter = EnvFilter::try_from_env(LOG_LEVEL_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = Registry::default().with(
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(appender)
            .with_filter(filter),
    );
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
