//! Outbound half of a bidirectional channel.
//!
//! A [`Channel`] issues commands from its caller set, keeps the table of
//! calls waiting for an answer, and owns the channel lifecycle:
//!
//! ```text
//!  Unbound ──connection_made──▶ Active ──connection_lost──▶ Lost
//! ```
//!
//! The inbound half (decoding and dispatch) lives in [`crate::endpoint`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::codec;
use crate::descriptor::{Arguments, Command, CommandDescriptor, CommandSet};
use crate::error::{CallError, ProtocolError};
use crate::message::{Message, Token};

/// Write side of a byte stream. The channel holds a reference to one while
/// active; it never owns the underlying pipe.
pub trait Transport: Send + Sync + 'static {
    fn write(&self, bytes: Vec<u8>) -> Result<(), ProtocolError>;
}

impl Transport for mpsc::UnboundedSender<Vec<u8>> {
    fn write(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.send(bytes).map_err(|_| ProtocolError::NotConnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unbound,
    Active,
    Lost,
}

struct Link {
    state: ChannelState,
    transport: Option<Arc<dyn Transport>>,
}

type Completion = oneshot::Sender<Result<(), CallError>>;

struct Inner {
    callers: CommandSet,
    link: Mutex<Link>,
    pending: DashMap<Token, Completion>,
    next_token: AtomicU64,
    call_timeout: Option<Duration>,
}

impl Inner {
    fn link(&self) -> MutexGuard<'_, Link> {
        // a poisoned lock only means a writer panicked mid-call; the link
        // itself is always left consistent
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cheaply cloneable handle to one channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state())
            .field("pending", &self.pending_calls())
            .finish()
    }
}

impl Channel {
    /// A channel that may issue the commands in `callers`.
    pub fn new(callers: CommandSet) -> Self {
        Self::with_call_timeout(callers, None)
    }

    /// Like [`Channel::new`], failing calls that get no answer within
    /// `timeout` with [`CallError::TimedOut`].
    pub fn with_call_timeout(callers: CommandSet, timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                callers,
                link: Mutex::new(Link {
                    state: ChannelState::Unbound,
                    transport: None,
                }),
                pending: DashMap::new(),
                next_token: AtomicU64::new(1),
                call_timeout: timeout,
            }),
        }
    }

    pub fn callers(&self) -> CommandSet {
        self.inner.callers
    }

    pub fn state(&self) -> ChannelState {
        self.inner.link().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Active
    }

    /// Calls still waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Binds the channel to a live transport.
    pub fn connection_made(&self, transport: Arc<dyn Transport>) {
        let mut link = self.inner.link();
        match link.state {
            ChannelState::Unbound => {
                link.state = ChannelState::Active;
                link.transport = Some(transport);
                debug!("channel connected");
            }
            ChannelState::Active => warn!("connection_made on an already connected channel, ignored"),
            ChannelState::Lost => warn!("connection_made after connection_lost, ignored"),
        }
    }

    /// Severs the transport and fails every pending call with
    /// [`CallError::Disconnected`]. Returns how many calls were failed.
    /// Calling it again is a no-op.
    pub fn connection_lost(&self, reason: &str) -> usize {
        let mut link = self.inner.link();
        if link.state == ChannelState::Lost {
            return 0;
        }
        link.state = ChannelState::Lost;
        link.transport = None;

        let tokens: Vec<Token> = self.inner.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for token in tokens {
            if let Some((_, done)) = self.inner.pending.remove(&token) {
                let _ = done.send(Err(CallError::Disconnected));
                failed += 1;
            }
        }
        drop(link);

        debug!(reason, failed, "channel lost");
        failed
    }

    /// Sends `descriptor(arguments)` with a fresh ask token and returns a
    /// [`Reply`] completed by the matching answer.
    pub fn issue(
        &self,
        descriptor: &'static CommandDescriptor,
        arguments: Arguments,
    ) -> Result<Reply, ProtocolError> {
        self.check_callable(descriptor, &arguments)?;
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let bytes = codec::encode(
            &Message::Request {
                command: descriptor,
                ask: Some(token),
                arguments,
            }
            .to_frame(),
        )?;

        let (done, rx) = oneshot::channel();
        {
            // registered under the link lock so a concurrent connection_lost
            // cannot miss it
            let link = self.inner.link();
            let transport = match (&link.state, &link.transport) {
                (ChannelState::Active, Some(t)) => t.clone(),
                _ => return Err(ProtocolError::NotConnected),
            };
            self.inner.pending.insert(token, done);
            if let Err(e) = transport.write(bytes) {
                self.inner.pending.remove(&token);
                return Err(e);
            }
        }
        trace!(command = descriptor.name, token, "issued call");

        if let Some(timeout) = self.inner.call_timeout {
            self.arm_timeout(token, timeout);
        }
        Ok(Reply { token, rx })
    }

    /// Sends `descriptor(arguments)` without an ask token. No answer is
    /// expected and nothing is registered.
    pub fn notify(
        &self,
        descriptor: &'static CommandDescriptor,
        arguments: Arguments,
    ) -> Result<(), ProtocolError> {
        self.check_callable(descriptor, &arguments)?;
        let bytes = codec::encode(
            &Message::Request {
                command: descriptor,
                ask: None,
                arguments,
            }
            .to_frame(),
        )?;
        self.write(bytes)?;
        trace!(command = descriptor.name, "sent notification");
        Ok(())
    }

    /// Typed [`Channel::issue`].
    pub fn call<C: Command>(&self, command: C) -> Result<Reply, ProtocolError> {
        self.issue(C::DESCRIPTOR, command.into_arguments())
    }

    /// Typed [`Channel::notify`].
    pub fn send<C: Command>(&self, command: C) -> Result<(), ProtocolError> {
        self.notify(C::DESCRIPTOR, command.into_arguments())
    }

    /// Completes and removes the pending call for `token`.
    pub(crate) fn resolve(&self, token: Token, outcome: Result<(), CallError>) -> Result<(), ProtocolError> {
        match self.inner.pending.remove(&token) {
            Some((_, done)) => {
                trace!(token, ok = outcome.is_ok(), "call resolved");
                let _ = done.send(outcome);
                Ok(())
            }
            None => Err(ProtocolError::UnknownCorrelation(format!("{token:x}"))),
        }
    }

    /// Writes an answer or error frame.
    pub(crate) fn reply(&self, message: &Message) -> Result<(), ProtocolError> {
        self.write(codec::encode(&message.to_frame())?)
    }

    fn write(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let transport = {
            let link = self.inner.link();
            match (&link.state, &link.transport) {
                (ChannelState::Active, Some(t)) => t.clone(),
                _ => return Err(ProtocolError::NotConnected),
            }
        };
        transport.write(bytes)
    }

    fn check_callable(
        &self,
        descriptor: &'static CommandDescriptor,
        arguments: &Arguments,
    ) -> Result<(), ProtocolError> {
        if !self.inner.callers.contains(descriptor) {
            return Err(ProtocolError::NotACaller(descriptor.name.to_owned()));
        }
        descriptor.check(arguments)
    }

    fn arm_timeout(&self, token: Token, timeout: Duration) {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            debug!(token, "no runtime, call timeout not armed");
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        rt.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            if let Some((_, done)) = inner.pending.remove(&token) {
                warn!(token, ?timeout, "call timed out");
                let _ = done.send(Err(CallError::TimedOut));
            }
        });
    }
}

/// Completion handle for an issued call. Resolves exactly once: `Ok(())`
/// when the remote acknowledged, or a [`CallError`].
#[derive(Debug)]
pub struct Reply {
    token: Token,
    rx: oneshot::Receiver<Result<(), CallError>>,
}

impl Reply {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Non-blocking poll. `None` while the call is still pending.
    pub fn try_outcome(&mut self) -> Option<Result<(), CallError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CallError::Disconnected)),
        }
    }
}

impl Future for Reply {
    type Output = Result<(), CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(CallError::Disconnected)))
    }
}
