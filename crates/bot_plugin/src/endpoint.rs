//! Inbound half of a bidirectional channel: decoding and dispatch.
//!
//! A [`Router`] maps each responder command to a typed handler. It is built
//! once, and an [`Endpoint`] refuses to start with a router that leaves a
//! responder command unhandled.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::channel::{Channel, ChannelState, Transport};
use crate::codec::{Frame, FrameDecoder};
use crate::descriptor::{Arguments, Command, CommandDescriptor, CommandSet};
use crate::error::{CallError, ErrorCode, ProtocolError};
use crate::message::{self, Message, Token};
use crate::vocabulary::{self, VOCABULARY};

type Handler<S> = Box<dyn Fn(&mut S, &Channel, Arguments) -> anyhow::Result<()> + Send + Sync>;

/// Command name → handler table for one endpoint's responder set.
pub struct Router<S> {
    responders: CommandSet,
    handlers: HashMap<&'static str, Handler<S>>,
    stray: Vec<&'static str>,
}

impl<S> fmt::Debug for Router<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut routed: Vec<_> = self.handlers.keys().collect();
        routed.sort();
        f.debug_struct("Router").field("routed", &routed).finish()
    }
}

impl<S: 'static> Router<S> {
    pub fn new(responders: CommandSet) -> Self {
        Self {
            responders,
            handlers: HashMap::new(),
            stray: Vec::new(),
        }
    }

    /// Routes command `C` to `handler`. Arguments reach the handler already
    /// decoded into `C`.
    pub fn on<C>(mut self, handler: impl Fn(&mut S, &Channel, C) -> anyhow::Result<()> + Send + Sync + 'static) -> Self
    where
        C: Command + 'static,
    {
        let descriptor = C::DESCRIPTOR;
        if !self.responders.contains(descriptor) {
            self.stray.push(descriptor.name);
        }
        self.handlers.insert(
            descriptor.name,
            Box::new(move |state, channel, args| handler(state, channel, C::from_arguments(args)?)),
        );
        self
    }

    pub fn responders(&self) -> CommandSet {
        self.responders
    }

    /// Every responder has a handler and no handler sits outside the set.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !self.stray.is_empty() {
            return Err(ProtocolError::VocabularyMismatch(format!(
                "handlers for commands outside the responder set: {}",
                self.stray.join(", ")
            )));
        }
        let missing: Vec<_> = self
            .responders
            .iter()
            .filter(|d| !self.handlers.contains_key(d.name))
            .map(|d| d.handler_name())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::MissingHandler(missing.join(", ")))
        }
    }
}

/// Receiving side of a channel: owns the decoder, the router and the state
/// handlers operate on.
pub struct Endpoint<S> {
    channel: Channel,
    router: Router<S>,
    state: S,
    decoder: FrameDecoder,
}

impl<S> fmt::Debug for Endpoint<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("channel", &self.channel)
            .field("router", &self.router)
            .field("buffered", &self.decoder.buffered())
            .finish_non_exhaustive()
    }
}

impl<S: 'static> Endpoint<S> {
    /// Fails if the router is incomplete, or if the channel's caller set and
    /// the router's responder set do not split the shared vocabulary.
    pub fn new(channel: Channel, router: Router<S>, state: S) -> Result<Self, ProtocolError> {
        router.validate()?;
        vocabulary::check_complementary(&channel.callers(), &router.responders())?;
        Ok(Self {
            channel,
            router,
            state,
            decoder: FrameDecoder::new(),
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn connection_made(&mut self, transport: Arc<dyn Transport>) {
        self.channel.connection_made(transport);
    }

    /// Feeds raw bytes and dispatches every completed frame in wire order.
    /// Protocol anomalies are logged and skipped; a malformed stream tears
    /// the channel down and is returned.
    pub fn data_received(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.decoder.push(bytes);
        while self.channel.state() == ChannelState::Active {
            match self.decoder.next_frame() {
                Some(Ok(frame)) => {
                    if let Err(e) = self.frame_received(frame) {
                        warn!(error = %e, "inbound frame dropped");
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "stream corrupted, dropping connection");
                    self.channel.connection_lost("malformed frame");
                    return Err(e);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Handles one decoded frame. Errors are reported to the caller but
    /// leave the channel usable.
    pub fn frame_received(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        if self.channel.state() != ChannelState::Active {
            debug!("frame after teardown ignored");
            return Ok(());
        }
        match Message::from_frame(&frame, &VOCABULARY) {
            Ok(Message::Answer { token }) => self.channel.resolve(token, Ok(())),
            Ok(Message::Error {
                token,
                code,
                description,
            }) => self
                .channel
                .resolve(token, Err(CallError::Remote { code, description })),
            Ok(Message::Request {
                command,
                ask,
                arguments,
            }) => self.dispatch(command, ask, arguments),
            Err(e) => {
                if let Some(token) = message::ask_token(&frame) {
                    let code = match e {
                        ProtocolError::UnknownCommand(_) => ErrorCode::UnknownCommand,
                        _ => ErrorCode::BadArguments,
                    };
                    self.send_error(token, code, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Declares end of input and loses the connection. A frame cut short by
    /// EOF is malformed.
    pub fn end_of_stream(&mut self) -> Result<(), ProtocolError> {
        let result = self.finish_input();
        self.channel.connection_lost("end of stream");
        result
    }

    /// Checks that input ended on a frame boundary, leaving the channel
    /// lifecycle to the caller.
    pub fn finish_input(&mut self) -> Result<(), ProtocolError> {
        let result = self.decoder.finish();
        if let Err(e) = &result {
            error!(error = %e, "stream ended mid-frame");
        }
        result
    }

    pub fn connection_lost(&mut self, reason: &str) -> usize {
        self.channel.connection_lost(reason)
    }

    fn dispatch(
        &mut self,
        command: &'static CommandDescriptor,
        ask: Option<Token>,
        arguments: Arguments,
    ) -> Result<(), ProtocolError> {
        if !self.router.responders.contains(command) {
            let err = ProtocolError::UnknownCommand(command.name.to_owned());
            if let Some(token) = ask {
                self.send_error(token, ErrorCode::UnknownCommand, &err.to_string());
            }
            return Err(err);
        }
        let Some(handler) = self.router.handlers.get(command.name) else {
            let err = ProtocolError::MissingHandler(command.handler_name());
            error!(command = command.name, "responder without handler");
            if let Some(token) = ask {
                self.send_error(token, ErrorCode::Unhandled, &err.to_string());
            }
            return Err(err);
        };

        trace!(command = command.name, ?ask, "dispatching");
        match handler(&mut self.state, &self.channel, arguments) {
            Ok(()) => {
                if let Some(token) = ask {
                    if let Err(e) = self.channel.reply(&Message::Answer { token }) {
                        warn!(error = %e, token, "could not acknowledge call");
                    }
                }
            }
            Err(e) => {
                error!(command = command.name, error = %e, "handler failed");
                if let Some(token) = ask {
                    self.send_error(token, ErrorCode::Unhandled, &e.to_string());
                }
            }
        }
        Ok(())
    }

    fn send_error(&self, token: Token, code: ErrorCode, description: &str) {
        if let Err(e) = self.channel.reply(&Message::error(token, code, description)) {
            warn!(error = %e, token, "could not send error answer");
        }
    }
}
