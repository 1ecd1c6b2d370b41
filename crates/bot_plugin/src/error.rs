use std::io;

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Everything that can go wrong while building, sending or receiving a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The arguments do not match the descriptor (arity, names or types).
    #[error("argument mismatch for `{command}`: {reason}")]
    ArgumentMismatch { command: String, reason: String },

    /// Inbound request for a command this endpoint does not respond to.
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    /// Answer frame whose token matches no pending call.
    #[error("no pending call for correlation token `{0}`")]
    UnknownCorrelation(String),

    /// The byte stream cannot be parsed; alignment is lost for good.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Outbound call for a command outside this endpoint's caller set.
    #[error("`{0}` is not in this endpoint's caller set")]
    NotACaller(String),

    /// A declared responder command has no registered handler.
    #[error("no handler registered for responder command(s): {0}")]
    MissingHandler(String),

    /// The channel has no live transport (not yet connected, or lost).
    #[error("channel is not connected")]
    NotConnected,

    /// Caller and responder sets do not partition the shared vocabulary.
    #[error("vocabulary mismatch: {0}")]
    VocabularyMismatch(String),

    /// A key or value exceeds what its 16-bit length prefix can carry.
    #[error("field `{key}` is {len} bytes long (max {max})")]
    FieldTooLong { key: String, len: usize, max: usize },
}

/// Outcome of a call that did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The channel went away before the answer arrived.
    #[error("disconnected before an answer arrived")]
    Disconnected,

    /// The remote side answered with an error frame.
    #[error("remote error {code}: {description}")]
    Remote { code: String, description: String },

    /// No answer within the configured call timeout.
    #[error("no answer within the call timeout")]
    TimedOut,
}

/// Errors surfaced by the host-side process bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn plugin `{plugin}` from {path}: {source}")]
    ProcessSpawnFailure {
        plugin: String,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("plugin `{0}` was spawned without a {1} pipe")]
    MissingPipe(String, &'static str),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Error codes carried in `_error_code` of an error answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownCommand,
    BadArguments,
    Unhandled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_wire_names() {
        assert_eq!(ErrorCode::UnknownCommand.as_ref(), "UNKNOWN_COMMAND");
        assert_eq!(ErrorCode::Unhandled.to_string(), "UNHANDLED");
        let parsed: ErrorCode = "BAD_ARGUMENTS".parse().unwrap();
        assert_eq!(parsed, ErrorCode::BadArguments);
    }
}
