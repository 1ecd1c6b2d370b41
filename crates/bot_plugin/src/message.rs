//! Typed view of a [`Frame`]: a request, an answer, or an error answer.
//!
//! Requests carry `_command` plus one key per declared argument, and
//! optionally `_ask` when the caller wants an acknowledgement. Answers carry
//! `_answer` (or `_error`) with the same token.

use crate::codec::Frame;
use crate::descriptor::{Arguments, CommandDescriptor, CommandSet, Value};
use crate::error::{ErrorCode, ProtocolError};

pub const COMMAND: &str = "_command";
pub const ASK: &str = "_ask";
pub const ANSWER: &str = "_answer";
pub const ERROR: &str = "_error";
pub const ERROR_CODE: &str = "_error_code";
pub const ERROR_DESCRIPTION: &str = "_error_description";

/// Correlation token linking a request to its answer.
pub type Token = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request {
        command: &'static CommandDescriptor,
        ask: Option<Token>,
        arguments: Arguments,
    },
    Answer {
        token: Token,
    },
    Error {
        token: Token,
        code: String,
        description: String,
    },
}

impl Message {
    pub fn error(token: Token, code: ErrorCode, description: impl Into<String>) -> Self {
        Message::Error {
            token,
            code: code.to_string(),
            description: description.into(),
        }
    }

    /// Builds the wire frame. Request arguments must already match the
    /// descriptor; see [`CommandDescriptor::check`].
    pub fn to_frame(&self) -> Frame {
        match self {
            Message::Request {
                command,
                ask,
                arguments,
            } => {
                let mut frame = Frame::new().with(COMMAND, command.name);
                if let Some(token) = ask {
                    frame.insert(ASK, encode_token(*token));
                }
                for ((field, _), value) in command.arguments.iter().zip(arguments.values()) {
                    frame.insert(*field, value.to_bytes());
                }
                frame
            }
            Message::Answer { token } => Frame::new().with(ANSWER, encode_token(*token)),
            Message::Error {
                token,
                code,
                description,
            } => Frame::new()
                .with(ERROR, encode_token(*token))
                .with(ERROR_CODE, code.as_str())
                .with(ERROR_DESCRIPTION, description.as_str()),
        }
    }

    /// Interprets `frame` against the shared `vocabulary`. Request arguments
    /// are decoded with the types of the named descriptor.
    pub fn from_frame(frame: &Frame, vocabulary: &CommandSet) -> Result<Self, ProtocolError> {
        if let Some(raw) = frame.get(ANSWER) {
            return Ok(Message::Answer {
                token: decode_token(raw)?,
            });
        }
        if let Some(raw) = frame.get(ERROR) {
            return Ok(Message::Error {
                token: decode_token(raw)?,
                code: frame.get_str(ERROR_CODE).unwrap_or_default().to_owned(),
                description: frame.get_str(ERROR_DESCRIPTION).unwrap_or_default().to_owned(),
            });
        }

        let Some(name) = frame.get_str(COMMAND) else {
            return Err(ProtocolError::UnknownCommand("(frame without _command)".into()));
        };
        let command = vocabulary
            .get(name)
            .ok_or_else(|| ProtocolError::UnknownCommand(name.to_owned()))?;

        let ask = match frame.get(ASK) {
            Some(raw) => Some(
                decode_token(raw)
                    .map_err(|_| command.mismatch("unreadable _ask token".into()))?,
            ),
            None => None,
        };

        let mut arguments = Arguments::new();
        for (field, ty) in command.arguments {
            let raw = frame
                .get(field)
                .ok_or_else(|| command.mismatch(format!("missing `{field}`")))?;
            let value = Value::from_bytes(*ty, raw)
                .map_err(|reason| command.mismatch(format!("`{field}`: {reason}")))?;
            arguments.push(value);
        }

        Ok(Message::Request {
            command,
            ask,
            arguments,
        })
    }
}

/// The `_ask` token of a request frame, if it has a readable one.
pub fn ask_token(frame: &Frame) -> Option<Token> {
    frame.get(ASK).and_then(|raw| decode_token(raw).ok())
}

fn encode_token(token: Token) -> String {
    format!("{token:x}")
}

fn decode_token(raw: &[u8]) -> Result<Token, ProtocolError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| Token::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            ProtocolError::UnknownCorrelation(String::from_utf8_lossy(raw).into_owned())
        })
}
