use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

mod address;
mod codec;
mod command;
mod flags;
mod negotiate;
mod parser;
mod payload;
mod timeout;

pub use address::*;
pub use codec::*;
pub use command::*;
pub use flags::*;
pub use negotiate::*;
pub use parser::*;
pub use payload::*;
pub use timeout::*;

/// Highest protocol version this client speaks.
pub const MILTER_VERSION: u32 = 6;

/// Version number reserved for the retired first-generation protocol.
pub const OBSOLETE_VERSION: u32 = 1;

/// Default upper bound on a single frame payload.
pub const MAX_CHUNK_SIZE: usize = 65535;

#[derive(Debug, Error, Diagnostic)]
pub enum MilterError {
    #[error("IO error")]
    #[diagnostic(code(milter::io_error))]
    Io(#[from] std::io::Error),

    #[error("could not connect to {address}: {reason}")]
    #[diagnostic(code(milter::connect_failure))]
    ConnectFailure { address: String, reason: String },

    #[error("{0} timeout expired")]
    #[diagnostic(code(milter::timeout))]
    Timeout(TimeoutClass),

    #[error("payload of {size} bytes exceeds the {limit} byte chunk limit")]
    #[diagnostic(code(milter::frame_too_large))]
    FrameTooLarge { size: usize, limit: usize },

    #[error("invalid frame length {0}")]
    #[diagnostic(code(milter::invalid_length))]
    InvalidLength(u32),

    #[error("protocol violation: {0}")]
    #[diagnostic(code(milter::protocol_violation))]
    ProtocolViolation(String),

    #[error("negotiation failed: {0}")]
    #[diagnostic(code(milter::negotiation_failure))]
    Negotiation(#[from] NegotiationError),

    #[error("refusing unsafe socket {path}: {reason}")]
    #[diagnostic(code(milter::unsafe_socket))]
    UnsafeSocket { path: String, reason: String },

    #[error("malformed '{command}' payload: {reason}")]
    #[diagnostic(code(milter::malformed_payload))]
    MalformedPayload { command: char, reason: String },

    #[error("Parse error: {message}")]
    #[diagnostic(code(milter::parse_error))]
    ParseError {
        message: String,
        #[label("This bit here")]
        span: SourceSpan,
    },
}

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("filter speaks protocol version {version}, client supports up to {max}")]
    #[diagnostic(code(milter::version_incompatible))]
    VersionIncompatible { version: u32, max: u32 },

    #[error("filter {kind} flags {requested:#010x} are not a subset of {supported:#010x}")]
    #[diagnostic(code(milter::capability_mismatch))]
    CapabilityMismatch {
        kind: &'static str,
        requested: u32,
        supported: u32,
    },

    #[error("expected an option negotiation reply, got '{0}'")]
    #[diagnostic(code(milter::unexpected_command))]
    UnexpectedCommand(char),

    #[error("negotiation payload is {0} bytes, need 12")]
    #[diagnostic(code(milter::short_payload))]
    ShortPayload(usize),
}

impl MilterError {
    pub(crate) fn malformed(command: u8, reason: impl Into<String>) -> Self {
        MilterError::MalformedPayload {
            command: command as char,
            reason: reason.into(),
        }
    }

    pub(crate) fn parse(message: impl Into<String>, input: &str) -> Self {
        MilterError::ParseError {
            message: message.into(),
            span: (0, input.len()).into(),
        }
    }
}
