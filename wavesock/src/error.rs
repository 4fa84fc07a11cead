//! Error types for the protocol engine.

use thiserror::Error;

/// Top-level error type returned by the public API.
#[derive(Error, Debug)]
pub enum WsError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection closed")]
    ConnectionClosed,
}

/// A peer violated RFC 6455 framing rules. Any of these terminates the
/// connection immediately.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown opcode 0x{0:x}")]
    UnknownOpcode(u8),
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("client-to-server frame is not masked")]
    UnmaskedFrame,
    #[error("server-to-client frame is masked")]
    MaskedFrame,
    #[error("control frame is fragmented")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLong(u64),
    #[error("data frame interleaved with an unfinished message")]
    InterleavedMessage,
    #[error("continuation frame with no message in progress")]
    StrayContinuation,
    #[error("frame payload of {length} bytes exceeds the limit of {limit}")]
    FrameTooLarge { length: u64, limit: u64 },
}
