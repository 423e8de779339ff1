//! Error types for the STREAM core protocol.
//!
//! Two taxonomies live here. [`ErrorCode`] is the on-wire close code carried
//! by `ConnectionClose` and `StreamClose` frames. The `*Error` enums are the
//! Rust-side errors surfaced by the codec and the connection machinery;
//! classification helpers on both drive the retry and close policy.

use std::borrow::Cow;
use thiserror::Error;

pub use ilp_stream_crypto::CryptoError;

/// On-wire error codes for connection and stream closure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Normal close
    NoError = 0x01,
    /// Unrecoverable endpoint failure
    InternalError = 0x02,
    /// Endpoint temporarily over capacity
    ServerBusy = 0x03,
    /// A peer exceeded an advertised flow-control limit
    FlowControlError = 0x04,
    /// A stream id violated parity or window rules
    StreamIdError = 0x05,
    /// A frame arrived for a stream in the wrong state
    StreamStateError = 0x06,
    /// Data arrived past a declared final offset
    FinalOffsetError = 0x07,
    /// A frame could not be decoded
    FrameFormatError = 0x08,
    /// The peer broke a protocol invariant
    ProtocolViolation = 0x09,
    /// Application-level close
    ApplicationError = 0x0a,
}

impl ErrorCode {
    /// Wire value of the code.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True when the code closes the whole connection rather than a stream.
    #[must_use]
    pub fn is_fatal_for_connection(self) -> bool {
        matches!(
            self,
            Self::InternalError
                | Self::FlowControlError
                | Self::StreamIdError
                | Self::FrameFormatError
                | Self::ProtocolViolation
        )
    }

    /// True when the condition may clear on its own.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::ServerBusy)
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = PacketError;

    fn try_from(value: u8) -> std::result::Result<Self, PacketError> {
        match value {
            0x01 => Ok(Self::NoError),
            0x02 => Ok(Self::InternalError),
            0x03 => Ok(Self::ServerBusy),
            0x04 => Ok(Self::FlowControlError),
            0x05 => Ok(Self::StreamIdError),
            0x06 => Ok(Self::StreamStateError),
            0x07 => Ok(Self::FinalOffsetError),
            0x08 => Ok(Self::FrameFormatError),
            0x09 => Ok(Self::ProtocolViolation),
            0x0a => Ok(Self::ApplicationError),
            other => Err(PacketError::InvalidErrorCode(other)),
        }
    }
}

/// Packet and frame decode errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Input ended before a field was complete
    #[error("unexpected end of packet")]
    UnexpectedEof,

    /// Variable-length integer with an empty or oversized magnitude
    #[error("invalid var-uint length: {0}")]
    VarUintLength(u8),

    /// Unsupported OER length determinant
    #[error("invalid length determinant: 0x{0:02X}")]
    LengthDeterminant(u8),

    /// Version byte was not 1
    #[error("unsupported packet version: {0}")]
    UnsupportedVersion(u8),

    /// Packet type byte was not Prepare/Fulfill/Reject
    #[error("invalid ILP packet type: {0}")]
    InvalidPacketType(u8),

    /// Close frame carried an unknown error code
    #[error("invalid error code: 0x{0:02X}")]
    InvalidErrorCode(u8),

    /// A string field was not valid UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Timestamp field did not parse as an interledger timestamp
    #[error("invalid timestamp")]
    InvalidTimestamp,

    /// Envelope decryption failed
    #[error("packet decryption failed")]
    Decrypt(#[from] CryptoError),
}

/// Receipt codec errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptError {
    /// Receipt blob was not exactly 58 bytes
    #[error("invalid receipt length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Version byte was not 1
    #[error("unsupported receipt version: {0}")]
    UnsupportedVersion(u8),

    /// The 58-byte layout carries the stream id as a single byte
    #[error("stream id {0} does not fit the one-byte receipt field")]
    StreamIdTooLarge(u64),
}

/// Plugin transport errors
#[derive(Debug, Error, Clone)]
pub enum PluginError {
    /// Plugin is not connected
    #[error("plugin not connected")]
    NotConnected,

    /// A data handler is already registered
    #[error("a data handler is already registered")]
    HandlerAlreadyRegistered,

    /// No data handler is registered to take the packet
    #[error("no data handler registered")]
    NoHandler,

    /// Sending over the underlying link failed
    #[error("plugin send failed: {0}")]
    Send(Cow<'static, str>),
}

impl PluginError {
    /// Create a send error with static context (zero allocation)
    #[must_use]
    pub const fn send(context: &'static str) -> Self {
        PluginError::Send(Cow::Borrowed(context))
    }
}

/// Connection-level errors surfaced to the application
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Connection establishment failed
    #[error("Error connecting: {0}")]
    Connect(String),

    /// Invalid connection tag supplied to the server
    #[error("connectionTag can only include ASCII characters a-z, A-Z, 0-9, \"_\", \"-\", and \"~\"")]
    InvalidConnectionTag,

    /// The connection was closed
    #[error("connection closed ({code:?}): {message}")]
    Closed {
        /// Close code
        code: ErrorCode,
        /// Close message (may be empty)
        message: String,
    },

    /// A stream was closed abnormally
    #[error("stream error ({code:?}): {message}")]
    Stream {
        /// Close code
        code: ErrorCode,
        /// Close message (may be empty)
        message: String,
    },

    /// The remote rejected a packet with a final ILP code
    #[error("packet rejected with final code {code}: {message}")]
    Rejected {
        /// Three-character ILP code
        code: String,
        /// Reject message
        message: String,
    },

    /// Retry budget exhausted without a fulfill
    #[error("send retries exhausted")]
    RetriesExhausted,

    /// Packet codec failure
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Plugin failure
    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
}

impl ConnectionError {
    /// True when the error is transient and the operation may be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Closed { code, .. } | Self::Stream { code, .. } => code.is_transient(),
            Self::Plugin(_) => true,
            _ => false,
        }
    }
}

/// Result type for connection operations
pub type Result<T> = std::result::Result<T, ConnectionError>;
