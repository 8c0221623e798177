//! Error handling for PrintLink
//!
//! Provides error types for the layers of the serial link:
//! - Protocol errors (anomalies in the G-code conversation)
//! - Connection errors (the serial transport)
//!
//! Protocol anomalies are normally logged and absorbed by the queue; they are
//! surfaced as values so that callers and tests can inspect them. A lost
//! conversation is reported as an event, never as an error that ends the
//! process.
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Protocol error type
///
/// Represents transient anomalies in the line-oriented G-code protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An instruction message contained a line break
    #[error("Instruction message contains a newline: {message:?}")]
    EmbeddedNewline {
        /// The offending message.
        message: String,
    },

    /// A confirmation arrived while nothing was in flight
    #[error("Unexpected confirmation, nothing is in flight")]
    UnexpectedConfirmation,

    /// The in-flight instruction refused to be confirmed
    #[error("Instruction {message:?} refused confirmation")]
    RefusedConfirmation {
        /// The message of the refusing instruction.
        message: String,
    },

    /// The firmware asked for more lines than the history holds
    #[error("Impossible resend of {requested} lines, {available} retained")]
    ImpossibleResend {
        /// How many lines the firmware asked for.
        requested: u64,
        /// How many checksummed sends are retained.
        available: usize,
    },

    /// The firmware asked for a line number that was never sent
    #[error("Resend of line {requested} requested, current line is {current}")]
    UnknownResendLine {
        /// The requested line number.
        requested: u64,
        /// The last line number sent.
        current: u64,
    },

    /// A payload exceeded the firmware receive buffer
    #[error("Payload of {size}B exceeds the {limit}B receive buffer")]
    PayloadTooLarge {
        /// The payload size in bytes.
        size: usize,
        /// The configured receive buffer size.
        limit: usize,
    },
}

/// Connection error type
///
/// Represents errors related to the serial transport.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// The transport is not open
    #[error("Port {port} is not open")]
    NotOpen {
        /// The name of the port.
        port: String,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// Baud rate not supported
    #[error("Baud rate {baud} not supported")]
    UnsupportedBaudRate {
        /// The unsupported baud rate.
        baud: u32,
    },

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },
}

/// Main error type for PrintLink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
