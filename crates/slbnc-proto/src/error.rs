//! Error types for the IRC protocol library.

use thiserror::Error;

/// Top-level protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A line could not be parsed as an IRC message.
    #[error("invalid message: {string:?}: {cause}")]
    InvalidMessage {
        /// The offending line.
        string: String,
        /// Why parsing failed.
        cause: MessageParseError,
    },

    /// A line exceeded the permitted length.
    #[error("message too long: {actual} bytes (limit {limit})")]
    MessageTooLong {
        /// Observed line length.
        actual: usize,
        /// Enforced limit.
        limit: usize,
    },
}

/// Errors raised while parsing a single message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MessageParseError {
    /// The input was empty.
    #[error("empty message")]
    EmptyMessage,

    /// The command token was missing or malformed.
    ///
    /// RFC 2812: a command is `1*letter` or `3digit`.
    #[error("invalid command")]
    InvalidCommand,
}
