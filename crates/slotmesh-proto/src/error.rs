//! Wire protocol error types.

use thiserror::Error;

/// Result type alias for codec operations.
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors produced while encoding or decoding wire messages.
///
/// A decode error means the message is dropped; it never crosses the
/// decode boundary as anything other than this type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("message truncated: wanted {wanted} more bytes, {remaining} left")]
    Truncated { wanted: usize, remaining: usize },

    #[error("invalid length prefix: {0}")]
    BadLength(i32),

    #[error("{field} is not valid UTF-8")]
    BadUtf8 { field: &'static str },

    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    #[error("open slots cannot be negative: {0}")]
    NegativeSlots(i32),

    #[error("port out of range: {0}")]
    BadPort(i32),

    #[error("unknown reservation target kind: {0}")]
    UnknownTargetKind(u8),

    #[error("user count out of range: {0}")]
    BadUserCount(i32),

    #[error("trailing garbage: {0} bytes past end of message")]
    TrailingBytes(usize),
}
