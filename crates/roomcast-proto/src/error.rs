//! Protocol error types.
//!
//! Every variant here is a "malformed frame" from the relay's point of view:
//! the offending unit is dropped and counted, the peer stays connected, and
//! the ingress loop moves on to the next unit.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before a declared field length was satisfied.
    #[error("truncated frame while reading {field}")]
    Truncated {
        /// Field being read when the buffer ran out.
        field: &'static str,
    },

    /// The protocol-version byte did not match the supported version.
    #[error("unsupported protocol version {0} (expected {expected})", expected = crate::PROTOCOL_VERSION)]
    UnsupportedVersion(u8),

    /// The leading message-type byte is not a known relay message.
    ///
    /// Legacy pre-v3 transform IDs (1 and 2) land here deliberately.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// A length-prefixed string field exceeded its cap.
    #[error("{field} length {len} exceeds cap {max}")]
    StringTooLong {
        /// Field that exceeded its cap.
        field: &'static str,
        /// Observed length in bytes.
        len: usize,
        /// Maximum allowed length in bytes.
        max: usize,
    },

    /// A string field that must be non-empty was empty.
    #[error("{field} must not be empty")]
    EmptyString {
        /// Field that was empty.
        field: &'static str,
    },

    /// String bytes were not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 {
        /// Field holding the invalid bytes.
        field: &'static str,
    },

    /// The virtual-transform count exceeded the per-pose cap.
    #[error("virtual transform count {0} exceeds cap {cap}", cap = crate::pose::MAX_VIRTUALS)]
    TooManyVirtuals(u8),

    /// Bytes were left over after a complete message was decoded.
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    /// A multipart unit did not carry the expected number of frames.
    #[error("expected {expected} frames per unit, got {got}")]
    FrameCount {
        /// Frames the unit must carry.
        expected: usize,
        /// Frames the unit declared.
        got: usize,
    },

    /// A single frame's length prefix exceeded the transport cap.
    #[error("frame of {size} bytes exceeds cap {max}")]
    FrameTooLarge {
        /// Declared frame size in bytes.
        size: usize,
        /// Maximum allowed frame size in bytes.
        max: usize,
    },

    /// The room-identifier frame was empty or longer than 255 bytes.
    #[error("invalid room id length {0}")]
    InvalidRoomId(usize),
}
