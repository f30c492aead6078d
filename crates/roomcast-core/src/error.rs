//! Relay state errors.

use thiserror::Error;

/// Errors from room and variable state operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    /// Every client-number in 1..=65535 is bound.
    #[error("no free client numbers in room")]
    RoomFull,

    /// Variable name length outside 1..=64 bytes.
    #[error("variable name length {0} is outside 1..=64")]
    NameLength(usize),

    /// Variable value longer than 1024 bytes.
    #[error("variable value length {0} exceeds 1024")]
    ValueLength(usize),

    /// A scope already holds its 100-name maximum.
    #[error("variable scope is at its 100-name cap")]
    ScopeCapacity,

    /// A client already holds its 20 admin-seeded names.
    #[error("admin-seeded variables are at their 20-name cap")]
    AdminCapacity,
}
