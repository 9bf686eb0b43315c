use thiserror::Error;

/// Errors surfaced by public API calls on [`crate::Manager`].
///
/// Mirrors the status taxonomy a connection endpoint can report, minus the
/// success case (`Ok`) which callers see as `Result::Ok(..)` instead — see
/// [`crate::Status`] for the version of this taxonomy used inside callback
/// events, which does need an explicit success variant.
#[derive(Debug, Error)]
pub enum SockCmError {
    #[error("operation already in progress")]
    InProgress,

    #[error("endpoint is not connected yet")]
    Busy,

    #[error("endpoint is not connected")]
    NotConnected,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection rejected by peer")]
    Rejected,

    #[error("private data does not fit in the manager's configured cap")]
    BufferTooSmall,

    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("destination unreachable")]
    Unreachable,
}

pub type Result<T> = std::result::Result<T, SockCmError>;
