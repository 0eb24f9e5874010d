use std::io;
use thiserror::Error;

/// Protocol-level error taxonomy. Configuration and binding errors are
/// reported to the caller; wire-level failures are recovered locally and
/// surface only through the cumulative statistics counters.
#[derive(Debug, Error)]
pub enum PgmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport is not bound")]
    NotBound,

    #[error("sequence number outside the current window")]
    NotInWindow,

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("checksum mismatch")]
    ChecksumError,

    #[error("duplicate packet")]
    Duplicate,

    #[error("send exceeds the configured rate limit")]
    RateLimited,

    #[error("operation would block")]
    WouldBlock,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("peer unicast address not yet learned")]
    PeerUnknownNla,

    #[error("apdu discarded: at least one fragment was lost")]
    ApduLost,

    #[error("fatal: {0}")]
    Fatal(&'static str),
}

pub type PgmResult<T> = Result<T, PgmError>;
