//! The closed set of ways a sender connection can end, each mapped to a
//! distinct exit code by the caller that owns the connection's task.

use postgres_backend::QueryError;

#[derive(thiserror::Error, Debug)]
pub enum SenderError {
    /// The peer sent something the handshake or streaming loop did not
    /// expect: an unrecognized command, a malformed feedback message, a
    /// `START_REPLICATION` before `IDENTIFY_SYSTEM` established context.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer closed its side of the connection, or the connection was
    /// reset. Not an error condition worth logging loudly.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The requested start LSN falls in a WAL segment this primary has
    /// already recycled or removed.
    #[error("requested start position has already been removed: {0}")]
    SegmentGone(utils::lsn::Lsn),

    /// A filesystem or socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The shared slot table was already full when this connection tried
    /// to register.
    #[error("no free slots in the wal sender table")]
    TooManySenders,

    /// `wal_level` on this primary is not high enough for streaming
    /// replication.
    #[error("wal_level is insufficient for replication")]
    WrongWalLevel,

    /// The primary is itself still in crash recovery and cannot yet source
    /// WAL for a standby.
    #[error("primary is still in recovery")]
    StillInRecovery,

    /// The slot table's owning supervisor task is gone; nothing can
    /// register or be woken any more.
    #[error("wal sender supervisor is no longer running")]
    SupervisorDead,

    /// A flush-pointer read or a send of already-flushed data failed in a
    /// way that indicates disk-level corruption or truncation.
    #[error("flush pointer read failed: {0}")]
    FlushFailure(String),
}

impl From<QueryError> for SenderError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Disconnected => SenderError::PeerClosed,
            QueryError::Io(e) => SenderError::Io(e),
            QueryError::Protocol(e) => SenderError::ProtocolViolation(e.to_string()),
            QueryError::Other(e) => SenderError::ProtocolViolation(e.to_string()),
        }
    }
}

/// The exit-code table from the sender's lifecycle contract: 0 for a clean
/// exit, including a fatal protocol/file error after it has been reported,
/// 1 only when the supervisor that owns the slot table is gone, and 2
/// reserved exclusively for an emergency `QUIT` (handled directly in
/// `signals.rs`, never through this function).
pub fn exit_code(err: &SenderError) -> i32 {
    match err {
        SenderError::SupervisorDead => 1,
        SenderError::PeerClosed
        | SenderError::ProtocolViolation(_)
        | SenderError::SegmentGone(_)
        | SenderError::Io(_)
        | SenderError::TooManySenders
        | SenderError::WrongWalLevel
        | SenderError::StillInRecovery
        | SenderError::FlushFailure(_) => 0,
    }
}
