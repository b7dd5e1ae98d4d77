//! Error taxonomy (spec §7). Each variant is a distinct failure kind the server crate
//! maps to an HTTP status; library callers match on variants rather than strings.

use crate::session::SessionId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("remote not found: {0}")]
    RemoteNotFound(String),

    #[error("session {0} is not running")]
    SessionNotRunning(SessionId),

    #[error("session {0} is still running")]
    SessionBusy(SessionId),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("remote returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Stable machine-readable kind, useful for logging/metrics without matching on Display text.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::SessionNotFound(_) => "not_found",
            Error::RemoteNotFound(_) => "not_found",
            Error::SessionNotRunning(_) => "session_not_running",
            Error::SessionBusy(_) => "session_busy",
            Error::SpawnFailed(_) => "spawn_failed",
            Error::Io(_) => "io_failed",
            Error::RemoteUnreachable(_) => "remote_unreachable",
            Error::UpstreamStatus { .. } => "upstream_status",
            Error::Cancelled => "cancelled",
        }
    }
}
