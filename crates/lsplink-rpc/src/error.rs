//! Error types for the lsplink session layer.

use thiserror::Error;

/// Errors surfaced by transport, session, and supervisor operations.
///
/// `Protocol` and `Transport` are fatal to the session: once either occurs
/// the worker has stopped and every later operation reports `PeerDown`.
/// `Timeout` and `Server` are local to a single call and feed the error
/// budget instead.
#[derive(Debug, Error)]
pub enum LspLinkError {
    /// Malformed framing or an unparsable JSON body.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The channel reported closure or a read/write failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// No matching response arrived within the caller's window.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A well-formed response carrying an error field.
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    /// The session has been permanently disabled by a fatal error.
    #[error("language server is down")]
    PeerDown,

    /// The session was already stopped by the caller.
    #[error("session already stopped")]
    Stopped,

    /// The server subprocess could not be started.
    #[error("failed to spawn language server: {0}")]
    Spawn(#[source] std::io::Error),

    /// The subprocess survived graceful and forced termination.
    #[error("language server did not exit: {0}")]
    Shutdown(String),
}

impl LspLinkError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub(crate) fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LspLinkError>;
