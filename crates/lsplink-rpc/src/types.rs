//! Core data structures for the session layer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the byte channel to the subprocess is realized.
///
/// Chosen once at construction; the matching readiness-poller strategy
/// follows from it and is never switched mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Anonymous pipe pair attached to the child's stdio.
    Pipe,
    /// Loopback TCP socketpair emulating a duplex pipe.
    Socket,
}

impl TransportKind {
    /// The native choice for the current platform: pipes where stream-level
    /// readiness primitives exist, emulated sockets elsewhere.
    pub fn preferred() -> Self {
        if cfg!(unix) {
            Self::Pipe
        } else {
            Self::Socket
        }
    }
}

/// Configuration for one supervised language server.
///
/// Passed explicitly to [`ServerSupervisor::start`]; there is no ambient
/// process-wide configuration.
///
/// [`ServerSupervisor::start`]: crate::process::supervisor::ServerSupervisor::start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the server executable. Its parent directory becomes the
    /// child's working directory.
    pub executable: PathBuf,
    /// Command line arguments.
    pub args: Vec<String>,
    /// Where the child's stderr goes; `None` means the null device.
    pub log_path: Option<PathBuf>,
    /// Byte-channel flavor.
    pub transport: TransportKind,
    /// Timeout applied to requests whose caller passes none.
    pub default_timeout_ms: u64,
    /// Bound on the initialize handshake; a timeout here is tolerated.
    pub initialize_timeout_ms: u64,
    /// Error-budget ceiling for protocol/transport/application errors.
    pub max_errors: u32,
    /// Separate, larger ceiling for request timeouts.
    pub max_timeouts: u32,
    /// How long to wait after each termination escalation step.
    pub shutdown_grace_ms: u64,
}

impl ServerConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            log_path: None,
            transport: TransportKind::preferred(),
            default_timeout_ms: 1000,
            initialize_timeout_ms: 5000,
            max_errors: 100,
            max_timeouts: 5000,
            shutdown_grace_ms: 2000,
        }
    }
}

/// Lifecycle of one supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Transport is up, initialize handshake in flight.
    Starting,
    /// Handshake done, serving requests.
    Running,
    /// Shutdown/exit handshake in flight.
    ShuttingDown,
    /// Session stopped; the subprocess may still need `cleanup`.
    Stopped,
}

/// Zero-based position in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u64,
    pub character: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// One textual replacement produced by a formatting request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    #[serde(rename = "newText")]
    pub new_text: String,
}

/// One diagnostic published by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    #[serde(default)]
    pub severity: Option<i64>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
    #[serde(default)]
    pub source: Option<String>,
    pub message: String,
}
