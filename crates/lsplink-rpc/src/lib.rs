//! Bidirectional JSON-RPC session layer for external language servers
//!
//! This crate drives a language-server subprocess over a byte-stream
//! channel: `Content-Length`-framed JSON-RPC on anonymous pipes (or an
//! emulated loopback socketpair), a dedicated I/O worker thread, a
//! correlation session with per-request timeouts, and a supervisor that
//! owns the handshakes, the error budget, and process teardown.
//!
//! # Architecture
//!
//! ```text
//! caller thread                        i/o worker thread
//! ─────────────                        ─────────────────
//! ServerSupervisor                      readiness poller
//!   └─ RpcSession   ── outbound ──▶     frame encoder ──▶ child stdin
//!        pending      ◀─ inbound ──     frame decoder ◀── child stdout
//!        table
//! ```
//!
//! The two mpsc queues are the only shared state; the pending table, id
//! counter, and completion cache live on the caller's side. A fatal
//! protocol or transport error stops the worker permanently; the session
//! is never restarted in place.
//!
//! # Module Organization
//!
//! - `client`: JSON-RPC message types, frame codec, correlation session
//! - `transport`: subprocess spawning, endpoints, pollers, the I/O worker
//! - `process`: supervisor, handshakes, error budget
//! - `types`: configuration and boundary payload types
//! - `error`: error taxonomy

pub mod client;
pub mod error;
pub mod process;
pub mod transport;
pub mod types;

pub use client::codec::{encode_frame, FrameDecoder};
pub use client::protocol::{
    methods, path_from_uri, uri_from_path, Notification, Request, RequestId, Response,
    ResponseError,
};
pub use client::session::{RpcSession, SessionObserver, DEFAULT_REQUEST_TIMEOUT_MS};
pub use error::{LspLinkError, Result};
pub use process::health::ErrorBudget;
pub use process::supervisor::{completion_items, LspObserver, ServerSupervisor};
pub use transport::poller::{poller_for, ReadinessPoller};
pub use transport::{launch, loopback_pair, ReadEndpoint, SpawnedServer, WriteEndpoint};
pub use types::{
    Diagnostic, Position, Range, ServerConfig, ServerState, TextEdit, TransportKind,
};
