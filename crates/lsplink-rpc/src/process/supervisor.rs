//! Language-server lifecycle supervision.
//!
//! One supervisor owns one subprocess and one RPC session across their
//! whole life: the initialize/initialized handshake at startup, the
//! error/timeout budget that decides liveness, the shutdown/exit handshake,
//! and escalating termination of a child that will not leave on its own.
//! The supervisor never restarts anything by itself; it reports server-down
//! to the observer and leaves the restart policy to the embedding layer.

use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use lsplink_completion::cache::{kind_code, CompletionItem};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::client::protocol::{methods, uri_from_path, Request, Response};
use crate::client::session::{RpcSession, SessionObserver};
use crate::error::{LspLinkError, Result};
use crate::process::health::ErrorBudget;
use crate::transport;
use crate::types::{Diagnostic, ServerConfig, ServerState, TextEdit};

const ESCALATION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Callbacks the supervisor invokes for server-originated traffic.
pub trait LspObserver {
    /// New diagnostics for a document.
    fn on_diagnostics(&mut self, uri: &str, diagnostics: Vec<Diagnostic>);

    /// A completion response arrived, possibly after its request timed out.
    /// The position identifies which query the items answer.
    fn on_completions(&mut self, uri: &str, line: u64, character: u64, items: Vec<CompletionItem>) {
        let _ = (uri, line, character, items);
    }

    /// A request initiated by the server.
    fn on_server_request(&mut self, method: &str, params: &Value) {
        let _ = (method, params);
    }

    /// The server is gone for good; restarting is the embedder's call.
    fn on_server_down(&mut self);
}

/// Supervises one language-server subprocess and its RPC session.
#[derive(Debug)]
pub struct ServerSupervisor {
    config: ServerConfig,
    child: Child,
    session: RpcSession,
    budget: ErrorBudget,
    capabilities: Value,
    state: ServerState,
    down_reported: bool,
}

impl ServerSupervisor {
    /// Establish the transport, start the I/O worker, and perform the
    /// initialize/initialized handshake.
    ///
    /// A handshake timeout is tolerated: the server gets the benefit of the
    /// doubt and startup proceeds with an unknown capability set.
    pub fn start(config: ServerConfig, observer: &mut dyn LspObserver) -> Result<Self> {
        let spawned = transport::launch(&config)?;
        let session = RpcSession::start(spawned.reader, spawned.writer)?;
        let budget = ErrorBudget::new(config.max_errors, config.max_timeouts);

        let mut supervisor = Self {
            config,
            child: spawned.child,
            session,
            budget,
            capabilities: json!({}),
            state: ServerState::Starting,
            down_reported: false,
        };

        if let Err(err) = supervisor.handshake(observer) {
            warn!(error = %err, "handshake failed, discarding the subprocess");
            supervisor.session.stop();
            let _ = supervisor.child.kill();
            let _ = supervisor.child.wait();
            return Err(err);
        }

        supervisor.state = ServerState::Running;
        Ok(supervisor)
    }

    fn handshake(&mut self, observer: &mut dyn LspObserver) -> Result<()> {
        let root_uri = std::env::current_dir()
            .map(|dir| uri_from_path(&dir))
            .unwrap_or_else(|_| "file:///".to_string());
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "capabilities": {},
            "trace": "off"
        });

        let timeout = Duration::from_millis(self.config.initialize_timeout_ms);
        match self.request(methods::INITIALIZE, params, Some(timeout), observer) {
            Ok(result) => {
                self.capabilities = result.get("capabilities").cloned().unwrap_or(json!({}));
                debug!(capabilities = %self.capabilities, "language server initialized");
            }
            Err(LspLinkError::Timeout { timeout_ms }) => {
                warn!(timeout_ms, "initialize timed out, capabilities unknown");
            }
            Err(err) => return Err(err),
        }

        self.notify(methods::INITIALIZED, json!({}))?;
        info!(pid = self.child.id(), "language server connected");
        Ok(())
    }

    /// True only while the subprocess runs and both budget ceilings hold.
    pub fn is_alive(&mut self) -> bool {
        if self.state != ServerState::Running || self.session.is_peer_down() {
            return false;
        }
        let running = matches!(self.child.try_wait(), Ok(None));
        running && self.budget.within_limits()
    }

    /// Drain queued server traffic and dispatch it to the observer.
    ///
    /// When liveness has been lost, reports server-down (once) instead and
    /// fails with `PeerDown`.
    pub fn pump(&mut self, observer: &mut dyn LspObserver) -> Result<()> {
        if !self.is_alive() {
            self.report_down(observer);
            return Err(LspLinkError::PeerDown);
        }
        let mut dispatch = Dispatch {
            observer,
            down_reported: &mut self.down_reported,
        };
        self.session.drain_and_dispatch(&mut dispatch)
    }

    // Document synchronization notifications.

    pub fn open_document(
        &mut self,
        uri: &str,
        text: &str,
        language_id: &str,
    ) -> Result<()> {
        self.notify(
            methods::DID_OPEN,
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": 1,
                    "text": text
                }
            }),
        )
    }

    /// Full-text synchronization: `text` replaces the whole document.
    pub fn change_document(&mut self, uri: &str, version: i64, text: &str) -> Result<()> {
        self.notify(
            methods::DID_CHANGE,
            json!({
                "textDocument": {"uri": uri, "version": version},
                "contentChanges": [{"text": text}]
            }),
        )
    }

    pub fn save_document(&mut self, uri: &str) -> Result<()> {
        self.notify(methods::DID_SAVE, json!({"textDocument": {"uri": uri}}))
    }

    pub fn close_document(&mut self, uri: &str) -> Result<()> {
        self.notify(methods::DID_CLOSE, json!({"textDocument": {"uri": uri}}))
    }

    // Interactive requests.

    /// Request completions at a zero-based document position.
    pub fn complete_at(
        &mut self,
        uri: &str,
        line: u64,
        character: u64,
        timeout: Option<Duration>,
        observer: &mut dyn LspObserver,
    ) -> Result<Vec<CompletionItem>> {
        let params = json!({
            "textDocument": {"uri": uri},
            "position": {"line": line, "character": character}
        });
        let result = self.request(methods::COMPLETION, params, timeout, observer)?;
        Ok(completion_items(&result))
    }

    pub fn format(&mut self, uri: &str, observer: &mut dyn LspObserver) -> Result<Vec<TextEdit>> {
        let result = self.request(
            methods::FORMATTING,
            json!({"textDocument": {"uri": uri}}),
            None,
            observer,
        )?;
        text_edits(result)
    }

    pub fn range_format(
        &mut self,
        uri: &str,
        start_line: u64,
        start_character: u64,
        end_line: u64,
        end_character: u64,
        observer: &mut dyn LspObserver,
    ) -> Result<Vec<TextEdit>> {
        let params = json!({
            "textDocument": {"uri": uri},
            "range": {
                "start": {"line": start_line, "character": start_character},
                "end": {"line": end_line, "character": end_character}
            }
        });
        let result = self.request(methods::RANGE_FORMATTING, params, None, observer)?;
        text_edits(result)
    }

    pub fn on_type_format(
        &mut self,
        uri: &str,
        line: u64,
        character: u64,
        observer: &mut dyn LspObserver,
    ) -> Result<Vec<TextEdit>> {
        let params = json!({
            "textDocument": {"uri": uri},
            "position": {"line": line, "character": character}
        });
        let result = self.request(methods::ON_TYPE_FORMATTING, params, None, observer)?;
        text_edits(result)
    }

    /// Best-effort shutdown/exit handshake, then stop the session.
    ///
    /// Failures are logged, not propagated: the server may already be gone,
    /// and `cleanup` deals with whatever is left.
    pub fn stop(&mut self) {
        if matches!(self.state, ServerState::Stopped) {
            return;
        }
        self.state = ServerState::ShuttingDown;

        if let Err(err) = self.session.post_request(methods::SHUTDOWN, json!({})) {
            self.budget.record_error();
            warn!(error = %err, "shutdown request not delivered");
        }
        if let Err(err) = self.session.send_notification(methods::EXIT, json!({})) {
            self.budget.record_error();
            warn!(error = %err, "exit notification not delivered");
        }

        self.session.stop();
        self.state = ServerState::Stopped;
    }

    /// Tear the subprocess down, escalating from graceful termination to a
    /// forced kill, and release every handle.
    ///
    /// Consumes the supervisor: transport endpoints and the log sink close
    /// exactly once, on drop, whatever path is taken. Intentional teardown
    /// does not fire the observer's server-down callback.
    pub fn cleanup(mut self) -> Result<()> {
        self.stop();

        let pid = self.child.id();
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);

        if self.wait_child(grace)?.is_some() {
            info!(pid, "language server exited on its own");
            return Ok(());
        }

        debug!(pid, "requesting graceful termination");
        self.terminate_child()?;
        if self.wait_child(grace)?.is_some() {
            info!(pid, "language server terminated gracefully");
            return Ok(());
        }

        warn!(pid, "escalating to forced kill");
        self.child.kill().map_err(LspLinkError::transport)?;
        if self.wait_child(grace)?.is_some() {
            info!(pid, "language server killed");
            return Ok(());
        }

        Err(LspLinkError::Shutdown(format!(
            "pid {pid} survived graceful and forced termination"
        )))
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Capability set announced by the server, empty when unknown.
    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    pub fn errors(&self) -> u32 {
        self.budget.errors()
    }

    pub fn timeouts(&self) -> u32 {
        self.budget.timeouts()
    }

    fn request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        observer: &mut dyn LspObserver,
    ) -> Result<Value> {
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_millis(self.config.default_timeout_ms));
        let mut dispatch = Dispatch {
            observer,
            down_reported: &mut self.down_reported,
        };
        match self
            .session
            .send_request(method, params, Some(timeout), &mut dispatch)
        {
            Ok(result) => Ok(result),
            Err(err @ LspLinkError::Timeout { .. }) => {
                self.budget.record_timeout();
                Err(err)
            }
            Err(err) => {
                self.budget.record_error();
                warn!(method, error = %err, "request failed");
                Err(err)
            }
        }
    }

    fn notify(&mut self, method: &str, params: Value) -> Result<()> {
        match self.session.send_notification(method, params) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.budget.record_error();
                warn!(method, error = %err, "notification failed");
                Err(err)
            }
        }
    }

    fn report_down(&mut self, observer: &mut dyn LspObserver) {
        if !self.down_reported {
            self.down_reported = true;
            warn!(
                errors = self.budget.errors(),
                timeouts = self.budget.timeouts(),
                "language server is down"
            );
            observer.on_server_down();
        }
    }

    fn wait_child(&mut self, grace: Duration) -> Result<Option<std::process::ExitStatus>> {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait().map_err(LspLinkError::transport)? {
                Some(status) => return Ok(Some(status)),
                None if Instant::now() >= deadline => return Ok(None),
                None => thread::sleep(ESCALATION_POLL_INTERVAL),
            }
        }
    }

    #[cfg(unix)]
    fn terminate_child(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM)
            .map_err(LspLinkError::transport)
    }

    #[cfg(not(unix))]
    fn terminate_child(&mut self) -> Result<()> {
        // No graceful signal to send; the forced kill is the only step.
        self.child.kill().map_err(LspLinkError::transport)
    }
}

/// Adapter translating session-level dispatch into the supervisor's
/// observer contract.
struct Dispatch<'a> {
    observer: &'a mut dyn LspObserver,
    down_reported: &'a mut bool,
}

impl SessionObserver for Dispatch<'_> {
    fn on_notification(&mut self, method: &str, params: &Value) {
        if method != methods::PUBLISH_DIAGNOSTICS {
            return;
        }
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return;
        };
        let diagnostics: Vec<Diagnostic> = params
            .get("diagnostics")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        self.observer.on_diagnostics(uri, diagnostics);
    }

    fn on_request(&mut self, method: &str, params: &Value) {
        self.observer.on_server_request(method, params);
    }

    fn on_response(&mut self, request: &Request, response: &Response) {
        if request.method != methods::COMPLETION {
            return;
        }
        let uri = request
            .params
            .pointer("/textDocument/uri")
            .and_then(Value::as_str);
        let line = request.params.pointer("/position/line").and_then(Value::as_u64);
        let character = request
            .params
            .pointer("/position/character")
            .and_then(Value::as_u64);
        if let (Some(uri), Some(line), Some(character)) = (uri, line, character) {
            let items = response
                .result
                .as_ref()
                .map(completion_items)
                .unwrap_or_default();
            self.observer.on_completions(uri, line, character, items);
        }
    }

    fn on_peer_down(&mut self) {
        if !*self.down_reported {
            *self.down_reported = true;
            self.observer.on_server_down();
        }
    }
}

/// Map a completion response onto typed items.
///
/// Accepts both wire shapes: a bare item array and a `CompletionList`-style
/// object with an `items` field. The insertable word falls back
/// `insertText` → `label`, the description `detail` → `label`; items with
/// no usable kind are skipped.
pub fn completion_items(result: &Value) -> Vec<CompletionItem> {
    let empty = Vec::new();
    let raw = result
        .as_array()
        .or_else(|| result.get("items").and_then(Value::as_array))
        .unwrap_or(&empty);

    let mut items = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(kind) = entry.get("kind").and_then(Value::as_i64).and_then(kind_code) else {
            continue;
        };
        let Some(word) = entry
            .get("insertText")
            .or_else(|| entry.get("label"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let info = entry
            .get("detail")
            .or_else(|| entry.get("label"))
            .and_then(Value::as_str)
            .unwrap_or(word);
        items.push(CompletionItem {
            word: word.to_string(),
            kind,
            info: info.to_string(),
        });
    }
    items
}

fn text_edits(result: Value) -> Result<Vec<TextEdit>> {
    if result.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(result)
        .map_err(|err| LspLinkError::Protocol(format!("malformed text edits: {err}")))
}
