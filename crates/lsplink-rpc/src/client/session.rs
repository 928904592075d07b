//! Request/response correlation over the I/O worker's queues.
//!
//! The session is single-caller: the pending table and id counter belong to
//! whichever thread invokes its operations, and only the two mpsc queues
//! are shared with the worker. The synchronous request call blocks
//! cooperatively, sleeping a short interval between inbound polls.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::client::protocol::{Notification, Request, RequestId, Response};
use crate::error::{LspLinkError, Result};
use crate::transport::worker::{Inbound, IoWorker, Outbound};
use crate::transport::{ReadEndpoint, WriteEndpoint};

/// Applied when a request's caller passes no timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

const INBOUND_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Callbacks the session invokes while dispatching inbound traffic.
///
/// `on_response` fires for every correlated response, including the one a
/// blocked `send_request` is about to return, so late responses to
/// timed-out requests remain observable.
pub trait SessionObserver {
    fn on_notification(&mut self, method: &str, params: &Value);
    /// A peer-initiated request: its id is not in the pending table.
    fn on_request(&mut self, method: &str, params: &Value);
    fn on_response(&mut self, request: &Request, response: &Response);
    /// The transport failed or closed. Fires at most once per session.
    fn on_peer_down(&mut self);
}

/// Caller-facing JSON-RPC session over one worker.
#[derive(Debug)]
pub struct RpcSession {
    next_id: RequestId,
    pending: HashMap<RequestId, Request>,
    outbound: Sender<Outbound>,
    inbound: Receiver<Inbound>,
    worker: Option<IoWorker>,
    stopped: bool,
    peer_down: bool,
    peer_down_reported: bool,
}

impl RpcSession {
    /// Start a session and its I/O worker over freshly established
    /// endpoints. The worker takes exclusive ownership of both.
    pub fn start(reader: ReadEndpoint, writer: WriteEndpoint) -> Result<Self> {
        let (outbound_tx, outbound_rx) = channel();
        let (inbound_tx, inbound_rx) = channel();
        let worker = IoWorker::spawn(reader, writer, inbound_tx, outbound_rx)?;
        Ok(Self {
            next_id: 0,
            pending: HashMap::new(),
            outbound: outbound_tx,
            inbound: inbound_rx,
            worker: Some(worker),
            stopped: false,
            peer_down: false,
            peer_down_reported: false,
        })
    }

    /// Send a request and block until its response, a terminal sentinel, or
    /// the timeout.
    ///
    /// On timeout the entry stays in the pending table; a late response
    /// still correlates, reaches the observer, and clears it.
    pub fn send_request(
        &mut self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        observer: &mut dyn SessionObserver,
    ) -> Result<Value> {
        let id = self.enqueue_request(method, params)?;
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS));
        let deadline = Instant::now() + timeout;

        loop {
            match self.inbound.try_recv() {
                Ok(Inbound::Frame(frame)) => {
                    let matched = match self.dispatch_frame(frame, observer) {
                        Ok(matched) => matched,
                        Err(err) => return Err(self.enter_peer_down(err, observer)),
                    };
                    if let Some(response) = matched {
                        if response.id == id {
                            return match response.error {
                                Some(error) => Err(LspLinkError::Server {
                                    code: error.code,
                                    message: error.message,
                                }),
                                None => Ok(response.result.unwrap_or(Value::Null)),
                            };
                        }
                    }
                }
                Ok(Inbound::Closed(err)) => return Err(self.enter_peer_down(err, observer)),
                Err(TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        return Err(LspLinkError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(INBOUND_POLL_INTERVAL);
                }
                Err(TryRecvError::Disconnected) => {
                    let err = LspLinkError::Transport("inbound queue disconnected".to_string());
                    return Err(self.enter_peer_down(err, observer));
                }
            }
        }
    }

    /// Enqueue a request without waiting for its response. The id still
    /// enters the pending table and a later response correlates normally.
    pub fn post_request(&mut self, method: &str, params: Value) -> Result<RequestId> {
        self.enqueue_request(method, params)
    }

    /// Enqueue a notification. Fails immediately when the session is
    /// stopped or the peer is gone.
    pub fn send_notification(&mut self, method: &str, params: Value) -> Result<()> {
        self.ensure_open()?;
        let notification = Notification::new(method, params);
        let payload =
            serde_json::to_value(&notification).map_err(LspLinkError::protocol)?;
        debug!(method, "sending notification");
        self.outbound
            .send(Outbound::Message(payload))
            .map_err(|_| LspLinkError::Stopped)
    }

    /// Non-blockingly pop every queued inbound message and route each to
    /// the observer.
    pub fn drain_and_dispatch(&mut self, observer: &mut dyn SessionObserver) -> Result<()> {
        self.ensure_open()?;
        loop {
            match self.inbound.try_recv() {
                Ok(Inbound::Frame(frame)) => {
                    if let Err(err) = self.dispatch_frame(frame, observer) {
                        return Err(self.enter_peer_down(err, observer));
                    }
                }
                Ok(Inbound::Closed(err)) => return Err(self.enter_peer_down(err, observer)),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    let err = LspLinkError::Transport("inbound queue disconnected".to_string());
                    return Err(self.enter_peer_down(err, observer));
                }
            }
        }
    }

    /// Stop the worker and join it. Idempotent; never blocks indefinitely.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _ = self.outbound.send(Outbound::Stop);
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
        self.pending.clear();
        debug!("session stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_peer_down(&self) -> bool {
        self.peer_down
    }

    /// Requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.stopped {
            return Err(LspLinkError::Stopped);
        }
        if self.peer_down {
            return Err(LspLinkError::PeerDown);
        }
        Ok(())
    }

    fn enqueue_request(&mut self, method: &str, params: Value) -> Result<RequestId> {
        self.ensure_open()?;
        let id = self.next_id;
        self.next_id += 1;

        let request = Request::new(id, method, params);
        let payload = serde_json::to_value(&request).map_err(LspLinkError::protocol)?;
        debug!(method, id, "sending request");
        self.outbound
            .send(Outbound::Message(payload))
            .map_err(|_| LspLinkError::Stopped)?;
        self.pending.insert(id, request);
        Ok(id)
    }

    /// Classify one inbound frame and dispatch it.
    ///
    /// No `id` field: a notification. An `id` absent from the pending
    /// table: a peer-initiated request. Otherwise the response to the
    /// pending entry, which is removed exactly once.
    fn dispatch_frame(
        &mut self,
        frame: Value,
        observer: &mut dyn SessionObserver,
    ) -> Result<Option<Response>> {
        let object = frame
            .as_object()
            .ok_or_else(|| LspLinkError::Protocol("frame is not a JSON object".to_string()))?;

        let pending_id = object
            .get("id")
            .and_then(Value::as_u64)
            .filter(|id| self.pending.contains_key(id));

        if let Some(id) = pending_id {
            let request = self
                .pending
                .remove(&id)
                .ok_or_else(|| LspLinkError::Protocol("pending entry vanished".to_string()))?;
            let response: Response = serde_json::from_value(frame)
                .map_err(|err| LspLinkError::Protocol(format!("malformed response: {err}")))?;
            debug!(id, method = %request.method, "received response");
            observer.on_response(&request, &response);
            return Ok(Some(response));
        }

        let method = object
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LspLinkError::Protocol("frame carries neither known id nor method".to_string())
            })?
            .to_string();
        let params = object.get("params").cloned().unwrap_or(Value::Null);

        if object.contains_key("id") {
            debug!(method = %method, "received peer request");
            observer.on_request(&method, &params);
        } else {
            debug!(method = %method, "received notification");
            observer.on_notification(&method, &params);
        }
        Ok(None)
    }

    /// Enter the terminal peer-down state: clear the pending table, report
    /// to the observer exactly once, and fail every later operation fast.
    fn enter_peer_down(
        &mut self,
        err: LspLinkError,
        observer: &mut dyn SessionObserver,
    ) -> LspLinkError {
        self.peer_down = true;
        self.pending.clear();
        if !self.peer_down_reported {
            self.peer_down_reported = true;
            warn!(error = %err, "peer is down");
            observer.on_peer_down();
        }
        LspLinkError::PeerDown
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.stop();
    }
}
