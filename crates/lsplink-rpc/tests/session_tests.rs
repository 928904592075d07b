//! Session tests against a scripted peer on an emulated socketpair.
//!
//! The peer side of the channel is driven directly by the test (or a test
//! thread), speaking real `Content-Length` framing, so correlation,
//! timeout, and peer-down behavior are exercised over actual sockets
//! without a subprocess.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use lsplink_rpc::{
    encode_frame, loopback_pair, FrameDecoder, LspLinkError, ReadEndpoint, Request, Response,
    RpcSession, SessionObserver, WriteEndpoint,
};
use serde_json::{json, Value};

/// The far end of the session's channel.
struct Peer {
    /// Receives what the session writes.
    incoming: TcpStream,
    /// Feeds the session's read endpoint.
    outgoing: TcpStream,
    decoder: FrameDecoder,
}

impl Peer {
    fn read_frame(&mut self) -> Value {
        self.incoming
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return frame;
            }
            let read = self.incoming.read(&mut buf).unwrap();
            assert!(read > 0, "session closed its write end unexpectedly");
            self.decoder.push(&buf[..read]);
        }
    }

    fn send(&mut self, payload: &Value) {
        self.outgoing.write_all(&encode_frame(payload)).unwrap();
    }

    fn respond(&mut self, id: u64, result: Value) {
        self.send(&json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }
}

fn start_session() -> (RpcSession, Peer) {
    let (write_ours, write_theirs) = loopback_pair().unwrap();
    let (read_ours, read_theirs) = loopback_pair().unwrap();
    let session = RpcSession::start(
        ReadEndpoint::Socket(read_ours),
        WriteEndpoint::Socket(write_ours),
    )
    .unwrap();
    let peer = Peer {
        incoming: write_theirs,
        outgoing: read_theirs,
        decoder: FrameDecoder::new(),
    };
    (session, peer)
}

#[derive(Default)]
struct RecordingObserver {
    notifications: Vec<(String, Value)>,
    requests: Vec<(String, Value)>,
    responses: Vec<(u64, String)>,
    peer_downs: usize,
}

impl SessionObserver for RecordingObserver {
    fn on_notification(&mut self, method: &str, params: &Value) {
        self.notifications.push((method.to_string(), params.clone()));
    }

    fn on_request(&mut self, method: &str, params: &Value) {
        self.requests.push((method.to_string(), params.clone()));
    }

    fn on_response(&mut self, request: &Request, _response: &Response) {
        self.responses.push((request.id, request.method.clone()));
    }

    fn on_peer_down(&mut self) {
        self.peer_downs += 1;
    }
}

/// Drain until the pending table empties or the deadline passes.
fn drain_until_settled(
    session: &mut RpcSession,
    observer: &mut RecordingObserver,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.pending_requests() > 0 {
        assert!(Instant::now() < deadline, "pending requests never settled");
        session.drain_and_dispatch(observer).unwrap();
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_request_receives_matching_response() {
    let (mut session, mut peer) = start_session();
    let mut observer = RecordingObserver::default();

    let server = thread::spawn(move || {
        let frame = peer.read_frame();
        assert_eq!(frame["method"], "initialize");
        assert_eq!(frame["jsonrpc"], "2.0");
        let id = frame["id"].as_u64().unwrap();
        peer.respond(id, json!({"capabilities": {"textDocumentSync": 1}}));
        peer
    });

    let result = session
        .send_request(
            "initialize",
            json!({"processId": 1}),
            Some(Duration::from_secs(5)),
            &mut observer,
        )
        .unwrap();
    assert_eq!(result["capabilities"]["textDocumentSync"], 1);
    assert_eq!(session.pending_requests(), 0);

    // The awaited response also reached the observer.
    assert_eq!(observer.responses.len(), 1);
    assert_eq!(observer.responses[0].1, "initialize");

    drop(server.join().unwrap());
    session.stop();
}

#[test]
fn test_out_of_order_responses_correlate_by_id() {
    let (mut session, mut peer) = start_session();
    let mut observer = RecordingObserver::default();

    let first = session.post_request("textDocument/completion", json!({"n": 1})).unwrap();
    let second = session.post_request("textDocument/formatting", json!({"n": 2})).unwrap();
    assert_ne!(first, second);
    assert_eq!(session.pending_requests(), 2);

    peer.read_frame();
    peer.read_frame();
    // Answer in reverse order.
    peer.respond(second, json!("second result"));
    peer.respond(first, json!("first result"));

    drain_until_settled(&mut session, &mut observer);

    assert_eq!(
        observer.responses,
        vec![
            (second, "textDocument/formatting".to_string()),
            (first, "textDocument/completion".to_string()),
        ]
    );
    session.stop();
}

#[test]
fn test_error_response_raises_server_error() {
    let (mut session, mut peer) = start_session();
    let mut observer = RecordingObserver::default();

    let server = thread::spawn(move || {
        let frame = peer.read_frame();
        let id = frame["id"].as_u64().unwrap();
        peer.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "method not found"}
        }));
        peer
    });

    let err = session
        .send_request("bogus/method", json!({}), Some(Duration::from_secs(5)), &mut observer)
        .unwrap_err();
    match err {
        LspLinkError::Server { code, message } => {
            assert_eq!(code, -32601);
            assert_eq!(message, "method not found");
        }
        other => panic!("expected server error, got {other:?}"),
    }
    // The entry is cleared even though the response carried an error.
    assert_eq!(session.pending_requests(), 0);

    drop(server.join().unwrap());
    session.stop();
}

#[test]
fn test_timeout_leaves_pending_entry() {
    let (mut session, _peer) = start_session();
    let mut observer = RecordingObserver::default();

    let err = session
        .send_request(
            "initialize",
            json!({}),
            Some(Duration::from_millis(150)),
            &mut observer,
        )
        .unwrap_err();
    assert!(matches!(err, LspLinkError::Timeout { .. }));

    // The request stays pending until a late response or teardown.
    assert_eq!(session.pending_requests(), 1);
    assert!(session.has_pending(0));
    assert_eq!(observer.peer_downs, 0);
    session.stop();
    assert_eq!(session.pending_requests(), 0);
}

#[test]
fn test_late_response_still_correlates_after_timeout() {
    let (mut session, mut peer) = start_session();
    let mut observer = RecordingObserver::default();

    let err = session
        .send_request(
            "textDocument/completion",
            json!({"late": true}),
            Some(Duration::from_millis(100)),
            &mut observer,
        )
        .unwrap_err();
    assert!(matches!(err, LspLinkError::Timeout { .. }));
    assert_eq!(session.pending_requests(), 1);

    // The response arrives after the caller gave up.
    let frame = peer.read_frame();
    let id = frame["id"].as_u64().unwrap();
    peer.respond(id, json!(["item"]));

    drain_until_settled(&mut session, &mut observer);
    assert_eq!(observer.responses.len(), 1);
    assert_eq!(observer.responses[0].0, id);
    session.stop();
}

#[test]
fn test_peer_close_reports_down_once_and_clears_pending() {
    let (mut session, mut peer) = start_session();
    let mut observer = RecordingObserver::default();

    let posted = session.post_request("first", json!({})).unwrap();
    assert!(session.has_pending(posted));

    let server = thread::spawn(move || {
        peer.read_frame();
        let frame = peer.read_frame();
        assert_eq!(frame["method"], "second");
        // Close both directions with two requests still unanswered.
        drop(peer);
    });

    let err = session
        .send_request("second", json!({}), Some(Duration::from_secs(5)), &mut observer)
        .unwrap_err();
    assert!(matches!(err, LspLinkError::PeerDown));
    server.join().unwrap();

    assert_eq!(observer.peer_downs, 1);
    assert_eq!(session.pending_requests(), 0);

    // Every later operation fails fast without another observer callback.
    let err = session
        .send_request("third", json!({}), Some(Duration::from_secs(5)), &mut observer)
        .unwrap_err();
    assert!(matches!(err, LspLinkError::PeerDown));
    let err = session.send_notification("note", json!({})).unwrap_err();
    assert!(matches!(err, LspLinkError::PeerDown));
    assert_eq!(observer.peer_downs, 1);

    session.stop();
}

#[test]
fn test_notification_carries_no_id() {
    let (mut session, mut peer) = start_session();

    session
        .send_notification("textDocument/didSave", json!({"textDocument": {"uri": "file:///a"}}))
        .unwrap();

    let frame = peer.read_frame();
    assert_eq!(frame["method"], "textDocument/didSave");
    assert!(frame.get("id").is_none());
    session.stop();
}

#[test]
fn test_server_notification_and_request_dispatch() {
    let (mut session, mut peer) = start_session();
    let mut observer = RecordingObserver::default();

    peer.send(&json!({
        "jsonrpc": "2.0",
        "method": "textDocument/publishDiagnostics",
        "params": {"uri": "file:///a.c", "diagnostics": []}
    }));
    // An id the session never allocated marks a peer-initiated request.
    peer.send(&json!({
        "jsonrpc": "2.0",
        "id": 9999,
        "method": "workspace/configuration",
        "params": {"items": []}
    }));

    let deadline = Instant::now() + Duration::from_secs(5);
    while observer.notifications.is_empty() || observer.requests.is_empty() {
        assert!(Instant::now() < deadline, "dispatch never happened");
        session.drain_and_dispatch(&mut observer).unwrap();
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(observer.notifications[0].0, "textDocument/publishDiagnostics");
    assert_eq!(observer.requests[0].0, "workspace/configuration");
    session.stop();
}

#[test]
fn test_ids_increase_monotonically() {
    let (mut session, mut peer) = start_session();

    let a = session.post_request("one", json!({})).unwrap();
    let b = session.post_request("two", json!({})).unwrap();
    let c = session.post_request("three", json!({})).unwrap();
    assert!(a < b && b < c);

    // And they appear on the wire in submission order.
    assert_eq!(peer.read_frame()["method"], "one");
    assert_eq!(peer.read_frame()["method"], "two");
    assert_eq!(peer.read_frame()["method"], "three");
    session.stop();
}

#[test]
fn test_stop_is_idempotent_and_nothing_blocks_after() {
    let (mut session, _peer) = start_session();
    let mut observer = RecordingObserver::default();

    session.stop();
    session.stop();
    assert!(session.is_stopped());

    let started = Instant::now();
    assert!(matches!(
        session.send_notification("late", json!({})),
        Err(LspLinkError::Stopped)
    ));
    assert!(matches!(
        session.send_request("late", json!({}), None, &mut observer),
        Err(LspLinkError::Stopped)
    ));
    assert!(matches!(
        session.drain_and_dispatch(&mut observer),
        Err(LspLinkError::Stopped)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(observer.peer_downs, 0);
}
