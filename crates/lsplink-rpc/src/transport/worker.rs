//! The I/O worker thread.
//!
//! Exactly one worker per session owns the transport endpoints. Each cycle
//! it polls the read endpoint with a timeout scaled by a rolling idle
//! counter, drains whatever bytes are available into the frame decoder,
//! pushes complete frames onto the inbound queue, and drains the outbound
//! queue into the write buffer. Any protocol or transport error stops the
//! worker permanently; recovery means building a new worker over a new
//! subprocess.

use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::client::codec::{encode_frame, FrameDecoder};
use crate::error::{LspLinkError, Result};
use crate::transport::poller::{self, ReadinessPoller};
use crate::transport::{ReadEndpoint, WriteEndpoint};

pub(crate) const IDLE_INTERVAL_MS: u64 = 25;
const MAX_IDLE_TICKS: u64 = 100;
const READ_CHUNK_LIMIT: usize = 64 * 1024;

/// Caller-to-worker queue element.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Value),
    /// Cooperative shutdown; the worker drains nothing further.
    Stop,
}

/// Worker-to-caller queue element.
#[derive(Debug)]
pub(crate) enum Inbound {
    Frame(Value),
    /// Terminal sentinel: the transport is dead and so is the worker.
    Closed(LspLinkError),
}

#[derive(Debug)]
pub(crate) struct IoWorker {
    handle: JoinHandle<()>,
}

impl IoWorker {
    pub(crate) fn spawn(
        reader: ReadEndpoint,
        writer: WriteEndpoint,
        inbound: Sender<Inbound>,
        outbound: Receiver<Outbound>,
    ) -> Result<Self> {
        let poller = poller::poller_for(&reader)?;
        let handle = thread::Builder::new()
            .name("lsplink-io".to_string())
            .spawn(move || {
                let mut cycle = WorkerCycle {
                    reader,
                    writer,
                    poller,
                    inbound,
                    outbound,
                    decoder: FrameDecoder::new(),
                    write_buf: Vec::new(),
                    idle_ticks: 0,
                };
                cycle.run();
            })
            .map_err(LspLinkError::transport)?;
        Ok(Self { handle })
    }

    pub(crate) fn join(self) {
        let _ = self.handle.join();
    }
}

struct WorkerCycle {
    reader: ReadEndpoint,
    writer: WriteEndpoint,
    poller: Box<dyn ReadinessPoller>,
    inbound: Sender<Inbound>,
    outbound: Receiver<Outbound>,
    decoder: FrameDecoder,
    write_buf: Vec<u8>,
    idle_ticks: u64,
}

enum Exit {
    Stopped,
    Failed(LspLinkError),
}

impl WorkerCycle {
    fn run(&mut self) {
        debug!("i/o worker started");
        match self.drive() {
            Exit::Stopped => debug!("i/o worker stopped"),
            Exit::Failed(err) => {
                warn!(error = %err, "i/o worker failed");
                let _ = self.inbound.send(Inbound::Closed(err));
            }
        }
    }

    fn drive(&mut self) -> Exit {
        loop {
            let timeout = Duration::from_millis(IDLE_INTERVAL_MS * self.idle_ticks);
            match self.poller.poll(timeout) {
                Ok(true) => {
                    if let Err(err) = self.pump_reads() {
                        return Exit::Failed(err);
                    }
                }
                Ok(false) => {}
                Err(err) => return Exit::Failed(err),
            }

            match self.pump_writes() {
                Ok(true) => return Exit::Stopped,
                Ok(false) => {}
                Err(err) => return Exit::Failed(err),
            }

            if self.idle_ticks < MAX_IDLE_TICKS {
                self.idle_ticks += 1;
            }
        }
    }

    fn pump_reads(&mut self) -> Result<()> {
        let available = self.reader.available_bytes()?;
        if available == 0 {
            // Readable with nothing buffered: a live peer with no data does
            // not signal readiness, so the peer end is gone.
            return Err(LspLinkError::Transport(
                "peer closed the connection".to_string(),
            ));
        }

        let mut chunk = vec![0u8; available.min(READ_CHUNK_LIMIT)];
        let read = match self.reader.read(&mut chunk) {
            Ok(0) => {
                return Err(LspLinkError::Transport(
                    "peer closed the connection".to_string(),
                ))
            }
            Ok(read) => read,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(())
            }
            Err(err) => return Err(LspLinkError::transport(err)),
        };

        self.idle_ticks = 0;
        self.decoder.push(&chunk[..read]);
        while let Some(frame) = self.decoder.next_frame()? {
            trace!(buffered = self.decoder.buffered(), "frame decoded");
            if self.inbound.send(Inbound::Frame(frame)).is_err() {
                return Err(LspLinkError::Transport(
                    "inbound queue receiver is gone".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Drain the outbound queue into the write buffer and flush what the
    /// endpoint accepts. Returns `true` when the stop sentinel was seen.
    fn pump_writes(&mut self) -> Result<bool> {
        loop {
            match self.outbound.try_recv() {
                Ok(Outbound::Message(payload)) => {
                    self.write_buf.extend_from_slice(&encode_frame(&payload));
                    self.idle_ticks = 0;
                }
                Ok(Outbound::Stop) => {
                    let _ = self.flush_writes();
                    return Ok(true);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // Session dropped without an explicit stop.
                    let _ = self.flush_writes();
                    return Ok(true);
                }
            }
        }
        self.flush_writes()?;
        Ok(false)
    }

    fn flush_writes(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            match self.writer.write(&self.write_buf) {
                Ok(0) => {
                    return Err(LspLinkError::Transport(
                        "write end of the transport is closed".to_string(),
                    ))
                }
                Ok(written) => {
                    self.write_buf.drain(..written);
                    self.idle_ticks = 0;
                }
                // Retry the unwritten remainder on the next cycle.
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(LspLinkError::transport(err)),
            }
        }
        Ok(())
    }
}
