//! Readiness strategies over transport endpoints.
//!
//! One strategy per endpoint flavor, selected once when the worker is
//! constructed and never switched mid-session: stream-level `poll(2)` for
//! pipes, bounded-timeout `peek` for emulated sockets.

use std::io;
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{LspLinkError, Result};
use crate::transport::ReadEndpoint;

/// Wait-for-readable capability over one read endpoint.
pub trait ReadinessPoller: Send {
    /// Wait up to `timeout` for the endpoint to become readable.
    ///
    /// Returns within the timeout even when nothing becomes ready, and
    /// never blocks indefinitely on a zero timeout. `true` means readable,
    /// which includes end-of-stream.
    fn poll(&mut self, timeout: Duration) -> Result<bool>;
}

/// Build the strategy matching how the endpoint was obtained.
pub fn poller_for(endpoint: &ReadEndpoint) -> Result<Box<dyn ReadinessPoller>> {
    match endpoint {
        #[cfg(unix)]
        ReadEndpoint::Pipe(stdout) => {
            use std::os::unix::io::AsRawFd;
            Ok(Box::new(StreamPoller {
                fd: stdout.as_raw_fd(),
            }))
        }
        ReadEndpoint::Socket(stream) => Ok(Box::new(SocketPoller {
            probe: stream.try_clone().map_err(LspLinkError::transport)?,
        })),
    }
}

/// `poll(2)` on the raw pipe descriptor.
#[cfg(unix)]
pub struct StreamPoller {
    fd: std::os::unix::io::RawFd,
}

#[cfg(unix)]
impl ReadinessPoller for StreamPoller {
    fn poll(&mut self, timeout: Duration) -> Result<bool> {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        use std::os::fd::BorrowedFd;

        // The worker owns the endpoint this fd came from, so it stays open
        // for as long as the poller is used.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let timeout = PollTimeout::from(timeout.as_millis().min(u16::MAX as u128) as u16);
        loop {
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                    return Ok(revents
                        .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR));
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(LspLinkError::transport(err)),
            }
        }
    }
}

/// Bounded-timeout `peek` on a cloned socket handle.
pub struct SocketPoller {
    probe: TcpStream,
}

impl ReadinessPoller for SocketPoller {
    fn poll(&mut self, timeout: Duration) -> Result<bool> {
        // SO_RCVTIMEO rejects zero, which would mean "block forever" anyway.
        let timeout = timeout.max(Duration::from_millis(1));
        self.probe
            .set_read_timeout(Some(timeout))
            .map_err(LspLinkError::transport)?;

        let mut probe = [0u8; 1];
        match self.probe.peek(&mut probe) {
            Ok(_) => Ok(true),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(false)
            }
            Err(err) => Err(LspLinkError::transport(err)),
        }
    }
}
