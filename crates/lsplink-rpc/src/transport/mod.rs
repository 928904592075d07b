//! Transport establishment toward a spawned language-server subprocess.
//!
//! Produces two independent endpoints over the child's stdio: a write
//! endpoint feeding its stdin and a read endpoint draining its stdout.
//! On platforms with usable pipe readiness primitives the endpoints are
//! anonymous pipes; elsewhere a loopback TCP socketpair emulates the same
//! duplex channel. The child's stderr goes to the configured log sink.

pub mod poller;
pub(crate) mod worker;

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, info};

use crate::error::{LspLinkError, Result};
use crate::types::{ServerConfig, TransportKind};

/// Write half of the channel: bytes go to the child's stdin.
pub enum WriteEndpoint {
    #[cfg(unix)]
    Pipe(ChildStdin),
    Socket(TcpStream),
}

/// Read half of the channel: bytes come from the child's stdout.
pub enum ReadEndpoint {
    #[cfg(unix)]
    Pipe(ChildStdout),
    Socket(TcpStream),
}

impl ReadEndpoint {
    /// Bytes that can be read right now without blocking.
    ///
    /// Zero after a readiness signal means the peer closed its end; a live
    /// peer with nothing to say does not report readable.
    pub fn available_bytes(&mut self) -> Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Pipe(stdout) => {
                use std::os::unix::io::AsRawFd;
                let mut pending: libc::c_int = 0;
                let rc = unsafe { libc::ioctl(stdout.as_raw_fd(), libc::FIONREAD, &mut pending) };
                if rc < 0 {
                    Err(LspLinkError::transport(io::Error::last_os_error()))
                } else {
                    Ok(pending as usize)
                }
            }
            Self::Socket(stream) => {
                let mut probe = [0u8; 64 * 1024];
                stream.peek(&mut probe).map_err(LspLinkError::transport)
            }
        }
    }
}

impl Read for ReadEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Pipe(stdout) => stdout.read(buf),
            Self::Socket(stream) => stream.read(buf),
        }
    }
}

impl Write for WriteEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Pipe(stdin) => stdin.write(buf),
            Self::Socket(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Pipe(stdin) => stdin.flush(),
            Self::Socket(stream) => stream.flush(),
        }
    }
}

/// A freshly spawned server with its channel endpoints.
pub struct SpawnedServer {
    pub child: Child,
    pub reader: ReadEndpoint,
    pub writer: WriteEndpoint,
}

/// Spawn the configured server executable with its stdio attached to a new
/// transport channel and its stderr attached to the log sink.
pub fn launch(config: &ServerConfig) -> Result<SpawnedServer> {
    let log_sink = match &config.log_path {
        Some(path) => Stdio::from(File::create(path).map_err(LspLinkError::Spawn)?),
        None => Stdio::null(),
    };

    let mut command = Command::new(&config.executable);
    command.args(&config.args).stderr(log_sink);
    if let Some(dir) = config
        .executable
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
    {
        command.current_dir(dir);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        use windows_sys::Win32::System::Threading::{
            CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW,
        };
        // A console subprocess would otherwise flash a visible window.
        command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
    }

    match config.transport {
        TransportKind::Pipe => launch_piped(command),
        TransportKind::Socket => launch_socket(command),
    }
}

#[cfg(unix)]
fn launch_piped(mut command: Command) -> Result<SpawnedServer> {
    use std::os::unix::io::AsRawFd;

    command.stdin(Stdio::piped()).stdout(Stdio::piped());
    let mut child = command.spawn().map_err(LspLinkError::Spawn)?;
    info!(pid = child.id(), "language server spawned on pipes");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| LspLinkError::Transport("child stdin was not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LspLinkError::Transport("child stdout was not captured".to_string()))?;
    set_nonblocking(stdin.as_raw_fd())?;

    Ok(SpawnedServer {
        child,
        reader: ReadEndpoint::Pipe(stdout),
        writer: WriteEndpoint::Pipe(stdin),
    })
}

#[cfg(not(unix))]
fn launch_piped(_command: Command) -> Result<SpawnedServer> {
    Err(LspLinkError::Transport(
        "pipe transport is unavailable on this platform".to_string(),
    ))
}

fn launch_socket(mut command: Command) -> Result<SpawnedServer> {
    let (stdin_ours, stdin_child) = loopback_pair()?;
    let (stdout_ours, stdout_child) = loopback_pair()?;

    command
        .stdin(stdio_from_stream(stdin_child)?)
        .stdout(stdio_from_stream(stdout_child)?);
    let child = command.spawn().map_err(LspLinkError::Spawn)?;
    info!(pid = child.id(), "language server spawned on emulated sockets");

    Ok(SpawnedServer {
        child,
        reader: ReadEndpoint::Socket(stdout_ours),
        writer: WriteEndpoint::Socket(stdin_ours),
    })
}

/// Loopback TCP socketpair emulating an anonymous pipe.
///
/// Returns `(connector, accepted)`. Establishment fails when the accepted
/// peer address differs from the connector's bound address: some other
/// local process raced us onto the ephemeral listener.
pub fn loopback_pair() -> Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(LspLinkError::transport)?;
    let addr = listener.local_addr().map_err(LspLinkError::transport)?;

    let connector = TcpStream::connect(addr).map_err(LspLinkError::transport)?;
    let (accepted, peer) = listener.accept().map_err(LspLinkError::transport)?;
    let local = connector.local_addr().map_err(LspLinkError::transport)?;
    if peer != local {
        return Err(LspLinkError::Transport(format!(
            "emulated pipe peer mismatch: accepted {peer}, connected {local}"
        )));
    }
    debug!(%addr, "loopback socketpair established");
    Ok((connector, accepted))
}

#[cfg(unix)]
fn stdio_from_stream(stream: TcpStream) -> Result<Stdio> {
    use std::os::fd::OwnedFd;
    Ok(Stdio::from(OwnedFd::from(stream)))
}

#[cfg(windows)]
fn stdio_from_stream(stream: TcpStream) -> Result<Stdio> {
    use std::os::windows::io::{FromRawHandle, IntoRawSocket, OwnedHandle, RawHandle};
    // A SOCKET is a kernel HANDLE and can back child stdio directly.
    let handle = unsafe { OwnedHandle::from_raw_handle(stream.into_raw_socket() as RawHandle) };
    Ok(Stdio::from(handle))
}

#[cfg(unix)]
fn set_nonblocking(fd: std::os::unix::io::RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(LspLinkError::transport(io::Error::last_os_error()));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(LspLinkError::transport(io::Error::last_os_error()));
    }
    Ok(())
}
