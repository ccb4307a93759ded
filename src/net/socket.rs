//! Raw socket transfers and the transport strategy seam.
//!
//! Every transfer attempt is a single non-blocking call that reports either
//! progress, a failure, or which readiness to wait for before retrying. The
//! retry/wait policy lives in [`crate::net::connection`], never here.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

/// A byte stream the connection can drive.
///
/// The stream is switched to OS non-blocking mode when a connection takes it
/// over, so every read/write returns immediately.
pub trait Socket: Read + Write + AsRawFd + Send + 'static {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Socket for std::net::TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        std::net::TcpStream::set_nonblocking(self, nonblocking)
    }
}

impl Socket for std::os::unix::net::UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_nonblocking(self, nonblocking)
    }
}

/// Readiness a blocked transfer must wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    Readable,
    Writable,
}

impl WaitFor {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitFor::Readable => "readable",
            WaitFor::Writable => "writable",
        }
    }
}

/// Outcome of one transfer attempt.
#[derive(Debug)]
pub enum Transfer {
    /// Bytes moved (0 means end of stream for reads).
    Done(usize),
    /// Nothing moved; retry once the socket reaches this readiness.
    WouldBlock(WaitFor),
    /// Any other error, returned to the caller verbatim.
    Failed(io::Error),
}

impl Transfer {
    pub(crate) fn from_io(result: io::Result<usize>, wait_for: WaitFor) -> Self {
        match result {
            Ok(n) => Transfer::Done(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Transfer::WouldBlock(wait_for),
            Err(e) => Transfer::Failed(e),
        }
    }
}

/// Direction of the caller's operation, as seen by interrupt processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

impl IoDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            IoDirection::Read => "read",
            IoDirection::Write => "write",
        }
    }
}

/// Read once from the socket without blocking.
pub fn raw_read<S: Read + ?Sized>(socket: &mut S, buf: &mut [u8]) -> Transfer {
    loop {
        match socket.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return Transfer::from_io(result, WaitFor::Readable),
        }
    }
}

/// Write once to the socket without blocking.
pub fn raw_write<S: Write + ?Sized>(socket: &mut S, buf: &[u8]) -> Transfer {
    loop {
        match socket.write(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return Transfer::from_io(result, WaitFor::Writable),
        }
    }
}

/// How bytes cross the socket: in the clear or through an encrypted session.
///
/// Implementations never wait. A would-block result names the readiness the
/// strategy needs, which may be the opposite of the caller's direction.
pub trait Transport<S>: Send {
    fn recv(&mut self, socket: &mut S, buf: &mut [u8]) -> Transfer;

    fn send(&mut self, socket: &mut S, buf: &[u8]) -> Transfer;

    /// Push out anything buffered inside the strategy.
    fn flush(&mut self, _socket: &mut S) -> Transfer {
        Transfer::Done(0)
    }

    /// Best-effort shutdown; must not wait and must not fail.
    fn close(&mut self, _socket: &mut S) {}

    fn is_encrypted(&self) -> bool {
        false
    }

    fn peer_identity(&self) -> Option<&str> {
        None
    }
}

/// Unencrypted transfers straight against the socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

impl<S: Socket> Transport<S> for Plaintext {
    fn recv(&mut self, socket: &mut S, buf: &mut [u8]) -> Transfer {
        raw_read(socket, buf)
    }

    fn send(&mut self, socket: &mut S, buf: &[u8]) -> Transfer {
        raw_write(socket, buf)
    }
}
