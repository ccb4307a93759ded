//! Connection handle and the blocking-aware I/O engine.
//!
//! # Responsibilities
//! - Own the per-connection socket, transport strategy and blocking mode
//! - Retry transfers across would-block conditions in blocking mode
//! - Poll interrupts at every wait and once after every transfer
//! - Terminate the connection when the supervisor exits mid-wait
//!
//! # Retry loop
//! ```text
//! attempt ──Done/Failed──────────────────────────▶ process(non-blocking) → return
//!    │
//!    └─WouldBlock(dir)─┬─ non-blocking mode ─────▶ process(non-blocking) → WouldBlock
//!                      └─ wait(dir) ─┬─ supervisor died ─▶ terminate, return fatal
//!                                    ├─ interrupted ─────▶ process(may block), retry
//!                                    └─ ready ───────────▶ retry
//! ```
//!
//! Waits outside the retry loop (the handshake) process interrupts without
//! blocking. Actions held back there run at the next blocking wait, before
//! the connection sleeps again, since their flag has already been consumed.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, SecureError};
use crate::lifecycle::interrupts::InterruptHandler;
use crate::net::socket::{IoDirection, Plaintext, Socket, Transfer, Transport, WaitFor};
use crate::net::wait::WaitEvents;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

enum Op<'a> {
    Recv(&'a mut [u8]),
    Send(&'a [u8]),
    Flush,
}

impl Op<'_> {
    fn direction(&self) -> IoDirection {
        match self {
            Op::Recv(_) => IoDirection::Read,
            Op::Send(_) | Op::Flush => IoDirection::Write,
        }
    }
}

/// Per-connection state, owned by the connection's execution context.
pub struct Connection<S: Socket> {
    id: ConnectionId,
    socket: S,
    transport: Box<dyn Transport<S>>,
    waiter: Box<dyn WaitEvents>,
    interrupts: Box<dyn InterruptHandler>,
    nonblocking: bool,
    terminated: bool,
    /// Blocking actions left behind by a non-blocking pass that consumed the flag.
    deferred: bool,
}

impl<S: Socket> Connection<S> {
    /// Take over `socket` in plaintext, blocking mode.
    ///
    /// The socket itself is switched to OS non-blocking mode; blocking
    /// semantics are provided by the retry loop.
    pub fn new<W, I>(socket: S, waiter: W, interrupts: I) -> io::Result<Self>
    where
        W: WaitEvents + 'static,
        I: InterruptHandler + 'static,
    {
        socket.set_nonblocking(true)?;
        Ok(Self {
            id: ConnectionId::new(),
            socket,
            transport: Box::new(Plaintext),
            waiter: Box::new(waiter),
            interrupts: Box::new(interrupts),
            nonblocking: false,
            terminated: false,
            deferred: false,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// In non-blocking mode a would-block result is returned to the caller
    /// instead of waiting.
    pub fn set_nonblocking(&mut self, nonblocking: bool) {
        self.nonblocking = nonblocking;
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.is_encrypted()
    }

    /// Verified client certificate common name, when one was presented.
    pub fn peer_identity(&self) -> Option<&str> {
        self.transport.peer_identity()
    }

    /// True once a fatal error has torn the connection down.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` is end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.transfer(Op::Recv(buf))
    }

    /// Write up to `buf.len()` bytes, returning how many were accepted.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.transfer(Op::Send(buf))
    }

    /// Push out records an encrypted session still holds. No-op in plaintext.
    pub fn flush(&mut self) -> Result<()> {
        self.transfer(Op::Flush).map(|_| ())
    }

    fn transfer(&mut self, mut op: Op<'_>) -> Result<usize> {
        if self.terminated {
            return Err(SecureError::Terminated);
        }
        let direction = op.direction();

        let result = loop {
            let wait_for = match self.attempt(&mut op) {
                Transfer::Done(n) => break Ok(n),
                Transfer::Failed(e) => break Err(SecureError::Io(e)),
                Transfer::WouldBlock(wait_for) => wait_for,
            };

            if self.nonblocking {
                break Err(SecureError::Io(io::ErrorKind::WouldBlock.into()));
            }

            self.await_readiness(wait_for, direction, true)?;
        };

        // Interrupts that arrived before or during a transfer that never had
        // to wait must still be seen.
        self.interrupts.process(direction, false);
        result
    }

    fn attempt(&mut self, op: &mut Op<'_>) -> Transfer {
        match op {
            Op::Recv(buf) => self.transport.recv(&mut self.socket, buf),
            Op::Send(buf) => self.transport.send(&mut self.socket, buf),
            Op::Flush => self.transport.flush(&mut self.socket),
        }
    }

    /// Park until the socket reaches `wait_for`.
    ///
    /// `interrupt_may_block` selects the interrupt processing mode used when
    /// the wait was ended by a raised interrupt.
    pub(crate) fn await_readiness(
        &mut self,
        wait_for: WaitFor,
        direction: IoDirection,
        interrupt_may_block: bool,
    ) -> Result<()> {
        if interrupt_may_block && self.deferred {
            self.deferred = false;
            self.interrupts.process(direction, true);
            return Ok(());
        }

        metrics::record_wait(direction, wait_for);
        let outcome = self.waiter.wait(self.socket.as_raw_fd(), wait_for)?;

        if outcome.supervisor_died {
            return Err(self.terminate());
        }
        if outcome.interrupted && self.interrupts.process(direction, interrupt_may_block) {
            self.deferred = true;
        }
        Ok(())
    }

    fn terminate(&mut self) -> SecureError {
        self.terminated = true;
        metrics::record_supervisor_death();
        tracing::error!(
            connection_id = %self.id,
            "Terminating connection due to unexpected supervisor exit"
        );
        SecureError::SupervisorDied
    }

    pub(crate) fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Swap the transport strategy, returning the previous one.
    pub(crate) fn install_transport(
        &mut self,
        transport: Box<dyn Transport<S>>,
    ) -> Box<dyn Transport<S>> {
        std::mem::replace(&mut self.transport, transport)
    }
}

impl<S: Socket> io::Read for Connection<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Connection::read(self, buf).map_err(io::Error::from)
    }
}

impl<S: Socket> io::Write for Connection<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Connection::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Connection::flush(self).map_err(io::Error::from)
    }
}

impl<S: Socket> std::fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("encrypted", &self.is_encrypted())
            .field("peer", &self.peer_identity())
            .field("nonblocking", &self.nonblocking)
            .field("terminated", &self.terminated)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wait::WaitOutcome;
    use std::collections::VecDeque;
    use std::os::unix::io::RawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::{Arc, Mutex};

    type Log<T> = Arc<Mutex<Vec<T>>>;

    /// Transport that replays a fixed script of transfer outcomes.
    struct Scripted {
        steps: VecDeque<Transfer>,
        calls: Log<&'static str>,
    }

    impl Transport<UnixStream> for Scripted {
        fn recv(&mut self, _socket: &mut UnixStream, _buf: &mut [u8]) -> Transfer {
            self.calls.lock().unwrap().push("recv");
            self.steps.pop_front().expect("script exhausted")
        }

        fn send(&mut self, _socket: &mut UnixStream, _buf: &[u8]) -> Transfer {
            self.calls.lock().unwrap().push("send");
            self.steps.pop_front().expect("script exhausted")
        }

        fn is_encrypted(&self) -> bool {
            true
        }
    }

    struct ScriptedWaits {
        outcomes: VecDeque<io::Result<WaitOutcome>>,
        seen: Log<WaitFor>,
    }

    impl WaitEvents for ScriptedWaits {
        fn wait(&mut self, _fd: RawFd, wait_for: WaitFor) -> io::Result<WaitOutcome> {
            self.seen.lock().unwrap().push(wait_for);
            self.outcomes.pop_front().expect("unexpected wait")
        }
    }

    /// Records every pass; with `holds_back` it reports work left behind by
    /// non-blocking passes.
    struct Recorder {
        log: Log<(IoDirection, bool)>,
        holds_back: bool,
    }

    impl InterruptHandler for Recorder {
        fn process(&mut self, direction: IoDirection, may_block: bool) -> bool {
            self.log.lock().unwrap().push((direction, may_block));
            self.holds_back && !may_block
        }
    }

    struct Harness {
        conn: Connection<UnixStream>,
        calls: Log<&'static str>,
        waits: Log<WaitFor>,
        interrupts: Log<(IoDirection, bool)>,
        _peer: UnixStream,
    }

    const READY: WaitOutcome = WaitOutcome {
        socket_ready: true,
        supervisor_died: false,
        interrupted: false,
    };

    fn harness(steps: Vec<Transfer>, waits: Vec<io::Result<WaitOutcome>>) -> Harness {
        harness_with(steps, waits, false)
    }

    fn harness_with(
        steps: Vec<Transfer>,
        waits: Vec<io::Result<WaitOutcome>>,
        holds_back: bool,
    ) -> Harness {
        let (socket, peer) = UnixStream::pair().unwrap();
        let calls = Log::default();
        let seen = Log::default();
        let interrupts = Log::default();
        let mut conn = Connection::new(
            socket,
            ScriptedWaits {
                outcomes: waits.into(),
                seen: seen.clone(),
            },
            Recorder {
                log: interrupts.clone(),
                holds_back,
            },
        )
        .unwrap();
        conn.install_transport(Box::new(Scripted {
            steps: steps.into(),
            calls: calls.clone(),
        }));
        Harness {
            conn,
            calls,
            waits: seen,
            interrupts,
            _peer: peer,
        }
    }

    #[test]
    fn encrypted_read_waits_on_direction_reported_by_session() {
        let mut h = harness(
            vec![Transfer::WouldBlock(WaitFor::Writable), Transfer::Done(3)],
            vec![Ok(READY)],
        );
        let mut buf = [0u8; 8];
        assert_eq!(h.conn.read(&mut buf).unwrap(), 3);
        assert_eq!(*h.waits.lock().unwrap(), vec![WaitFor::Writable]);
        assert_eq!(
            *h.interrupts.lock().unwrap(),
            vec![(IoDirection::Read, false)]
        );
    }

    #[test]
    fn non_blocking_mode_never_waits() {
        let mut h = harness(vec![Transfer::WouldBlock(WaitFor::Readable)], vec![]);
        h.conn.set_nonblocking(true);
        let mut buf = [0u8; 8];
        let err = h.conn.read(&mut buf).unwrap_err();
        assert!(err.is_would_block());
        assert!(h.waits.lock().unwrap().is_empty());
        assert_eq!(
            *h.interrupts.lock().unwrap(),
            vec![(IoDirection::Read, false)]
        );
    }

    #[test]
    fn interrupted_wait_processes_with_blocking_allowed_then_retries() {
        let interrupted = WaitOutcome {
            interrupted: true,
            ..WaitOutcome::default()
        };
        let mut h = harness(
            vec![
                Transfer::WouldBlock(WaitFor::Writable),
                Transfer::WouldBlock(WaitFor::Writable),
                Transfer::Done(2),
            ],
            vec![Ok(interrupted), Ok(READY)],
        );
        assert_eq!(h.conn.write(b"ok").unwrap(), 2);
        assert_eq!(
            *h.interrupts.lock().unwrap(),
            vec![(IoDirection::Write, true), (IoDirection::Write, false)]
        );
        assert_eq!(h.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn actions_held_back_during_handshake_run_at_next_blocking_wait() {
        let interrupted = WaitOutcome {
            interrupted: true,
            ..WaitOutcome::default()
        };
        let mut h = harness_with(
            vec![Transfer::WouldBlock(WaitFor::Readable), Transfer::Done(1)],
            vec![Ok(interrupted)],
            true,
        );

        h.conn
            .await_readiness(WaitFor::Readable, IoDirection::Read, false)
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(h.conn.read(&mut buf).unwrap(), 1);

        // Only the handshake wait slept; the read ran the held-back work instead.
        assert_eq!(h.waits.lock().unwrap().len(), 1);
        assert_eq!(
            *h.interrupts.lock().unwrap(),
            vec![
                (IoDirection::Read, false),
                (IoDirection::Read, true),
                (IoDirection::Read, false),
            ]
        );

        // Already paid: later waits sleep normally.
        assert!(!h.conn.deferred);
    }

    #[test]
    fn supervisor_death_terminates_connection() {
        let died = WaitOutcome {
            supervisor_died: true,
            ..WaitOutcome::default()
        };
        let mut h = harness(vec![Transfer::WouldBlock(WaitFor::Readable)], vec![Ok(died)]);
        let mut buf = [0u8; 8];

        let err = h.conn.read(&mut buf).unwrap_err();
        assert!(matches!(err, SecureError::SupervisorDied));
        assert!(err.is_fatal());
        assert!(h.conn.is_terminated());
        // Fatal exits skip the trailing interrupt pass.
        assert!(h.interrupts.lock().unwrap().is_empty());

        assert!(matches!(
            h.conn.write(b"late"),
            Err(SecureError::Terminated)
        ));
        assert!(matches!(
            h.conn.read(&mut buf),
            Err(SecureError::Terminated)
        ));
        assert_eq!(h.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn transport_errors_are_returned_verbatim() {
        let mut h = harness(
            vec![Transfer::Failed(io::ErrorKind::ConnectionReset.into())],
            vec![],
        );
        let mut buf = [0u8; 8];
        match h.conn.read(&mut buf) {
            Err(SecureError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.calls.lock().unwrap().len(), 1);
        assert_eq!(h.interrupts.lock().unwrap().len(), 1);
    }

    #[test]
    fn wait_failure_is_propagated() {
        let mut h = harness(
            vec![Transfer::WouldBlock(WaitFor::Readable)],
            vec![Err(io::Error::other("poll failed"))],
        );
        let mut buf = [0u8; 8];
        assert!(matches!(h.conn.read(&mut buf), Err(SecureError::Io(_))));
        assert!(!h.conn.is_terminated());
    }

    #[test]
    fn plaintext_flush_is_a_no_op() {
        let (socket, _peer) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(
            socket,
            ScriptedWaits {
                outcomes: VecDeque::new(),
                seen: Log::default(),
            },
            crate::lifecycle::interrupts::NoInterrupts,
        )
        .unwrap();
        conn.flush().unwrap();
        assert!(!conn.is_encrypted());
        assert!(conn.peer_identity().is_none());
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }
}
