//! Readiness waits for a single connection.
//!
//! A connection parks here whenever a transfer would block. The wait returns
//! on socket readiness, supervisor exit, or a raised interrupt; it has no
//! timeout.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::lifecycle::interrupts::InterruptToken;
use crate::lifecycle::supervisor::SupervisorWatch;
use crate::net::socket::WaitFor;

const SOCKET: Token = Token(0);
const SUPERVISOR: Token = Token(1);
const LATCH: Token = Token(2);

/// Which of the watched conditions ended a wait. Several may be set at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOutcome {
    pub socket_ready: bool,
    pub supervisor_died: bool,
    /// The interrupt flag was raised; it has already been consumed.
    pub interrupted: bool,
}

impl WaitOutcome {
    fn any(&self) -> bool {
        self.socket_ready || self.supervisor_died || self.interrupted
    }
}

/// Event-wait primitive used by the I/O engine.
pub trait WaitEvents: Send {
    /// Block until `fd` reaches `wait_for`, the supervisor exits, or the
    /// interrupt flag is raised.
    fn wait(&mut self, fd: RawFd, wait_for: WaitFor) -> io::Result<WaitOutcome>;
}

/// `mio`-backed wait set: the connection socket, the supervisor watch and a
/// waker tied to the connection's interrupt token.
pub struct MioWaitSet {
    poll: Poll,
    events: Events,
    interrupt: InterruptToken,
    supervisor: Option<SupervisorWatch>,
    registered: Option<RawFd>,
}

impl MioWaitSet {
    pub fn new(interrupt: InterruptToken, supervisor: Option<SupervisorWatch>) -> io::Result<Self> {
        let poll = Poll::new()?;
        interrupt.bind(mio::Waker::new(poll.registry(), LATCH)?)?;
        if let Some(watch) = &supervisor {
            poll.registry().register(
                &mut SourceFd(&watch.as_raw_fd()),
                SUPERVISOR,
                Interest::READABLE,
            )?;
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(8),
            interrupt,
            supervisor,
            registered: None,
        })
    }

    /// Point the socket registration at `fd` with the requested interest.
    ///
    /// Re-registering also re-arms readiness that was already present, so a
    /// socket that became ready before the wait still reports it.
    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let registry = self.poll.registry();
        match self.registered {
            Some(current) if current == fd => {
                registry.reregister(&mut SourceFd(&fd), SOCKET, interest)?;
            }
            Some(stale) => {
                let _ = registry.deregister(&mut SourceFd(&stale));
                registry.register(&mut SourceFd(&fd), SOCKET, interest)?;
            }
            None => registry.register(&mut SourceFd(&fd), SOCKET, interest)?,
        }
        self.registered = Some(fd);
        Ok(())
    }

    fn supervisor_died(&self) -> bool {
        self.supervisor
            .as_ref()
            .is_some_and(|watch| !watch.is_alive())
    }
}

impl WaitEvents for MioWaitSet {
    fn wait(&mut self, fd: RawFd, wait_for: WaitFor) -> io::Result<WaitOutcome> {
        let interest = match wait_for {
            WaitFor::Readable => Interest::READABLE,
            WaitFor::Writable => Interest::WRITABLE,
        };
        self.arm(fd, interest)?;

        loop {
            // A flag raised before we got here must not be slept through.
            let mut outcome = WaitOutcome {
                socket_ready: false,
                supervisor_died: self.supervisor_died(),
                interrupted: self.interrupt.take(),
            };
            if outcome.any() {
                return Ok(outcome);
            }

            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            outcome.socket_ready = self.events.iter().any(|event| event.token() == SOCKET);
            outcome.supervisor_died = self.supervisor_died();
            outcome.interrupted = self.interrupt.take();
            if outcome.any() {
                return Ok(outcome);
            }
            // Waker fired for a flag that was consumed elsewhere; sleep again.
        }
    }
}

impl std::fmt::Debug for MioWaitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioWaitSet")
            .field("registered", &self.registered)
            .field("supervised", &self.supervisor.is_some())
            .finish_non_exhaustive()
    }
}
