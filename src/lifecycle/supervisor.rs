//! Supervisor liveness.
//!
//! The supervising context keeps one end of a socket pair; every connection
//! watches the other end. When the last [`Supervisor`] handle is dropped the
//! watched end reads EOF, which wakes any connection parked in a readiness
//! wait so it can terminate instead of lingering unsupervised.

use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// Held by the supervising context for as long as it is alive.
#[derive(Debug)]
pub struct Supervisor {
    _alive: UnixStream,
}

/// Connection-side view of the supervisor's liveness.
#[derive(Debug, Clone)]
pub struct SupervisorWatch {
    end: Arc<UnixStream>,
}

/// Create a supervisor handle and the watch handed to connections.
pub fn supervisor_channel() -> io::Result<(Supervisor, SupervisorWatch)> {
    let (alive, watched) = UnixStream::pair()?;
    watched.set_nonblocking(true)?;
    Ok((
        Supervisor { _alive: alive },
        SupervisorWatch {
            end: Arc::new(watched),
        },
    ))
}

impl SupervisorWatch {
    /// Non-blocking liveness probe.
    pub fn is_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        loop {
            match (&*self.end).read(&mut probe) {
                Ok(0) => return false,
                // The supervisor never writes; stray bytes do not mean death.
                Ok(_) => return true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Supervisor liveness probe failed");
                    return false;
                }
            }
        }
    }
}

impl AsRawFd for SupervisorWatch {
    fn as_raw_fd(&self) -> RawFd {
        self.end.as_raw_fd()
    }
}
