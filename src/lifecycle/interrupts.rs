//! Cooperative interrupts.
//!
//! # Responsibilities
//! - Carry a per-connection interrupt flag that other threads can raise
//! - Wake a connection blocked in its readiness wait when the flag is raised
//! - Run deferred actions at the poll points of every read/write
//!
//! # Design Decisions
//! - The flag is consumed with an atomic swap by whoever observes it
//! - Actions that may block only run when the I/O path says blocking is allowed
//! - Nothing is preempted: actions run on the connection's own thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::net::socket::IoDirection;
use crate::observability::metrics;

/// Cancellation/notification flag shared between a connection and its raisers.
#[derive(Clone, Default)]
pub struct InterruptToken {
    inner: Arc<Latch>,
}

#[derive(Default)]
struct Latch {
    raised: AtomicBool,
    waker: OnceLock<mio::Waker>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake the owning connection if it is waiting.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        if let Some(waker) = self.inner.waker.get() {
            if let Err(e) = waker.wake() {
                tracing::warn!(error = %e, "Failed to wake connection for interrupt");
            }
        }
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Consume the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.inner.raised.swap(false, Ordering::AcqRel)
    }

    /// Attach the waker of the wait set that sleeps on behalf of this token.
    pub(crate) fn bind(&self, waker: mio::Waker) -> std::io::Result<()> {
        self.inner.waker.set(waker).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "interrupt token is already bound to a wait set",
            )
        })
    }
}

impl std::fmt::Debug for InterruptToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptToken")
            .field("raised", &self.is_raised())
            .field("bound", &self.inner.waker.get().is_some())
            .finish()
    }
}

/// Drains deferred work at the I/O engine's poll points.
pub trait InterruptHandler: Send {
    /// `may_block` is true only while the connection is parked in a wait and
    /// the full set of actions is allowed to run.
    ///
    /// Returns true when actions were held back because blocking was not
    /// allowed; the caller owes them a blocking pass at its next wait.
    fn process(&mut self, direction: IoDirection, may_block: bool) -> bool;
}

/// Handler that has nothing to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInterrupts;

impl InterruptHandler for NoInterrupts {
    fn process(&mut self, _direction: IoDirection, _may_block: bool) -> bool {
        false
    }
}

/// When a deferred action is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Safe at every poll point, including the non-blocking one after a transfer.
    Anytime,
    /// Only while the connection is already waiting (statement cancel, terminate).
    MayBlock,
}

struct Pending {
    name: &'static str,
    mode: RunMode,
    action: Box<dyn FnOnce() + Send>,
}

/// Queue of actions scheduled from other threads and run on the connection's.
#[derive(Clone, Default)]
pub struct DeferredActions {
    queue: Arc<Mutex<Vec<Pending>>>,
    token: InterruptToken,
}

impl DeferredActions {
    pub fn new(token: InterruptToken) -> Self {
        Self {
            queue: Arc::default(),
            token,
        }
    }

    pub fn token(&self) -> &InterruptToken {
        &self.token
    }

    /// Queue an action and raise the interrupt flag.
    pub fn schedule<F>(&self, name: &'static str, mode: RunMode, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Pending {
                name,
                mode,
                action: Box::new(action),
            });
        self.token.raise();
    }

    /// Number of actions still waiting to run.
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl InterruptHandler for DeferredActions {
    fn process(&mut self, direction: IoDirection, may_block: bool) -> bool {
        let (ready, held_back) = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.is_empty() {
                return false;
            }
            let (ready, kept): (Vec<Pending>, Vec<Pending>) = std::mem::take(&mut *queue)
                .into_iter()
                .partition(|p| may_block || p.mode == RunMode::Anytime);
            let held_back = !kept.is_empty();
            *queue = kept;
            (ready, held_back)
        };

        if ready.is_empty() {
            return held_back;
        }
        metrics::record_interrupt(direction, may_block);

        // Run outside the lock so actions can schedule follow-ups.
        for pending in ready {
            tracing::debug!(
                action = pending.name,
                op = direction.as_str(),
                may_block,
                "Running deferred action"
            );
            (pending.action)();
        }
        held_back
    }
}

impl std::fmt::Debug for DeferredActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredActions")
            .field("pending", &self.pending())
            .field("token", &self.token)
            .finish()
    }
}
