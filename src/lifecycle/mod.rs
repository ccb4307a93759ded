//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Build TLS context (fatal on error) → Start listener
//!
//! Per connection:
//!     interrupts.rs  deferred actions raised from other threads
//!     supervisor.rs  liveness of the supervising context
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//!
//! Shutdown (shutdown.rs):
//!     Stop accepting → Terminate connections → Drain → Destroy TLS context
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then TLS, then listeners
//! - Shutdown has a grace period; the supervisor handle is dropped last so
//!   stragglers parked in a wait terminate themselves

pub mod interrupts;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod supervisor;

pub use interrupts::{DeferredActions, InterruptHandler, InterruptToken, NoInterrupts, RunMode};
pub use shutdown::{ConnectionTracker, Shutdown};
pub use supervisor::{supervisor_channel, Supervisor, SupervisorWatch};
