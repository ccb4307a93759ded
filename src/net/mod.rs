//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (Connection: socket + transport + wait set)
//!     → negotiator.rs (optional TLS upgrade)
//!     → connection.rs read/write (retry loop)
//!         → socket.rs (single non-blocking transfer)
//!         → wait.rs (readiness, supervisor, interrupts)
//!     → negotiator.rs (close session)
//! ```
//!
//! # Design Decisions
//! - Sockets are always OS non-blocking; blocking is emulated by waiting
//! - Encryption is a swappable transport strategy, not a build option
//! - Only the connection's own thread ever touches it

pub mod connection;
pub mod listener;
pub mod negotiator;
pub mod socket;
pub mod wait;

pub use connection::{Connection, ConnectionId};
pub use negotiator::{close_session, open_session};
