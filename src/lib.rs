//! Secure transport boundary for a connection-per-thread server.
//!
//! Upgrades client sockets to TLS sessions, moves bytes through them with
//! blocking semantics that stay interruptible, and manages the process-wide
//! TLS context across start, reload and shutdown.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod tls;

pub use config::schema::ServerConfig;
pub use error::{Result, SecureError};
pub use lifecycle::Shutdown;
pub use net::Connection;
pub use tls::ChannelManager;
