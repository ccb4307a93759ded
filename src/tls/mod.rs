//! Encrypted transport subsystem.
//!
//! # Data Flow
//! ```text
//! TlsConfig
//!     → manager.rs (initialize / reload / destroy)
//!     → context.rs (certificates, key, roots, CRLs, cipher policy)
//!         → keyfile.rs (ownership and mode of the private key)
//!     → Arc<TlsContext> snapshot
//!     → session.rs (one rustls session per connection)
//! ```

pub mod context;
pub mod keyfile;
pub mod manager;
pub mod session;

pub use context::TlsContext;
pub use manager::ChannelManager;
pub use session::TlsSession;
