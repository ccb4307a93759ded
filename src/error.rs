//! Error types shared by every subsystem.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for secure channel operations.
pub type Result<T> = std::result::Result<T, SecureError>;

/// Errors raised while setting up, using or tearing down a secure channel.
#[derive(Debug, Error)]
pub enum SecureError {
    /// The private key file could not be stat'ed.
    #[error("could not access private key file \"{}\": {source}", .path.display())]
    KeyFileAccess { path: PathBuf, source: io::Error },

    /// The private key path exists but is not a regular file.
    #[error("private key file \"{}\" is not a regular file", .path.display())]
    KeyFileNotRegular { path: PathBuf },

    /// The private key file belongs to someone other than the server user or root.
    #[error("private key file \"{}\" must be owned by the server user or root", .path.display())]
    KeyFileOwner { path: PathBuf, owner: u32 },

    /// The private key file is readable beyond what its owner allows.
    #[error(
        "private key file \"{}\" has group or world access (mode {mode:04o}); \
         it must be u=rw (0600) or less if owned by the server user, \
         or u=rw,g=r (0640) or less if owned by root",
        .path.display()
    )]
    KeyFilePermissions { path: PathBuf, mode: u32 },

    /// Validation already reported why the key file was refused.
    #[error("private key file \"{}\" was rejected", .path.display())]
    KeyFileRejected { path: PathBuf },

    /// A credential file could not be read.
    #[error("could not load {kind} file \"{}\": {source}", .path.display())]
    FileLoad {
        kind: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    /// A credential file parsed but held nothing usable.
    #[error("{kind} file \"{}\" contains no usable entries", .path.display())]
    EmptyFile { kind: &'static str, path: PathBuf },

    /// The cipher policy selected nothing the TLS provider supports.
    #[error("no cipher suite in \"{0}\" is supported")]
    NoCipherSuites(String),

    /// The configured ECDH curve is not known.
    #[error("ECDH curve \"{0}\" is not supported")]
    UnknownCurve(String),

    /// The TLS provider rejected the configuration or a session.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The client certificate verifier could not be built.
    #[error("could not build client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    /// The handshake did not complete.
    #[error("could not accept TLS connection: {0}")]
    Handshake(String),

    /// The supervising process went away while this connection was waiting.
    #[error("terminating connection due to unexpected supervisor exit")]
    SupervisorDied,

    /// The connection was torn down by an earlier fatal error.
    #[error("connection already terminated")]
    Terminated,

    /// An error that must stop the server.
    #[error("fatal: {0}")]
    Fatal(#[source] Box<SecureError>),

    /// Socket or transport error, including would-block.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SecureError {
    /// Whether the error requires the executing context to terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SecureError::SupervisorDied | SecureError::Fatal(_))
    }

    /// Whether this is a would-block indication from a non-blocking connection.
    pub fn is_would_block(&self) -> bool {
        matches!(self, SecureError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    pub(crate) fn fatal(self) -> Self {
        match self {
            SecureError::Fatal(_) => self,
            other => SecureError::Fatal(Box::new(other)),
        }
    }
}

impl From<SecureError> for io::Error {
    fn from(err: SecureError) -> Self {
        match err {
            SecureError::Io(e) => e,
            SecureError::SupervisorDied | SecureError::Terminated => {
                io::Error::new(io::ErrorKind::ConnectionAborted, err)
            }
            other => io::Error::other(other),
        }
    }
}

/// How loudly a failure is reported, mirroring whether it stops the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Server start: the failure terminates the server.
    Fatal,
    /// Reload or runtime: the failure is logged and prior state is kept.
    Log,
}

impl Severity {
    pub fn for_server_start(is_server_start: bool) -> Self {
        if is_server_start {
            Severity::Fatal
        } else {
            Severity::Log
        }
    }

    /// Emit `err` at the level matching this severity.
    pub fn report(self, err: &SecureError, what: &str) {
        match self {
            Severity::Fatal => tracing::error!(error = %err, "{}", what),
            Severity::Log => tracing::warn!(error = %err, "{}", what),
        }
    }
}
