//! Opening and closing encrypted sessions on a connection.
//!
//! # Data Flow
//! ```text
//! open_session:
//!     manager.context() ──None──▶ stay plaintext
//!         │
//!         └─Some─▶ TlsSession::new
//!                  → handshake_step ⇄ await_readiness (until done)
//!                  → finish_handshake (peer common name)
//!                  → install as the connection's transport
//!
//! close_session:
//!     encrypted? ─no─▶ nothing to do
//!         └─yes─▶ swap back to plaintext → close_notify (never waits)
//! ```

use crate::error::Result;
use crate::net::connection::Connection;
use crate::net::socket::{IoDirection, Plaintext, Socket};
use crate::observability::metrics;
use crate::tls::{ChannelManager, TlsSession};

/// Upgrade `conn` to an encrypted session when a TLS context is active.
///
/// The handshake waits through the connection's wait primitive, so it honors
/// supervisor death and interrupts like any other blocking read. Interrupts
/// seen here only run actions that are safe without blocking.
pub fn open_session<S: Socket>(conn: &mut Connection<S>, manager: &ChannelManager) -> Result<()> {
    let Some(context) = manager.context() else {
        return Ok(());
    };
    if conn.is_encrypted() {
        tracing::debug!(connection_id = %conn.id(), "Session already encrypted");
        return Ok(());
    }

    let result = handshake(conn, TlsSession::new(&context)?);
    match result {
        Ok(session) => {
            let (version, suite) = session.describe();
            tracing::debug!(
                connection_id = %conn.id(),
                peer = session.peer().unwrap_or("anonymous"),
                version = %version,
                cipher_suite = %suite,
                "TLS session established"
            );
            metrics::record_handshake("success");
            conn.install_transport(Box::new(session));
            Ok(())
        }
        Err(e) => {
            metrics::record_handshake("failure");
            if !e.is_fatal() {
                tracing::warn!(connection_id = %conn.id(), error = %e, "TLS handshake failed");
            }
            Err(e)
        }
    }
}

fn handshake<S: Socket>(conn: &mut Connection<S>, mut session: TlsSession) -> Result<TlsSession> {
    while let Some(wait_for) = session.handshake_step(conn.socket_mut())? {
        conn.await_readiness(wait_for, IoDirection::Read, false)?;
    }
    session.finish_handshake()?;
    Ok(session)
}

/// Tear down the encrypted session, if any, and return to plaintext.
///
/// Sends close_notify without waiting for it to be written, so it is safe
/// during abrupt teardown.
pub fn close_session<S: Socket>(conn: &mut Connection<S>) {
    if !conn.is_encrypted() {
        return;
    }
    let mut session = conn.install_transport(Box::new(Plaintext));
    session.close(conn.socket_mut());
    tracing::debug!(connection_id = %conn.id(), "TLS session closed");
}
