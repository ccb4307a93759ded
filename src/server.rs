//! Per-connection serving.
//!
//! # Data Flow
//! ```text
//! Listener::accept (tokio task)
//!     → spawn_connection (dedicated OS thread)
//!         → Connection::new (wait set bound to supervisor + interrupt token)
//!         → ConnectionTracker::register
//!         → open_session → echo loop → close_session
//! ```
//!
//! Each connection owns its thread for its whole life; the blocking read and
//! write calls park only that thread.

use std::net::{Shutdown as SocketShutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;

use tokio::sync::broadcast;

use crate::error::Result;
use crate::lifecycle::interrupts::{DeferredActions, InterruptToken};
use crate::lifecycle::shutdown::ConnectionTracker;
use crate::lifecycle::supervisor::SupervisorWatch;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::net::socket::Socket;
use crate::net::wait::MioWaitSet;
use crate::net::{close_session, open_session, Connection};
use crate::tls::ChannelManager;

const ECHO_BUFFER: usize = 8192;

/// Everything a connection thread needs from the server.
#[derive(Clone)]
pub struct ServerContext {
    pub manager: Arc<ChannelManager>,
    pub supervisor: SupervisorWatch,
    pub tracker: Arc<ConnectionTracker>,
}

/// Accept connections until shutdown is signalled.
pub async fn run(
    listener: Listener,
    context: ServerContext,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr, permit)) => {
                    if let Err(e) = spawn_connection(stream, peer_addr, permit, context.clone()) {
                        tracing::error!(peer_addr = %peer_addr, error = %e, "Failed to spawn connection thread");
                    }
                }
                Err(ListenerError::Closed) => break,
                Err(e) => tracing::warn!(error = %e, "Accept failed"),
            },
            _ = shutdown.recv() => {
                tracing::info!(
                    in_use = listener.in_use(),
                    max_connections = listener.max_connections(),
                    "Listener stopped accepting connections"
                );
                break;
            }
        }
    }
}

/// Serve `stream` on its own thread; the permit is released when it ends.
pub fn spawn_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    permit: ConnectionPermit,
    context: ServerContext,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("conn-{peer_addr}"))
        .spawn(move || {
            let _permit = permit;
            match serve_connection(stream, &context) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(peer_addr = %peer_addr, error = %e, "Connection terminated");
                }
                Err(e) => {
                    tracing::info!(peer_addr = %peer_addr, error = %e, "Connection ended with error");
                }
            }
        })
}

/// Run one connection: negotiate, echo until EOF, close.
pub fn serve_connection(stream: TcpStream, context: &ServerContext) -> Result<()> {
    let token = InterruptToken::new();
    let actions = DeferredActions::new(token.clone());
    let waiter = MioWaitSet::new(token, Some(context.supervisor.clone()))?;
    let closer = stream.try_clone()?;

    let mut conn = Connection::new(stream, waiter, actions.clone())?;
    let _tracked = context.tracker.register(conn.id(), actions, move || {
        let _ = closer.shutdown(SocketShutdown::Both);
    });
    tracing::debug!(connection_id = %conn.id(), "Connection opened");

    let result = open_session(&mut conn, &context.manager).and_then(|()| echo(&mut conn));
    close_session(&mut conn);

    tracing::debug!(connection_id = %conn.id(), "Connection closed");
    result
}

/// Write back everything read until the peer closes.
pub fn echo<S: Socket>(conn: &mut Connection<S>) -> Result<()> {
    let mut buf = [0u8; ECHO_BUFFER];
    loop {
        let n = conn.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        let mut sent = 0;
        while sent < n {
            sent += conn.write(&buf[sent..n])?;
        }
        conn.flush()?;
    }
}
