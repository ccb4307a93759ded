//! Encrypted transport strategy over a rustls server session.
//!
//! # Responsibilities
//! - Drive the server handshake one non-blocking step at a time
//! - Move application bytes through the session without ever waiting
//! - Report which readiness the session needs, which may be the opposite of
//!   the caller's direction (a read can need the socket writable)
//!
//! # Write contract
//! Once plaintext has been accepted into the session but its records could
//! not all reach the socket, `send` reports would-block. The caller repeats
//! the call with the same buffer; the retry drains the pending records and
//! reports the byte count accepted the first time.

use std::io::{self, Read, Write};

use der::asn1::ObjectIdentifier;
use der::Decode;
use rustls::ServerConnection;
use x509_cert::Certificate;

use crate::error::{Result, SecureError};
use crate::net::socket::{Socket, Transfer, Transport, WaitFor};
use crate::tls::context::TlsContext;

const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// One server-side TLS session bound to a connection.
pub struct TlsSession {
    conn: ServerConnection,
    peer: Option<String>,
    /// Plaintext length accepted by a `send` whose records are still queued.
    pending_len: Option<usize>,
}

impl TlsSession {
    pub fn new(context: &TlsContext) -> Result<Self> {
        Ok(Self {
            conn: ServerConnection::new(context.server_config())?,
            peer: None,
            pending_len: None,
        })
    }

    /// Advance the handshake as far as the socket allows.
    ///
    /// Returns `None` once the handshake is complete and every handshake
    /// record has been written, or the readiness needed to continue.
    pub(crate) fn handshake_step<S: Read + Write>(
        &mut self,
        socket: &mut S,
    ) -> Result<Option<WaitFor>> {
        loop {
            while self.conn.wants_write() {
                match self.conn.write_tls(socket) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Some(WaitFor::Writable));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(SecureError::Io(e)),
                }
            }

            if !self.conn.is_handshaking() {
                return Ok(None);
            }

            match self.conn.read_tls(socket) {
                Ok(0) => {
                    return Err(SecureError::Handshake(
                        "peer closed the connection during the handshake".to_string(),
                    ));
                }
                Ok(_) => {
                    if let Err(e) = self.conn.process_new_packets() {
                        // Best effort: tell the peer why before giving up.
                        let _ = self.conn.write_tls(socket);
                        return Err(SecureError::Tls(e));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Some(WaitFor::Readable));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SecureError::Io(e)),
            }
        }
    }

    /// Record the verified peer identity after the handshake.
    pub(crate) fn finish_handshake(&mut self) -> Result<()> {
        self.peer = match self.conn.peer_certificates().and_then(|chain| chain.first()) {
            Some(leaf) => common_name(leaf.as_ref())?,
            None => None,
        };
        Ok(())
    }

    /// Verified client certificate common name.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Negotiated protocol version and cipher suite, for logging.
    pub fn describe(&self) -> (String, String) {
        let version = self
            .conn
            .protocol_version()
            .map(|v| format!("{v:?}"))
            .unwrap_or_default();
        let suite = self
            .conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_default();
        (version, suite)
    }

    /// Write every queued TLS record to the socket.
    fn write_pending<S: Write>(&mut self, socket: &mut S) -> Transfer {
        while self.conn.wants_write() {
            match self.conn.write_tls(socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Transfer::WouldBlock(WaitFor::Writable);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Transfer::Failed(e),
            }
        }
        Transfer::Done(0)
    }
}

impl<S: Socket> Transport<S> for TlsSession {
    fn recv(&mut self, socket: &mut S, buf: &mut [u8]) -> Transfer {
        loop {
            match self.conn.reader().read(buf) {
                // Ok(0) is a clean close_notify from the peer.
                Ok(n) => return Transfer::Done(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Transfer::Failed(io::Error::new(io::ErrorKind::ConnectionReset, e));
                }
                Err(e) => return Transfer::Failed(e),
            }

            // No plaintext buffered: records we owe the peer go first.
            if self.conn.wants_write() {
                match self.write_pending(socket) {
                    Transfer::Done(_) => continue,
                    other => return other,
                }
            }

            match self.conn.read_tls(socket) {
                Ok(_) => {
                    if let Err(e) = self.conn.process_new_packets() {
                        let _ = self.conn.write_tls(socket);
                        return Transfer::Failed(io::Error::new(io::ErrorKind::InvalidData, e));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Transfer::WouldBlock(WaitFor::Readable);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Transfer::Failed(e),
            }
        }
    }

    fn send(&mut self, socket: &mut S, buf: &[u8]) -> Transfer {
        match self.write_pending(socket) {
            Transfer::Done(_) => {}
            other => return other,
        }
        if let Some(accepted) = self.pending_len.take() {
            return Transfer::Done(accepted);
        }
        if buf.is_empty() {
            return Transfer::Done(0);
        }

        let accepted = match self.conn.writer().write(buf) {
            Ok(n) => n,
            Err(e) => return Transfer::Failed(e),
        };
        match self.write_pending(socket) {
            Transfer::Done(_) => Transfer::Done(accepted),
            Transfer::WouldBlock(wait_for) => {
                self.pending_len = Some(accepted);
                Transfer::WouldBlock(wait_for)
            }
            failed => failed,
        }
    }

    fn flush(&mut self, socket: &mut S) -> Transfer {
        self.write_pending(socket)
    }

    fn close(&mut self, socket: &mut S) {
        self.conn.send_close_notify();
        let _ = self.write_pending(socket);
    }

    fn is_encrypted(&self) -> bool {
        true
    }

    fn peer_identity(&self) -> Option<&str> {
        self.peer()
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("peer", &self.peer)
            .field("handshaking", &self.conn.is_handshaking())
            .field("pending_len", &self.pending_len)
            .finish_non_exhaustive()
    }
}

/// Subject common name of a DER certificate, if it carries one.
pub fn common_name(der: &[u8]) -> Result<Option<String>> {
    let cert = Certificate::from_der(der)
        .map_err(|e| SecureError::Handshake(format!("could not parse client certificate: {e}")))?;

    for rdn in cert.tbs_certificate.subject.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid != COMMON_NAME {
                continue;
            }
            let raw = atv.value.value();
            if raw.contains(&0) {
                return Err(SecureError::Handshake(
                    "client certificate common name contains embedded null".to_string(),
                ));
            }
            return Ok(Some(String::from_utf8_lossy(raw).into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn cert_with_subject(cn: Option<&str>) -> Vec<u8> {
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Example");
        if let Some(cn) = cn {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn extracts_common_name() {
        let der = cert_with_subject(Some("alice"));
        assert_eq!(common_name(&der).unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn missing_common_name_is_anonymous() {
        let der = cert_with_subject(None);
        assert_eq!(common_name(&der).unwrap(), None);
    }

    #[test]
    fn embedded_null_is_rejected() {
        let der = cert_with_subject(Some("alice\0admin"));
        assert!(matches!(common_name(&der), Err(SecureError::Handshake(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(common_name(b"not a certificate").is_err());
    }
}
