//! Encrypted sessions end to end against a real rustls client.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustls::{CertificateError, ProtocolVersion};

use secure_channel::config::TlsConfig;
use secure_channel::lifecycle::{DeferredActions, InterruptToken, NoInterrupts, RunMode};
use secure_channel::net::{close_session, open_session};
use secure_channel::server::echo;
use secure_channel::tls::ChannelManager;
use secure_channel::SecureError;

mod common;

use common::TestPki;

/// Accept one session on a thread, echo until close, report the peer identity.
fn spawn_echo_server(
    manager: Arc<ChannelManager>,
    sock: UnixStream,
) -> thread::JoinHandle<Result<Option<String>, SecureError>> {
    thread::spawn(move || {
        let mut conn = common::connection(sock, InterruptToken::new(), None, NoInterrupts);
        open_session(&mut conn, &manager)?;
        assert!(conn.is_encrypted());
        let peer = conn.peer_identity().map(str::to_string);
        echo(&mut conn)?;
        close_session(&mut conn);
        assert!(!conn.is_encrypted());
        Ok(peer)
    })
}

fn started_manager(tls: TlsConfig) -> Arc<ChannelManager> {
    let manager = Arc::new(ChannelManager::new(tls));
    manager.initialize(true).unwrap();
    manager
}

#[test]
fn anonymous_client_round_trip() {
    let pki = TestPki::new();
    let manager = started_manager(pki.tls_config());
    assert!(manager.has_loaded_trust_roots());

    let (server, client) = UnixStream::pair().unwrap();
    let handle = spawn_echo_server(manager, server);

    let mut tls = common::tls_client(pki.client_config(false), client);
    tls.write_all(b"hello over tls").unwrap();
    let mut buf = [0u8; 14];
    tls.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello over tls");

    tls.conn.send_close_notify();
    tls.flush().unwrap();
    drop(tls);

    assert_eq!(handle.join().unwrap().unwrap(), None);
}

#[test]
fn client_certificate_sets_peer_identity() {
    let pki = TestPki::new();
    let manager = started_manager(pki.tls_config());

    let (server, client) = UnixStream::pair().unwrap();
    let handle = spawn_echo_server(manager, server);

    let mut tls = common::tls_client(pki.client_config(true), client);
    tls.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    tls.read_exact(&mut buf).unwrap();
    tls.conn.send_close_notify();
    tls.flush().unwrap();
    drop(tls);

    assert_eq!(handle.join().unwrap().unwrap().as_deref(), Some("alice"));
}

#[test]
fn payload_spanning_many_records_echoes_intact() {
    let pki = TestPki::new();
    let manager = started_manager(pki.tls_config());

    let (server, client) = UnixStream::pair().unwrap();
    let handle = spawn_echo_server(manager, server);

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let mut tls = common::tls_client(pki.client_config(false), client);
    tls.write_all(&payload).unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tls.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, payload);

    tls.conn.send_close_notify();
    tls.flush().unwrap();
    drop(tls);
    handle.join().unwrap().unwrap();
}

#[test]
fn cipher_policy_limits_protocol_version() {
    let pki = TestPki::new();
    let manager = started_manager(TlsConfig {
        ciphers: "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384".into(),
        ecdh_curve: "x25519".into(),
        ..pki.tls_config()
    });

    let (server, client) = UnixStream::pair().unwrap();
    let handle = spawn_echo_server(manager, server);

    let mut tls = common::tls_client(pki.client_config(false), client);
    tls.write_all(b"v").unwrap();
    let mut buf = [0u8; 1];
    tls.read_exact(&mut buf).unwrap();
    assert_eq!(tls.conn.protocol_version(), Some(ProtocolVersion::TLSv1_2));

    tls.conn.send_close_notify();
    tls.flush().unwrap();
    drop(tls);
    handle.join().unwrap().unwrap();
}

#[test]
fn garbage_handshake_fails_without_being_fatal() {
    let pki = TestPki::new();
    let manager = started_manager(pki.tls_config());

    let (server, mut client) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || {
        let mut conn = common::connection(server, InterruptToken::new(), None, NoInterrupts);
        let result = open_session(&mut conn, &manager);
        (result, conn.is_encrypted())
    });

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (result, encrypted) = handle.join().unwrap();
    let err = result.unwrap_err();
    assert!(!err.is_fatal());
    assert!(!encrypted);
}

#[test]
fn disabled_tls_leaves_connection_in_plaintext() {
    let manager = started_manager(TlsConfig::default());
    let (server, _client) = UnixStream::pair().unwrap();
    let mut conn = common::connection(server, InterruptToken::new(), None, NoInterrupts);
    open_session(&mut conn, &manager).unwrap();
    assert!(!conn.is_encrypted());
    assert!(conn.peer_identity().is_none());
}

#[test]
fn exposed_key_is_fatal_at_start() {
    let pki = TestPki::new();
    let key = std::fs::read_to_string(pki.path("server.key")).unwrap();
    common::write_key(&pki.path("server.key"), &key, 0o644);

    let manager = ChannelManager::new(pki.tls_config());
    match manager.initialize(true) {
        Err(SecureError::Fatal(inner)) => {
            assert!(matches!(*inner, SecureError::KeyFileRejected { .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(manager.context().is_none());
}

#[test]
fn failed_reload_keeps_running_context() {
    let pki = TestPki::new();
    let manager = started_manager(pki.tls_config());
    let before = manager.context().unwrap();

    let broken = TlsConfig {
        cert_file: pki.path("missing.crt"),
        ..pki.tls_config()
    };
    let err = manager.reload(broken).unwrap_err();
    assert!(!err.is_fatal());

    let after = manager.context().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(manager.config().cert_file, pki.path("server.crt"));
}

#[test]
fn reload_swaps_context_and_disable_destroys_it() {
    let pki = TestPki::new();
    let manager = started_manager(pki.tls_config());
    let before = manager.context().unwrap();

    let without_roots = TlsConfig {
        ca_file: None,
        ..pki.tls_config()
    };
    manager.reload(without_roots).unwrap();
    let after = manager.context().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(!manager.has_loaded_trust_roots());
    // The old snapshot stays usable for sessions that already hold it.
    assert!(before.has_loaded_trust_roots());

    manager.reload(TlsConfig::default()).unwrap();
    assert!(manager.context().is_none());
    manager.destroy();
}

#[test]
fn blocking_action_raised_during_handshake_runs_at_next_read() {
    let pki = TestPki::new();
    let manager = started_manager(pki.tls_config());
    let token = InterruptToken::new();
    let actions = DeferredActions::new(token.clone());

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    // Raised before the client speaks, so the handshake wait is what sees it.
    actions.schedule("cancel", RunMode::MayBlock, move || {
        flag.store(true, Ordering::SeqCst);
    });

    let (server, client) = UnixStream::pair().unwrap();
    let server_actions = actions.clone();
    let handle = thread::spawn(move || {
        let mut conn = common::connection(server, token, None, server_actions);
        open_session(&mut conn, &manager).unwrap();
        let mut buf = [0u8; 2];
        let n = conn.read(&mut buf).unwrap();
        (n, ran.load(Ordering::SeqCst))
    });

    let mut tls = common::tls_client(pki.client_config(false), client);
    while tls.conn.is_handshaking() {
        tls.conn.complete_io(&mut tls.sock).unwrap();
    }
    // Let the server park in its read before any data shows up.
    thread::sleep(Duration::from_millis(200));
    tls.write_all(b"hi").unwrap();

    let (n, ran_before_data) = handle.join().unwrap();
    assert_eq!(n, 2);
    assert!(ran_before_data);
    assert_eq!(actions.pending(), 0);
}

#[test]
fn revoked_client_certificate_is_rejected() {
    let pki = TestPki::new();
    let manager = started_manager(TlsConfig {
        crl_file: Some(pki.write_crl(&[common::CLIENT_SERIAL])),
        ..pki.tls_config()
    });

    let (server, client) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || {
        let mut conn = common::connection(server, InterruptToken::new(), None, NoInterrupts);
        let result = open_session(&mut conn, &manager);
        (result, conn.is_encrypted())
    });

    let mut tls = common::tls_client(pki.client_config(true), client);
    let _ = tls.write_all(b"x");

    let (result, encrypted) = handle.join().unwrap();
    let err = result.unwrap_err();
    assert!(
        matches!(
            err,
            SecureError::Tls(rustls::Error::InvalidCertificate(CertificateError::Revoked))
        ),
        "unexpected {err:?}"
    );
    assert!(!err.is_fatal());
    assert!(!encrypted);
}

#[test]
fn crl_listing_other_serials_admits_client() {
    let pki = TestPki::new();
    let manager = started_manager(TlsConfig {
        crl_file: Some(pki.write_crl(&[common::CLIENT_SERIAL + 1])),
        ..pki.tls_config()
    });

    let (server, client) = UnixStream::pair().unwrap();
    let handle = spawn_echo_server(manager, server);

    let mut tls = common::tls_client(pki.client_config(true), client);
    tls.write_all(b"ok").unwrap();
    let mut buf = [0u8; 2];
    tls.read_exact(&mut buf).unwrap();
    tls.conn.send_close_notify();
    tls.flush().unwrap();
    drop(tls);

    assert_eq!(handle.join().unwrap().unwrap().as_deref(), Some("alice"));
}

#[test]
fn crl_without_root_certificates_is_ignored() {
    let pki = TestPki::new();
    let manager = started_manager(TlsConfig {
        ca_file: None,
        crl_file: Some(pki.write_crl(&[common::CLIENT_SERIAL])),
        ..pki.tls_config()
    });
    assert!(!manager.has_loaded_trust_roots());

    let (server, client) = UnixStream::pair().unwrap();
    let handle = spawn_echo_server(manager, server);

    let mut tls = common::tls_client(pki.client_config(false), client);
    tls.write_all(b"ok").unwrap();
    let mut buf = [0u8; 2];
    tls.read_exact(&mut buf).unwrap();
    tls.conn.send_close_notify();
    tls.flush().unwrap();
    drop(tls);

    assert_eq!(handle.join().unwrap().unwrap(), None);
}

#[test]
fn missing_dh_parameters_fail_the_build() {
    let pki = TestPki::new();
    let manager = ChannelManager::new(TlsConfig {
        dh_params_file: Some(pki.path("dhparams.pem")),
        ..pki.tls_config()
    });

    match manager.initialize(true) {
        Err(SecureError::Fatal(inner)) => assert!(
            matches!(*inner, SecureError::FileLoad { kind: "DH parameters", .. }),
            "unexpected {inner:?}"
        ),
        other => panic!("unexpected {other:?}"),
    }
    assert!(manager.context().is_none());
}

#[test]
fn readable_dh_parameters_are_accepted() {
    let pki = TestPki::new();
    std::fs::write(pki.path("dhparams.pem"), "-----BEGIN DH PARAMETERS-----\n").unwrap();
    let manager = started_manager(TlsConfig {
        dh_params_file: Some(pki.path("dhparams.pem")),
        ..pki.tls_config()
    });
    assert!(manager.context().is_some());
}
