//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    date_time_ymd, BasicConstraints, Certificate, CertificateParams,
    CertificateRevocationListParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyIdMethod, KeyPair, KeyUsagePurpose, RevocationReason, RevokedCertParams, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use secure_channel::config::TlsConfig;
use secure_channel::lifecycle::{InterruptHandler, InterruptToken, SupervisorWatch};
use secure_channel::net::wait::MioWaitSet;
use secure_channel::net::Connection;

/// Serial number of the client certificate issued by [`TestPki`].
pub const CLIENT_SERIAL: u64 = 42;

/// A throwaway PKI: one root, a server certificate and a client certificate.
pub struct TestPki {
    pub dir: tempfile::TempDir,
    ca: Certificate,
    ca_key: KeyPair,
    pub ca_der: CertificateDer<'static>,
    pub client_cert: CertificateDer<'static>,
    pub client_key: PrivateKeyDer<'static>,
}

impl TestPki {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name = named("test root");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params.distinguished_name = named("localhost");
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        client_params.distinguished_name = named("alice");
        client_params.serial_number = Some(SerialNumber::from(CLIENT_SERIAL));
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        fs::write(dir.path().join("root.crt"), ca.pem()).unwrap();
        fs::write(dir.path().join("server.crt"), server.pem()).unwrap();
        write_key(&dir.path().join("server.key"), &server_key.serialize_pem(), 0o600);

        Self {
            ca_der: ca.der().clone(),
            client_cert: client.der().clone(),
            client_key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(client_key.serialize_der())),
            dir,
            ca,
            ca_key,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// TLS settings pointing at this PKI, with client certificates requested.
    pub fn tls_config(&self) -> TlsConfig {
        TlsConfig {
            enabled: true,
            cert_file: self.path("server.crt"),
            key_file: self.path("server.key"),
            ca_file: Some(self.path("root.crt")),
            ..TlsConfig::default()
        }
    }

    /// Write a CRL signed by the root that revokes `serials`, returning its path.
    pub fn write_crl(&self, serials: &[u64]) -> PathBuf {
        let params = CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(2099, 1, 1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: serials
                .iter()
                .map(|&serial| RevokedCertParams {
                    serial_number: SerialNumber::from(serial),
                    revocation_time: date_time_ymd(2024, 1, 1),
                    reason_code: Some(RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params.signed_by(&self.ca, &self.ca_key).unwrap();
        let path = self.path("root.crl");
        fs::write(&path, crl.pem().unwrap()).unwrap();
        path
    }

    pub fn client_config(&self, with_cert: bool) -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_der.clone()).unwrap();
        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);

        let config = if with_cert {
            builder
                .with_client_auth_cert(vec![self.client_cert.clone()], self.client_key.clone_key())
                .unwrap()
        } else {
            builder.with_no_client_auth()
        };
        Arc::new(config)
    }
}

fn named(common_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name
}

pub fn write_key(path: &Path, pem: &str, mode: u32) {
    fs::write(path, pem).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// Blocking rustls client over one end of a socket pair.
pub fn tls_client(config: Arc<ClientConfig>, sock: UnixStream) -> StreamOwned<ClientConnection, UnixStream> {
    let conn = ClientConnection::new(config, "localhost".try_into().unwrap()).unwrap();
    StreamOwned::new(conn, sock)
}

/// Server-side connection over a socket pair end, with a real wait set.
pub fn connection<I>(
    sock: UnixStream,
    token: InterruptToken,
    supervisor: Option<SupervisorWatch>,
    interrupts: I,
) -> Connection<UnixStream>
where
    I: InterruptHandler + 'static,
{
    let waiter = MioWaitSet::new(token, supervisor).unwrap();
    Connection::new(sock, waiter, interrupts).unwrap()
}
