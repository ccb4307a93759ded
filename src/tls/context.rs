//! Building the process-wide TLS context.
//!
//! # Responsibilities
//! - Load the certificate chain, private key, trust roots and revocation lists
//! - Turn the cipher and curve settings into a restricted crypto provider
//! - Produce an immutable [`TlsContext`] or fail without side effects
//!
//! # Cipher policy
//! ```text
//! "DEFAULT:!TLS13_CHACHA20_POLY1305_SHA256"
//!     → tokens split on ':' ',' or whitespace
//!     → DEFAULT / ALL / HIGH add every supported suite
//!     → NAME adds one suite (case-insensitive rustls name)
//!     → !NAME removes a suite for good
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider, SupportedKxGroup};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    NamedGroup, RootCertStore, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion,
};

use crate::config::TlsConfig;
use crate::error::{Result, SecureError};
use crate::tls::keyfile;

const ALL_SUITES: [&str; 3] = ["DEFAULT", "ALL", "HIGH"];

/// Immutable, shareable TLS server state.
#[derive(Debug)]
pub struct TlsContext {
    config: Arc<ServerConfig>,
    loaded_trust_roots: bool,
    cipher_suites: Vec<String>,
    kx_group: NamedGroup,
}

impl TlsContext {
    /// Build a context from `tls`.
    ///
    /// `is_server_start` only affects how loudly key file problems are logged;
    /// the caller decides whether a failure is fatal.
    pub fn build(tls: &TlsConfig, is_server_start: bool) -> Result<Self> {
        let base = ring::default_provider();
        let suites = select_cipher_suites(&tls.ciphers, &base.cipher_suites)?;
        let kx_group = select_kx_group(&tls.ecdh_curve, &base.kx_groups)?;
        let versions = protocol_versions(&suites);
        let cipher_suites = suites.iter().map(suite_name).collect();

        let certs = load_certs("server certificate", &tls.cert_file)?;

        if !keyfile::validate_key_file(&tls.key_file, is_server_start) {
            return Err(SecureError::KeyFileRejected {
                path: tls.key_file.clone(),
            });
        }
        let key = load_private_key(&tls.key_file)?;

        if let Some(path) = &tls.dh_params_file {
            // Only (EC)DHE groups are negotiated; the file must still be usable.
            fs::read(path).map_err(|source| SecureError::FileLoad {
                kind: "DH parameters",
                path: path.clone(),
                source,
            })?;
        }

        let provider = Arc::new(CryptoProvider {
            cipher_suites: suites,
            kx_groups: vec![kx_group],
            ..base
        });
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)?;

        let mut loaded_trust_roots = false;
        let mut config = match &tls.ca_file {
            Some(ca_file) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs("root certificate", ca_file)? {
                    roots.add(cert)?;
                }
                loaded_trust_roots = true;

                let crls = match &tls.crl_file {
                    Some(path) => load_crls(path)?,
                    None => Vec::new(),
                };
                // Clients are asked for a certificate but may decline.
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .with_crls(crls)
                    .allow_unauthenticated()
                    .build()?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)?
            }
            None => {
                if let Some(path) = &tls.crl_file {
                    tracing::warn!(
                        path = %path.display(),
                        "Ignoring certificate revocation list without a root certificate file"
                    );
                }
                builder.with_no_client_auth().with_single_cert(certs, key)?
            }
        };
        config.ignore_client_order = tls.prefer_server_ciphers;

        tracing::debug!(
            cert = %tls.cert_file.display(),
            curve = ?kx_group.name(),
            trust_roots = loaded_trust_roots,
            "TLS context built"
        );

        Ok(Self {
            config: Arc::new(config),
            loaded_trust_roots,
            cipher_suites,
            kx_group: kx_group.name(),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    /// Whether client certificates can be verified against loaded roots.
    pub fn has_loaded_trust_roots(&self) -> bool {
        self.loaded_trust_roots
    }

    /// Names of the accepted suites, in preference order.
    pub fn cipher_suites(&self) -> &[String] {
        &self.cipher_suites
    }

    pub fn kx_group(&self) -> NamedGroup {
        self.kx_group
    }
}

/// Map a configured curve name to its TLS group.
pub fn kx_group_name(curve: &str) -> Option<NamedGroup> {
    match curve.to_ascii_lowercase().as_str() {
        "prime256v1" | "secp256r1" | "p-256" => Some(NamedGroup::secp256r1),
        "secp384r1" | "p-384" => Some(NamedGroup::secp384r1),
        "x25519" => Some(NamedGroup::X25519),
        _ => None,
    }
}

fn select_kx_group(
    curve: &str,
    available: &[&'static dyn SupportedKxGroup],
) -> Result<&'static dyn SupportedKxGroup> {
    let name = kx_group_name(curve).ok_or_else(|| SecureError::UnknownCurve(curve.to_string()))?;
    available
        .iter()
        .copied()
        .find(|group| group.name() == name)
        .ok_or_else(|| SecureError::UnknownCurve(curve.to_string()))
}

/// Apply a cipher policy string to the provider's suites.
pub fn select_cipher_suites(
    policy: &str,
    available: &[SupportedCipherSuite],
) -> Result<Vec<SupportedCipherSuite>> {
    let mut selected: Vec<SupportedCipherSuite> = Vec::new();
    let mut excluded: Vec<SupportedCipherSuite> = Vec::new();

    let tokens = policy
        .split(|c: char| c == ':' || c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty());
    for token in tokens {
        let (negated, name) = match token.strip_prefix('!') {
            Some(name) => (true, name),
            None => (false, token),
        };

        let matches: Vec<SupportedCipherSuite> =
            if ALL_SUITES.iter().any(|kw| kw.eq_ignore_ascii_case(name)) {
                available.to_vec()
            } else {
                available
                    .iter()
                    .copied()
                    .filter(|suite| suite_name(suite).eq_ignore_ascii_case(name))
                    .collect()
            };
        if matches.is_empty() {
            tracing::warn!(cipher = name, "Ignoring unsupported cipher suite");
            continue;
        }

        let target = if negated { &mut excluded } else { &mut selected };
        for suite in matches {
            if !target.contains(&suite) {
                target.push(suite);
            }
        }
    }

    selected.retain(|suite| !excluded.contains(suite));
    if selected.is_empty() {
        return Err(SecureError::NoCipherSuites(policy.to_string()));
    }
    Ok(selected)
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn protocol_versions(suites: &[SupportedCipherSuite]) -> Vec<&'static SupportedProtocolVersion> {
    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::new();
    for suite in suites {
        let version = suite.version();
        if !versions.iter().any(|known| known.version == version.version) {
            versions.push(version);
        }
    }
    versions
}

fn open(kind: &'static str, path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| SecureError::FileLoad {
            kind,
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(kind: &'static str, path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(kind, path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|source| SecureError::FileLoad {
            kind,
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(SecureError::EmptyFile {
            kind,
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    const KIND: &str = "private key";
    let mut reader = open(KIND, path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| SecureError::FileLoad {
            kind: KIND,
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| SecureError::EmptyFile {
            kind: KIND,
            path: path.to_path_buf(),
        })
}

fn load_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    const KIND: &str = "certificate revocation list";
    let mut reader = open(KIND, path)?;
    rustls_pemfile::crls(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|source| SecureError::FileLoad {
            kind: KIND,
            path: path.to_path_buf(),
            source,
        })
}
