//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the secure channel server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Encrypted transport settings.
    pub tls: TlsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Startup, reload and shutdown behaviour.
    pub lifecycle: LifecycleConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:5433").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:5433".to_string(),
            max_connections: 100,
        }
    }
}

/// TLS configuration for client connections.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Offer encrypted sessions at all.
    pub enabled: bool,

    /// Server certificate chain (PEM).
    pub cert_file: PathBuf,

    /// Server private key (PEM). Ownership and mode are checked before use.
    pub key_file: PathBuf,

    /// Trust roots for client certificates (PEM).
    pub ca_file: Option<PathBuf>,

    /// Certificate revocation lists (PEM). Ignored without `ca_file`.
    pub crl_file: Option<PathBuf>,

    /// DH parameters (PEM). Checked for readability only.
    pub dh_params_file: Option<PathBuf>,

    /// Accepted cipher suites, e.g. "DEFAULT:!TLS13_AES_128_GCM_SHA256".
    pub ciphers: String,

    /// Key exchange group, e.g. "prime256v1".
    pub ecdh_curve: String,

    /// Let the server's cipher order win over the client's.
    pub prefer_server_ciphers: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: PathBuf::from("server.crt"),
            key_file: PathBuf::from("server.key"),
            ca_file: None,
            crl_file: None,
            dh_params_file: None,
            ciphers: "DEFAULT".to_string(),
            ecdh_curve: "prime256v1".to_string(),
            prefer_server_ciphers: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Reload automatically when the config file changes.
    pub watch_config: bool,

    /// How long shutdown waits for connections to drain, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            watch_config: false,
            shutdown_grace_secs: 10,
        }
    }
}
