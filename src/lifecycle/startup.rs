//! Startup orchestration.
//!
//! # Responsibilities
//! - Load and validate configuration
//! - Build the TLS context before any connection is accepted
//! - Turn fatal errors into process exit
//! - Re-read configuration on reload requests
//!
//! # Design Decisions
//! - Fail fast: any TLS setup error at startup is fatal
//! - A missing config file means defaults; a broken one is an error

use std::path::Path;

use crate::config::loader::{load_config, ConfigError};
use crate::config::{ServerConfig, TlsConfig};
use crate::error::SecureError;
use crate::tls::ChannelManager;

/// Load the config at `path`, falling back to defaults if it does not exist.
pub fn load_or_default(path: &Path) -> Result<ServerConfig, ConfigError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(ServerConfig::default());
    }
    load_config(path)
}

/// Exit the process with status 1 if `result` holds a fatal error.
pub fn exit_on_fatal<T>(result: Result<T, SecureError>) -> Result<T, SecureError> {
    match result {
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "Fatal error, exiting");
            std::process::exit(1);
        }
        other => other,
    }
}

/// Re-read the config file and hand its TLS section to the manager.
///
/// Failures are logged and leave the running configuration in place.
pub fn reload_tls(path: &Path, manager: &ChannelManager) {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Config reload failed");
            return;
        }
    };
    apply_reload(config.tls, manager);
}

/// Install an already validated TLS section.
pub fn apply_reload(tls: TlsConfig, manager: &ChannelManager) {
    // Rebuilt even when unchanged: the files behind the paths may be new.
    let enabled = tls.enabled;
    if manager.reload(tls).is_ok() {
        tracing::info!(enabled, "TLS configuration reloaded");
    }
}
