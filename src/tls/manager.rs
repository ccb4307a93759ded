//! Process-wide TLS context lifecycle.
//!
//! # Responsibilities
//! - Build the context once at server start, failing hard on error
//! - Rebuild it on reload without disturbing the running context on error
//! - Hand out snapshots to connections opening a session
//!
//! # Design Decisions
//! - The context is immutable; reload builds a new one and swaps it in
//! - Sessions keep the snapshot they started with until they end
//! - Readers never take a lock (`ArcSwapOption`)

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::config::TlsConfig;
use crate::error::{Result, Severity};
use crate::observability::metrics;
use crate::tls::context::TlsContext;

/// Owner of the active TLS context.
pub struct ChannelManager {
    config: ArcSwap<TlsConfig>,
    context: ArcSwapOption<TlsContext>,
}

impl ChannelManager {
    pub fn new(config: TlsConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            context: ArcSwapOption::empty(),
        }
    }

    /// Build the context from the current configuration and install it.
    ///
    /// At server start a failure is returned as a fatal error. Otherwise it is
    /// logged, returned, and the previous context stays in place.
    pub fn initialize(&self, is_server_start: bool) -> Result<()> {
        let config = self.config.load_full();
        if !config.enabled {
            tracing::debug!("TLS disabled, connections stay in plaintext");
            return Ok(());
        }

        match TlsContext::build(&config, is_server_start) {
            Ok(context) => {
                self.install(context);
                Ok(())
            }
            Err(e) => {
                metrics::record_context_init("failure");
                Severity::for_server_start(is_server_start)
                    .report(&e, "Could not initialize TLS context");
                if is_server_start {
                    Err(e.fatal())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Adopt a new TLS configuration.
    ///
    /// Nothing changes unless the new context builds; disabling TLS drops
    /// the current context.
    pub fn reload(&self, config: TlsConfig) -> Result<()> {
        if !config.enabled {
            self.config.store(Arc::new(config));
            self.destroy();
            return Ok(());
        }

        match TlsContext::build(&config, false) {
            Ok(context) => {
                self.config.store(Arc::new(config));
                self.install(context);
                Ok(())
            }
            Err(e) => {
                metrics::record_context_init("failure");
                Severity::Log.report(&e, "Could not reload TLS context, keeping previous one");
                Err(e)
            }
        }
    }

    /// Release the context. Safe to call repeatedly or with none installed.
    pub fn destroy(&self) {
        if self.context.swap(None).is_some() {
            tracing::info!("TLS context destroyed");
        }
    }

    pub fn has_loaded_trust_roots(&self) -> bool {
        self.context
            .load_full()
            .is_some_and(|context| context.has_loaded_trust_roots())
    }

    /// Snapshot of the active context, if any.
    pub fn context(&self) -> Option<Arc<TlsContext>> {
        self.context.load_full()
    }

    pub fn config(&self) -> Arc<TlsConfig> {
        self.config.load_full()
    }

    fn install(&self, context: TlsContext) {
        metrics::record_context_init("success");
        tracing::info!(
            cipher_suites = context.cipher_suites().len(),
            curve = ?context.kx_group(),
            trust_roots = context.has_loaded_trust_roots(),
            "TLS context initialized"
        );
        self.context.store(Some(Arc::new(context)));
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("enabled", &self.config.load().enabled)
            .field("active", &self.context.load().is_some())
            .finish()
    }
}
