//! Watches the config file and the TLS material it points at.
//!
//! A change to the config file or to any certificate, key, CA, CRL or DH
//! parameters file re-reads the config file and forwards its `tls` section,
//! so rotated certificates are picked up without a SIGHUP. Parent
//! directories are watched, not the files, so replace-by-rename is seen.
//! The set of watched paths is fixed when the watcher starts.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::TlsConfig;

pub struct ConfigWatcher {
    config_path: PathBuf,
    watched: HashSet<PathBuf>,
    update_tx: mpsc::UnboundedSender<TlsConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for reloaded TLS sections.
    pub fn new(config_path: &Path, tls: &TlsConfig) -> (Self, mpsc::UnboundedReceiver<TlsConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                config_path: config_path.to_path_buf(),
                watched: watched_paths(config_path, tls),
                update_tx,
            },
            update_rx,
        )
    }

    pub fn watches(&self, path: &Path) -> bool {
        self.watched.contains(&absolute(path))
    }

    /// Start watching in a background thread.
    ///
    /// Only configurations that load and validate are forwarded; the returned
    /// handle must be kept alive for updates to keep flowing.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let directories: BTreeSet<PathBuf> = self
            .watched
            .iter()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();
        let Self {
            config_path,
            watched,
            update_tx,
        } = self;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if is_relevant(&event, &watched) => {
                    tracing::info!(
                        changed = ?event.paths,
                        "TLS material or config changed, reloading"
                    );
                    match load_config(&config_path) {
                        Ok(config) => {
                            let _ = update_tx.send(config.tls);
                        }
                        Err(e) => tracing::error!(
                            path = %config_path.display(),
                            error = %e,
                            "Failed to reload config, keeping current TLS settings"
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        for directory in &directories {
            watcher.watch(directory, RecursiveMode::NonRecursive)?;
        }
        tracing::info!(directories = directories.len(), "Config watcher started");
        Ok(watcher)
    }
}

/// The config file plus every file the TLS section loads when enabled.
fn watched_paths(config_path: &Path, tls: &TlsConfig) -> HashSet<PathBuf> {
    let mut paths = HashSet::from([absolute(config_path)]);
    if tls.enabled {
        paths.insert(absolute(&tls.cert_file));
        paths.insert(absolute(&tls.key_file));
        for path in [&tls.ca_file, &tls.crl_file, &tls.dh_params_file]
            .into_iter()
            .flatten()
        {
            paths.insert(absolute(path));
        }
    }
    paths
}

fn is_relevant(event: &Event, watched: &HashSet<PathBuf>) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|path| watched.contains(path))
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
