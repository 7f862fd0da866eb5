//! Socket Watcher
//!
//! Watches the socket directory and unregisters an adaptor whose socket file
//! disappears. The registration server stays authoritative: this only catches
//! plugins that exit without anyone telling the fabric.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adaptor::{Adaptor, Adaptors};
use crate::error::Result;
use crate::notifier::AdaptorNotifier;

struct Watched {
    name: String,
    adaptor: Weak<Adaptor>,
}

pub struct SocketWatcher {
    dir: PathBuf,
    adaptors: Arc<Adaptors>,
    notifier: Arc<dyn AdaptorNotifier>,
    /// Watched endpoints by socket file name
    watched: DashMap<String, Watched>,
}

impl SocketWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        adaptors: Arc<Adaptors>,
        notifier: Arc<dyn AdaptorNotifier>,
    ) -> Self {
        Self {
            dir: dir.into(),
            adaptors,
            notifier,
            watched: DashMap::new(),
        }
    }

    /// Unregister `adaptor` once its socket file is removed
    ///
    /// Watching another adaptor on the same endpoint replaces the previous watch.
    pub fn watch(&self, adaptor: &Arc<Adaptor>) {
        debug!(adaptor = %adaptor.name(), endpoint = %adaptor.endpoint(), "Watching adaptor socket");
        self.watched.insert(
            adaptor.endpoint().to_string(),
            Watched {
                name: adaptor.name().to_string(),
                adaptor: Arc::downgrade(adaptor),
            },
        );
    }

    pub fn unwatch(&self, endpoint: &str) -> bool {
        self.watched.remove(endpoint).is_some()
    }

    pub fn is_watching(&self, endpoint: &str) -> bool {
        self.watched.contains_key(endpoint)
    }

    /// Watch the directory until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);

        let root = watch_root(&self.dir);
        let dir = root.clone();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        for file in removed_sockets(&dir, &event) {
                            let _ = tx.blocking_send(file);
                        }
                    }
                    Err(e) => {
                        error!("Socket watcher error: {}", e);
                    }
                }
            })?;

        watcher.watch(&root, RecursiveMode::NonRecursive)?;
        info!(dir = %root.display(), "Watching adaptor sockets");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                file = rx.recv() => match file {
                    Some(file) => self.socket_removed(&file).await,
                    None => break,
                },
            }
        }

        info!("Socket watcher stopped");
        Ok(())
    }

    async fn socket_removed(&self, file: &str) {
        let Some(watched) = self
            .watched
            .get(file)
            .map(|e| (e.name.clone(), e.adaptor.clone()))
        else {
            debug!(endpoint = %file, "Removed socket is not watched");
            return;
        };
        let (name, weak) = watched;

        // The plugin may have bound the same path again before we got here
        if self.dir.join(file).exists() {
            debug!(adaptor = %name, endpoint = %file, "Socket re-created, keeping adaptor");
            return;
        }

        self.watched
            .remove_if(file, |_, w| Weak::ptr_eq(&w.adaptor, &weak));

        let registered = match (weak.upgrade(), self.adaptors.get(file)) {
            (Some(watched), Some(current)) => Arc::ptr_eq(&watched, &current),
            _ => false,
        };
        if !registered {
            debug!(adaptor = %name, endpoint = %file, "Adaptor already gone");
            return;
        }

        info!(adaptor = %name, endpoint = %file, "Adaptor socket removed");
        if let Err(e) = self.adaptors.delete(file).await {
            warn!(adaptor = %name, error = %e, "Failed to stop adaptor");
        }
        self.notifier.notice_adaptor_unregistered(&name);
    }
}

/// Absolute, symlink-free form of `dir`, matching the paths in watcher events
fn watch_root(dir: &Path) -> PathBuf {
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

/// Socket file names deleted by `event`
fn removed_sockets(dir: &Path, event: &Event) -> Vec<String> {
    if !matches!(event.kind, EventKind::Remove(_)) {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|p| p.parent() == Some(dir))
        .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
        .filter(|f| limb_api::is_socket_file(f))
        .collect()
}
