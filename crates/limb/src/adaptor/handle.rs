//! Adaptor handle
//!
//! One registered adaptor plugin: its channel plus the connections opened
//! through it, keyed by device.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use super::channel::AdaptorChannel;
use super::connection::Connection;
use crate::error::Result;
use crate::notifier::ConnectionNotifier;
use crate::types::DeviceKey;

pub struct Adaptor {
    name: String,
    endpoint: String,
    channel: AdaptorChannel,
    connections: DashMap<DeviceKey, Arc<Connection>>,
    notifier: Arc<dyn ConnectionNotifier>,
}

impl Adaptor {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        channel: AdaptorChannel,
        notifier: Arc<dyn ConnectionNotifier>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            channel,
            connections: DashMap::new(),
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_stopped(&self) -> bool {
        self.channel.is_closed()
    }

    /// Close the channel, then stop every connection
    ///
    /// Closing the channel first cancels every connection at once, so the
    /// adaptor counts as stopped even if this future is dropped halfway.
    /// Stopping an adaptor whose channel is already closed succeeds.
    pub async fn stop(&self) -> Result<()> {
        let closed = self.channel.close();

        let keys: Vec<DeviceKey> = self.connections.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                if let Err(e) = conn.stop().await {
                    warn!(adaptor = %self.name, device = %key, error = %e, "Failed to stop connection");
                }
            }
        }

        if closed {
            info!(adaptor = %self.name, endpoint = %self.endpoint, "Adaptor stopped");
        } else {
            debug!(adaptor = %self.name, "Adaptor channel already closed");
        }
        Ok(())
    }

    /// Close the channel and drop every connection without waiting on them
    pub fn abandon(&self) {
        self.channel.close();
        let dropped = self.connections.len();
        self.connections.clear();
        warn!(adaptor = %self.name, connections = dropped, "Adaptor abandoned");
    }

    /// Get or open the connection for `device`
    ///
    /// Returns `(overwritten, connection)`. `overwritten` is true when the
    /// device already had an entry: a live connection is returned as is, a
    /// stopped one is replaced by a freshly dialed connection.
    pub async fn create_connection(&self, device: &DeviceKey) -> Result<(bool, Arc<Connection>)> {
        let stale = match self.connections.get(device).map(|e| Arc::clone(e.value())) {
            Some(existing) if !existing.is_stopped() => return Ok((true, existing)),
            Some(existing) => Some(existing),
            None => None,
        };

        let (stream, token) = self.channel.open_stream(&self.name).await?;
        let conn = Connection::open(
            self.name.clone(),
            device.clone(),
            stream,
            Arc::clone(&self.notifier),
            token,
        );

        // Another caller may have opened the same device while we were dialing
        let (overwritten, winner, loser) = match self.connections.entry(device.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_stopped() {
                    let old = entry.insert(Arc::clone(&conn));
                    (true, conn, Some(old))
                } else {
                    (true, Arc::clone(entry.get()), Some(conn))
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&conn));
                (stale.is_some(), conn, None)
            }
        };

        for conn in loser.into_iter().chain(stale) {
            if let Err(e) = conn.stop().await {
                warn!(adaptor = %self.name, device = %device, error = %e, "Failed to stop replaced connection");
            }
        }

        debug!(adaptor = %self.name, device = %device, overwritten, "Connection ready");
        Ok((overwritten, winner))
    }

    /// Stop and forget the connection for `device`. Returns whether one existed.
    pub async fn delete_connection(&self, device: &DeviceKey) -> bool {
        match self.connections.remove(device) {
            Some((_, conn)) => {
                if let Err(e) = conn.stop().await {
                    warn!(adaptor = %self.name, device = %device, error = %e, "Failed to stop connection");
                }
                true
            }
            None => false,
        }
    }

    /// Track a connection over an already open stream
    #[cfg(test)]
    pub(crate) fn attach<S>(&self, device: DeviceKey, stream: S) -> Arc<Connection>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let conn = Connection::open(
            self.name.clone(),
            device.clone(),
            stream,
            Arc::clone(&self.notifier),
            self.channel.child_token(),
        );
        self.connections.insert(device, Arc::clone(&conn));
        conn
    }

    pub fn get_connection(&self, device: &DeviceKey) -> Option<Arc<Connection>> {
        self.connections.get(device).map(|e| Arc::clone(e.value()))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl std::fmt::Debug for Adaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adaptor")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("connections", &self.connections.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
