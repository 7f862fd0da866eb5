//! Adaptor Registry
//!
//! Indexes every live adaptor under both its name and its endpoint. Mutations
//! are serialized so an adaptor is always reachable by both keys or by
//! neither; lookups never wait on them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::handle::Adaptor;
use crate::error::{FabricError, Result};
use crate::metrics::FabricMetrics;

/// What `Adaptors::put` did
#[derive(Debug)]
#[must_use]
pub struct Replacement {
    /// Adaptors taken out of the registry, stopped or abandoned
    pub displaced: Vec<Arc<Adaptor>>,
    /// `Err` if a displaced adaptor did not stop in time and the new one was not installed
    pub result: Result<()>,
}

impl Replacement {
    pub fn into_result(self) -> Result<Vec<Arc<Adaptor>>> {
        self.result.map(|()| self.displaced)
    }
}

pub struct Adaptors {
    index: DashMap<String, Arc<Adaptor>>,
    write_lock: Mutex<()>,
    kill_timeout: Duration,
    metrics: Option<Arc<FabricMetrics>>,
}

impl Adaptors {
    pub fn new(kill_timeout: Duration) -> Self {
        Self {
            index: DashMap::new(),
            write_lock: Mutex::new(()),
            kill_timeout,
            metrics: None,
        }
    }

    /// Reset connection metrics of adaptors as they leave the registry
    pub fn with_metrics(mut self, metrics: Arc<FabricMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Look up an adaptor by name or endpoint
    pub fn get(&self, name_or_endpoint: &str) -> Option<Arc<Adaptor>> {
        self.index.get(name_or_endpoint).map(|e| Arc::clone(e.value()))
    }

    /// Install `adaptor`, stopping whatever it replaces
    ///
    /// An adaptor registered under the same name, or bound to the same
    /// endpoint, is removed and stopped first. One that does not stop within
    /// the kill timeout is abandoned, and the new adaptor is closed instead of
    /// installed. Either way the displaced adaptors are gone from the registry.
    pub async fn put(&self, adaptor: Arc<Adaptor>) -> Replacement {
        let _guard = self.write_lock.lock().await;

        let mut displaced: Vec<Arc<Adaptor>> = Vec::new();
        for key in [adaptor.name(), adaptor.endpoint()] {
            if let Some(previous) = self.get(key) {
                if !displaced.iter().any(|a| Arc::ptr_eq(a, &previous)) {
                    displaced.push(previous);
                }
            }
        }

        for previous in &displaced {
            self.unindex(previous);
            info!(
                adaptor = %previous.name(),
                endpoint = %previous.endpoint(),
                "Replacing registered adaptor"
            );
        }

        let stopped = join_all(displaced.iter().map(|a| self.stop_adaptor(a))).await;
        if let Some(e) = stopped.into_iter().find_map(|r| r.err()) {
            adaptor.abandon();
            return Replacement {
                displaced,
                result: Err(e),
            };
        }

        self.index
            .insert(adaptor.name().to_string(), Arc::clone(&adaptor));
        self.index
            .insert(adaptor.endpoint().to_string(), Arc::clone(&adaptor));

        info!(adaptor = %adaptor.name(), endpoint = %adaptor.endpoint(), "Adaptor registered");
        Replacement {
            displaced,
            result: Ok(()),
        }
    }

    /// Stop and remove the adaptor reachable by `name_or_endpoint`
    pub async fn delete(&self, name_or_endpoint: &str) -> Result<Option<Arc<Adaptor>>> {
        let _guard = self.write_lock.lock().await;

        let Some(adaptor) = self.get(name_or_endpoint) else {
            return Ok(None);
        };
        self.unindex(&adaptor);
        self.stop_adaptor(&adaptor).await?;

        info!(adaptor = %adaptor.name(), "Adaptor unregistered");
        Ok(Some(adaptor))
    }

    /// Stop and remove every adaptor
    pub async fn cleanup(&self) {
        let _guard = self.write_lock.lock().await;

        let adaptors = self.unique();
        for adaptor in &adaptors {
            self.unindex(adaptor);
        }

        let results = join_all(adaptors.iter().map(|a| self.stop_adaptor(a))).await;
        for (adaptor, result) in adaptors.iter().zip(results) {
            if let Err(e) = result {
                warn!(adaptor = %adaptor.name(), error = %e, "Adaptor did not stop cleanly");
            }
        }

        info!(count = adaptors.len(), "Adaptor registry cleaned up");
    }

    /// Names of all registered adaptors
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.unique().iter().map(|a| a.name().to_string()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.unique().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn unique(&self) -> Vec<Arc<Adaptor>> {
        self.index
            .iter()
            .filter(|e| e.key() == e.value().name())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Remove only the index entries that still point at `adaptor`
    fn unindex(&self, adaptor: &Arc<Adaptor>) {
        for key in [adaptor.name(), adaptor.endpoint()] {
            self.index.remove_if(key, |_, v| Arc::ptr_eq(v, adaptor));
        }
        if let Some(metrics) = &self.metrics {
            metrics.adaptor_removed(adaptor.name());
        }
    }

    /// Stop `adaptor`, abandoning it once the kill timeout passes
    async fn stop_adaptor(&self, adaptor: &Adaptor) -> Result<()> {
        match tokio::time::timeout(self.kill_timeout, adaptor.stop()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(adaptor = %adaptor.name(), timeout = ?self.kill_timeout, "Adaptor did not stop in time");
                adaptor.abandon();
                Err(FabricError::ReplacementTimeout {
                    adaptor: adaptor.name().to_string(),
                    timeout: self.kill_timeout,
                })
            }
        }
    }
}
