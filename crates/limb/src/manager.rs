//! Manager
//!
//! Owns the adaptor registry and the event queue, and runs the fabric:
//! reconciliation workers, the socket watcher and the registration server.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::adaptor::Adaptors;
use crate::config::LimbConfig;
use crate::error::Result;
use crate::metrics::FabricMetrics;
use crate::neurons::Neurons;
use crate::queue::{AdaptorHandler, ConnectionHandler, EventQueue};
use crate::registration::{RegistrationServer, SocketWatcher};

pub struct Manager {
    config: LimbConfig,
    adaptors: Arc<Adaptors>,
    queue: Arc<EventQueue>,
    neurons: Neurons,
}

impl Manager {
    /// Manager recording metrics against the global meter provider
    pub fn new(config: LimbConfig) -> Self {
        Self::with_metrics(config, Arc::new(FabricMetrics::global()))
    }

    pub fn with_metrics(config: LimbConfig, metrics: Arc<FabricMetrics>) -> Self {
        let adaptors = Arc::new(
            Adaptors::new(config.kill_timeout()).with_metrics(Arc::clone(&metrics)),
        );
        let queue = Arc::new(EventQueue::new(&config.queue));
        let neurons = Neurons::new(Arc::clone(&adaptors), metrics);
        Self {
            config,
            adaptors,
            queue,
            neurons,
        }
    }

    pub fn config(&self) -> &LimbConfig {
        &self.config
    }

    pub fn neurons(&self) -> &Neurons {
        &self.neurons
    }

    pub fn adaptors(&self) -> &Arc<Adaptors> {
        &self.adaptors
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn register_adaptor_handler(&self, handler: Arc<dyn AdaptorHandler>) {
        self.queue.register_adaptor_handler(handler);
    }

    pub fn register_connection_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        self.queue.register_connection_handler(handler);
    }

    /// Run until `shutdown` is cancelled or the registration server fails
    ///
    /// On the way out every adaptor is stopped, then the queue is shut down
    /// and the workers are awaited.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let token = shutdown.child_token();

        let mut server = RegistrationServer::new(
            self.config.clone(),
            Arc::clone(&self.adaptors),
            self.queue.clone(),
            self.queue.clone(),
        );
        let watcher = self.config.watch_sockets.then(|| {
            Arc::new(SocketWatcher::new(
                &self.config.socket_dir,
                Arc::clone(&self.adaptors),
                self.queue.clone(),
            ))
        });
        if let Some(watcher) = &watcher {
            server = server.with_watcher(Arc::clone(watcher));
        }
        let server = Arc::new(server);
        let listener = server.bind()?;

        let watcher_task = watcher.map(|watcher| {
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = watcher.run(token).await {
                    error!(error = %e, "Socket watcher failed");
                }
            })
        });

        let worker_count = self.config.worker_count();
        let workers: Vec<_> = (0..worker_count)
            .map(|_| {
                let queue = Arc::clone(&self.queue);
                tokio::spawn(async move { while queue.reconcile().await {} })
            })
            .collect();
        info!(workers = worker_count, "Fabric started");

        let result = server.serve_on(listener, token.clone()).await;
        if let Err(e) = &result {
            error!(error = %e, "Registration server failed");
        }
        token.cancel();

        self.adaptors.cleanup().await;
        self.queue.shut_down();
        join_all(workers).await;
        if let Some(task) = watcher_task {
            let _ = task.await;
        }

        info!("Fabric stopped");
        result
    }
}
