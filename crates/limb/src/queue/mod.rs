//! Event Queue
//!
//! Every asynchronous outcome of the fabric (adaptor registration changes,
//! connection data, errors and closures) is funnelled through this queue and
//! handed to the registered reconciler handlers, one event key at a time.
//!
//! Data and error payloads live in a side cache keyed like the queue. A newer
//! payload overwrites an older one that has not been processed yet, so a
//! handler always sees the latest value.

mod event;
mod rate_limiter;
mod workqueue;

pub use event::{ConnectionStatus, EventKey};
pub use rate_limiter::ExponentialBackoff;
pub use workqueue::WorkQueue;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::config::QueueConfig;
use crate::error::FabricError;
use crate::notifier::{AdaptorNotifier, ConnectionNotifier};
use crate::types::DeviceKey;

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a handler invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Response {
    /// Process the event again after its back-off delay
    pub requeue: bool,
    /// Process the event again after this delay, resetting its back-off
    pub requeue_after: Duration,
}

impl Response {
    /// The event is fully handled
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self {
            requeue: true,
            ..Default::default()
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: delay,
        }
    }
}

/// Failure reported by a handler; the event is retried with back-off
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn other(msg: impl Into<String>) -> Self {
        HandlerError::Other(msg.into())
    }
}

pub type HandlerResult = std::result::Result<Response, HandlerError>;

/// Reconciles adaptor registration changes
#[async_trait]
pub trait AdaptorHandler: Send + Sync {
    async fn receive_adaptor_status(&self, name: &str, registered: bool) -> HandlerResult;
}

/// Reconciles what device connections report
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn receive_connection_status(
        &self,
        adaptor: &str,
        device: &DeviceKey,
        status: ConnectionStatus,
    ) -> HandlerResult;
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

pub struct EventQueue {
    queue: Arc<WorkQueue<EventKey>>,
    payloads: DashMap<EventKey, (u64, ConnectionStatus)>,
    seq: AtomicU64,
    adaptor_handler: RwLock<Option<Arc<dyn AdaptorHandler>>>,
    connection_handler: RwLock<Option<Arc<dyn ConnectionHandler>>>,
}

enum Outcome {
    /// Nothing to deliver
    Skipped,
    /// Handler result plus the sequence number of the payload it saw
    Handled(HandlerResult, Option<u64>),
}

impl EventQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new(config.base_delay(), config.max_delay())),
            payloads: DashMap::new(),
            seq: AtomicU64::new(0),
            adaptor_handler: RwLock::new(None),
            connection_handler: RwLock::new(None),
        }
    }

    /// Route adaptor registration events to `handler`, replacing any previous one
    pub fn register_adaptor_handler(&self, handler: Arc<dyn AdaptorHandler>) {
        *self.adaptor_handler.write() = Some(handler);
    }

    /// Route connection events to `handler`, replacing any previous one
    pub fn register_connection_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        *self.connection_handler.write() = Some(handler);
    }

    /// Process one event
    ///
    /// Waits while the queue is empty. Returns `false` once the queue has been
    /// shut down, which tells a worker to exit.
    pub async fn reconcile(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.dispatch(&key).await {
            Outcome::Skipped => {
                self.queue.forget(&key);
            }
            Outcome::Handled(Err(e), _) => {
                warn!(event = %key, error = %e, "Handler failed, requeueing");
                self.queue.add_rate_limited(key.clone());
            }
            Outcome::Handled(Ok(resp), _) if !resp.requeue_after.is_zero() => {
                debug!(event = %key, delay = ?resp.requeue_after, "Requeueing after delay");
                self.queue.forget(&key);
                self.queue.add_after(key.clone(), resp.requeue_after);
            }
            Outcome::Handled(Ok(resp), _) if resp.requeue => {
                debug!(event = %key, "Requeueing with back-off");
                self.queue.add_rate_limited(key.clone());
            }
            Outcome::Handled(Ok(_), consumed) => {
                self.queue.forget(&key);
                if let Some(seq) = consumed {
                    // Keep the payload if a newer one arrived while handling
                    self.payloads.remove_if(&key, |_, (current, _)| *current == seq);
                }
            }
        }

        self.queue.done(&key);
        true
    }

    async fn dispatch(&self, key: &EventKey) -> Outcome {
        match key {
            EventKey::AdaptorRegistered { name } | EventKey::AdaptorUnregistered { name } => {
                let handler = self.adaptor_handler.read().clone();
                let Some(handler) = handler else {
                    trace!(event = %key, "No adaptor handler registered");
                    return Outcome::Skipped;
                };
                let registered = matches!(key, EventKey::AdaptorRegistered { .. });
                Outcome::Handled(handler.receive_adaptor_status(name, registered).await, None)
            }
            EventKey::ConnectionReceivedData { adaptor, device }
            | EventKey::ConnectionReceivedError { adaptor, device }
            | EventKey::ConnectionClosed { adaptor, device } => {
                let handler = self.connection_handler.read().clone();
                let Some(handler) = handler else {
                    trace!(event = %key, "No connection handler registered");
                    return Outcome::Skipped;
                };

                let (seq, status) = if key.has_payload() {
                    let payload = self.payloads.get(key).map(|e| e.value().clone());
                    match payload {
                        Some((seq, status)) => (Some(seq), status),
                        None => {
                            trace!(event = %key, "Payload already consumed");
                            return Outcome::Skipped;
                        }
                    }
                } else {
                    (None, ConnectionStatus::Closed)
                };

                let result = handler
                    .receive_connection_status(adaptor, device, status)
                    .await;
                Outcome::Handled(result, seq)
            }
        }
    }

    /// Stop handing out events; blocked `reconcile` calls return `false`
    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Events waiting to be processed
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// How many times `key` has been requeued with back-off since it last succeeded
    pub fn num_requeues(&self, key: &EventKey) -> u32 {
        self.queue.num_requeues(key)
    }

    fn push_payload(&self, key: EventKey, status: ConnectionStatus) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.payloads.insert(key.clone(), (seq, status));
        self.queue.add(key);
    }
}

impl AdaptorNotifier for EventQueue {
    fn notice_adaptor_registered(&self, name: &str) {
        self.queue.add(EventKey::AdaptorRegistered {
            name: name.to_string(),
        });
    }

    fn notice_adaptor_unregistered(&self, name: &str) {
        self.queue.add(EventKey::AdaptorUnregistered {
            name: name.to_string(),
        });
    }
}

impl ConnectionNotifier for EventQueue {
    fn notice_connection_received_data(&self, adaptor: &str, device: &DeviceKey, data: Vec<u8>) {
        let key = EventKey::ConnectionReceivedData {
            adaptor: adaptor.to_string(),
            device: device.clone(),
        };
        self.push_payload(key, ConnectionStatus::Data(data));
    }

    fn notice_connection_received_error(&self, adaptor: &str, device: &DeviceKey, error: String) {
        let key = EventKey::ConnectionReceivedError {
            adaptor: adaptor.to_string(),
            device: device.clone(),
        };
        self.push_payload(key, ConnectionStatus::Error(error));
    }

    fn notice_connection_closed(&self, adaptor: &str, device: &DeviceKey) {
        self.queue.add(EventKey::ConnectionClosed {
            adaptor: adaptor.to_string(),
            device: device.clone(),
        });
    }
}
