//! Limb - adaptor connection fabric
//!
//! Lets a device reconciler hand device I/O to out-of-process adaptor plugins:
//! - Plugin self-registration over a local socket
//! - Plugin liveness tracking through the socket directory
//! - One long-lived stream per managed device
//! - A single ordered, rate-limited path for every asynchronous outcome

// Registered adaptors and their device connections
pub mod adaptor;

// Configuration
pub mod config;

pub mod error;

// Runs the fabric
pub mod manager;

pub mod metrics;

// Reconciler-facing facade
pub mod neurons;

pub mod notifier;

// Event queue and handler traits
pub mod queue;

pub mod reconciler;

// Registration server and socket watcher
pub mod registration;

// Metrics export
pub mod telemetry;

pub mod types;

pub use limb_api;

pub use adaptor::{Adaptor, Adaptors, Connection, Replacement};
pub use config::LimbConfig;
pub use error::{FabricError, Result};
pub use manager::Manager;
pub use metrics::FabricMetrics;
pub use neurons::Neurons;
pub use notifier::{AdaptorNotifier, ConnectionNotifier};
pub use queue::{
    AdaptorHandler, ConnectionHandler, ConnectionStatus, EventKey, EventQueue, HandlerError,
    HandlerResult, Response,
};
pub use reconciler::LoggingReconciler;
pub use types::{DeviceKey, DeviceLink};
