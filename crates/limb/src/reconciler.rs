//! Default reconciler
//!
//! Logs every event the queue delivers. Installed by the `limb` binary so the
//! fabric's activity is visible when no control plane is attached.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::queue::{
    AdaptorHandler, ConnectionHandler, ConnectionStatus, HandlerResult, Response,
};
use crate::types::DeviceKey;

#[derive(Debug, Default)]
pub struct LoggingReconciler;

#[async_trait]
impl AdaptorHandler for LoggingReconciler {
    async fn receive_adaptor_status(&self, name: &str, registered: bool) -> HandlerResult {
        if registered {
            info!(adaptor = %name, "Adaptor available");
        } else {
            info!(adaptor = %name, "Adaptor gone");
        }
        Ok(Response::done())
    }
}

#[async_trait]
impl ConnectionHandler for LoggingReconciler {
    async fn receive_connection_status(
        &self,
        adaptor: &str,
        device: &DeviceKey,
        status: ConnectionStatus,
    ) -> HandlerResult {
        match status {
            ConnectionStatus::Data(data) => match serde_json::from_slice::<serde_json::Value>(&data) {
                Ok(manifest) => {
                    info!(adaptor = %adaptor, device = %device, manifest = %manifest, "Device manifest updated")
                }
                Err(e) => {
                    warn!(adaptor = %adaptor, device = %device, error = %e, "Adaptor sent a manifest that is not JSON")
                }
            },
            ConnectionStatus::Error(error) => {
                warn!(adaptor = %adaptor, device = %device, error = %error, "Device connection reported an error")
            }
            ConnectionStatus::Closed => {
                info!(adaptor = %adaptor, device = %device, "Device connection closed by adaptor")
            }
        }
        Ok(Response::done())
    }
}
