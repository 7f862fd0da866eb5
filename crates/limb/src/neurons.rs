//! Neurons
//!
//! The face the device reconciler talks to: is an adaptor there, connect a
//! device through it, disconnect it again.

use std::sync::Arc;
use std::time::Instant;

use limb_api::{ProtocolError, References};
use tracing::{debug, warn};

use crate::adaptor::Adaptors;
use crate::error::{FabricError, Result};
use crate::metrics::FabricMetrics;
use crate::types::DeviceLink;

#[derive(Clone)]
pub struct Neurons {
    adaptors: Arc<Adaptors>,
    metrics: Arc<FabricMetrics>,
}

impl Neurons {
    pub fn new(adaptors: Arc<Adaptors>, metrics: Arc<FabricMetrics>) -> Self {
        Self { adaptors, metrics }
    }

    pub fn exist_adaptor(&self, name: &str) -> bool {
        self.adaptors.get(name).is_some()
    }

    /// Send the device manifest to the adaptor recorded on `link`
    ///
    /// Opens the device's connection on first use and reuses it afterwards.
    pub async fn connect(
        &self,
        references: References,
        device_manifest: &serde_json::Value,
        link: &DeviceLink,
    ) -> Result<()> {
        let adaptor_name = link.adaptor_name.as_str();
        let adaptor = self
            .adaptors
            .get(adaptor_name)
            .ok_or_else(|| FabricError::AdaptorNotFound(adaptor_name.to_string()))?;

        let (overwritten, conn) = match adaptor.create_connection(&link.device).await {
            Ok(created) => created,
            Err(e) => {
                self.metrics.connect_error(adaptor_name);
                warn!(adaptor = %adaptor_name, device = %link.device, error = %e, "Failed to connect device");
                return Err(e);
            }
        };
        if !overwritten {
            self.metrics.connection_opened(adaptor_name);
        }

        let device = serde_json::to_string(device_manifest).map_err(|e| FabricError::Encode {
            device: link.device.clone(),
            source: ProtocolError::Payload(e),
        })?;

        let start = Instant::now();
        let sent = conn
            .send(link.parameters.clone(), link.model.clone(), device, references)
            .await;
        self.metrics.observe_send_latency(adaptor_name, start.elapsed());

        if let Err(e) = sent {
            self.metrics.send_error(adaptor_name);
            return Err(e);
        }
        debug!(adaptor = %adaptor_name, device = %link.device, "Device request sent");
        Ok(())
    }

    /// Drop the device's connection if there is one. Returns whether it existed.
    pub async fn disconnect(&self, link: &DeviceLink) -> bool {
        let Some(adaptor) = self.adaptors.get(&link.adaptor_name) else {
            return false;
        };
        let existed = adaptor.delete_connection(&link.device).await;
        if existed {
            self.metrics.connection_closed(&link.adaptor_name);
            debug!(adaptor = %link.adaptor_name, device = %link.device, "Device disconnected");
        }
        existed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptor::{Adaptor, AdaptorChannel};
    use crate::notifier::testing::RecordingNotifier;
    use crate::types::DeviceKey;
    use limb_api::{ConnectRequest, DeviceModel, FrameReader, MessageType};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    /// Accepts device sessions and forwards every request it reads
    fn plugin(listener: UnixListener) -> mpsc::UnboundedReceiver<ConnectRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut reader = FrameReader::new(stream);
                    while let Ok(Some(frame)) = reader.recv().await {
                        if frame.msg_type == MessageType::Connect {
                            let _ = tx.send(frame.parse_json().unwrap());
                        }
                    }
                });
            }
        });
        rx
    }

    fn link(adaptor: &str) -> DeviceLink {
        DeviceLink::new(
            DeviceKey::new("ns", "dev1"),
            adaptor,
            DeviceModel::new("devices.limb.io/v1alpha1", "DummySwitch"),
        )
        .with_parameters(serde_json::json!({"ip": "10.0.0.2"}))
    }

    /// Accepts device sessions and never reads from them
    fn silent_plugin(listener: UnixListener) {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
    }

    async fn setup(dir: &std::path::Path) -> (Neurons, Arc<FabricMetrics>, mpsc::UnboundedReceiver<ConnectRequest>) {
        let path = dir.join("mqtt.sock");
        let rx = plugin(UnixListener::bind(&path).unwrap());
        let (neurons, metrics) = install(&path).await;
        (neurons, metrics, rx)
    }

    async fn install(path: &std::path::Path) -> (Neurons, Arc<FabricMetrics>) {
        let channel = AdaptorChannel::dial("mqtt", path, Duration::from_secs(1)).await.unwrap();
        let adaptor = Arc::new(Adaptor::new(
            "mqtt",
            "mqtt.sock",
            channel,
            Arc::new(RecordingNotifier::default()),
        ));

        let adaptors = Arc::new(Adaptors::new(Duration::from_secs(1)));
        adaptors.put(adaptor).await.into_result().unwrap();
        let metrics = Arc::new(FabricMetrics::global());
        (Neurons::new(adaptors, Arc::clone(&metrics)), metrics)
    }

    #[tokio::test]
    async fn test_connect_sends_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let (neurons, metrics, mut rx) = setup(dir.path()).await;
        let manifest = serde_json::json!({"spec": {"power": "on"}});
        let mut references = References::new();
        references.insert(
            "credentials".to_string(),
            HashMap::from([("token".to_string(), b"secret".to_vec())]),
        );

        neurons
            .connect(references.clone(), &manifest, &link("mqtt"))
            .await
            .unwrap();
        neurons
            .connect(references.clone(), &manifest, &link("mqtt"))
            .await
            .unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.model.kind, "DummySwitch");
        assert_eq!(request.parameters, Some(serde_json::json!({"ip": "10.0.0.2"})));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&request.device).unwrap(),
            manifest
        );
        assert_eq!(request.references, references);
        assert!(rx.recv().await.is_some());

        // The second connect reused the connection
        assert_eq!(metrics.active_connections("mqtt"), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_adaptor() {
        let dir = tempfile::tempdir().unwrap();
        let (neurons, _, _rx) = setup(dir.path()).await;

        assert!(neurons.exist_adaptor("mqtt"));
        assert!(!neurons.exist_adaptor("opcua"));

        let err = neurons
            .connect(References::new(), &serde_json::json!({}), &link("opcua"))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::AdaptorNotFound(name) if name == "opcua"));
    }

    #[tokio::test]
    async fn test_disconnect_decrements_only_existing() {
        let dir = tempfile::tempdir().unwrap();
        let (neurons, metrics, _rx) = setup(dir.path()).await;

        assert!(!neurons.disconnect(&link("mqtt")).await);
        assert_eq!(metrics.active_connections("mqtt"), 0);

        neurons
            .connect(References::new(), &serde_json::json!({}), &link("mqtt"))
            .await
            .unwrap();
        assert_eq!(metrics.active_connections("mqtt"), 1);

        assert!(neurons.disconnect(&link("mqtt")).await);
        assert!(!neurons.disconnect(&link("mqtt")).await);
        assert_eq!(metrics.active_connections("mqtt"), 0);
    }

    #[tokio::test]
    async fn test_connect_error_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (neurons, metrics, _rx) = setup(dir.path()).await;
        std::fs::remove_file(dir.path().join("mqtt.sock")).unwrap();

        let err = neurons
            .connect(References::new(), &serde_json::json!({}), &link("mqtt"))
            .await
            .unwrap_err();

        assert!(matches!(err, FabricError::Dial { .. }));
        assert_eq!(metrics.connect_errors("mqtt"), 1);
        assert_eq!(metrics.active_connections("mqtt"), 0);
    }

    #[tokio::test]
    async fn test_disconnect_interrupts_stalled_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mqtt.sock");
        silent_plugin(UnixListener::bind(&path).unwrap());
        let (neurons, metrics) = install(&path).await;

        let manifest = serde_json::json!({"spec": {"blob": "x".repeat(8 << 20)}});
        let connecting = {
            let neurons = neurons.clone();
            tokio::spawn(async move {
                neurons
                    .connect(References::new(), &manifest, &link("mqtt"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!connecting.is_finished());

        let existed = tokio::time::timeout(Duration::from_secs(3), neurons.disconnect(&link("mqtt")))
            .await
            .expect("disconnect waited on the stalled send");
        assert!(existed);

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, FabricError::ConnectionClosed { .. }));
        assert_eq!(metrics.send_errors("mqtt"), 1);
        assert_eq!(metrics.active_connections("mqtt"), 0);
    }
}
