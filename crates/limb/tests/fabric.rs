//! End-to-end tests: a plugin registers over the socket, a device is
//! connected through it, and the plugin disappears again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use limb::limb_api::{
    self, ConnectRequest, ConnectResponse, DeviceModel, FrameReader, FrameWriter, MessageType,
    RegisterRequest, References,
};
use limb::{
    AdaptorHandler, ConnectionHandler, ConnectionStatus, DeviceKey, DeviceLink, FabricMetrics,
    HandlerResult, LimbConfig, Manager, Response,
};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq)]
enum Seen {
    Adaptor(String, bool),
    Data(String, DeviceKey, serde_json::Value),
    Closed(String, DeviceKey),
}

struct Recorder(mpsc::UnboundedSender<Seen>);

#[async_trait]
impl AdaptorHandler for Recorder {
    async fn receive_adaptor_status(&self, name: &str, registered: bool) -> HandlerResult {
        let _ = self.0.send(Seen::Adaptor(name.to_string(), registered));
        Ok(Response::done())
    }
}

#[async_trait]
impl ConnectionHandler for Recorder {
    async fn receive_connection_status(
        &self,
        adaptor: &str,
        device: &DeviceKey,
        status: ConnectionStatus,
    ) -> HandlerResult {
        let seen = match status {
            ConnectionStatus::Data(data) => Seen::Data(
                adaptor.to_string(),
                device.clone(),
                serde_json::from_slice(&data).unwrap(),
            ),
            ConnectionStatus::Closed => Seen::Closed(adaptor.to_string(), device.clone()),
            ConnectionStatus::Error(_) => return Ok(Response::done()),
        };
        let _ = self.0.send(seen);
        Ok(Response::done())
    }
}

/// Answers every device request with the manifest it carried, marked as observed
fn echo_plugin(listener: UnixListener) {
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (r, w) = stream.into_split();
                let mut reader = FrameReader::new(r);
                let mut writer = FrameWriter::new(w);
                while let Ok(Some(frame)) = reader.recv().await {
                    let request: ConnectRequest = frame.parse_json().unwrap();
                    let mut manifest: serde_json::Value =
                        serde_json::from_str(&request.device).unwrap();
                    manifest["status"] = serde_json::json!({"observed": true});
                    let response = ConnectResponse {
                        device: manifest.to_string(),
                    };
                    if writer
                        .send_json(MessageType::ConnectResponse, &response)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
}

async fn wait_for_path(path: &Path) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("path never appeared");
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("handler dropped")
}

struct Running {
    manager: Arc<Manager>,
    metrics: Arc<FabricMetrics>,
    events: mpsc::UnboundedReceiver<Seen>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<limb::Result<()>>,
    registration: PathBuf,
}

async fn start(dir: &Path) -> Running {
    let mut config = LimbConfig::with_socket_dir(dir);
    config.workers = 2;
    config.connect_timeout_secs = 1;
    let registration = config.registration_socket_path();

    let metrics = Arc::new(FabricMetrics::global());
    let manager = Arc::new(Manager::with_metrics(config, Arc::clone(&metrics)));
    let (tx, events) = mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder(tx));
    manager.register_adaptor_handler(recorder.clone());
    manager.register_connection_handler(recorder);

    let shutdown = CancellationToken::new();
    let task = {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.start(shutdown).await })
    };
    wait_for_path(&registration).await;

    Running {
        manager,
        metrics,
        events,
        shutdown,
        task,
        registration,
    }
}

#[tokio::test]
async fn test_register_connect_and_unregister() {
    let dir = tempfile::tempdir().unwrap();
    let mut fabric = start(dir.path()).await;

    let socket = dir.path().join("mqtt.sock");
    echo_plugin(UnixListener::bind(&socket).unwrap());
    limb_api::register(
        &fabric.registration,
        &RegisterRequest::new("mqtt", "mqtt.sock", limb_api::VERSION),
    )
    .await
    .unwrap();

    let adaptors = fabric.manager.adaptors();
    let by_name = adaptors.get("mqtt").unwrap();
    let by_endpoint = adaptors.get("mqtt.sock").unwrap();
    assert!(Arc::ptr_eq(&by_name, &by_endpoint));
    assert_eq!(next(&mut fabric.events).await, Seen::Adaptor("mqtt".into(), true));

    let device = DeviceKey::new("ns", "dev1");
    let link = DeviceLink::new(
        device.clone(),
        "mqtt",
        DeviceModel::new("devices.limb.io/v1alpha1", "DummySwitch"),
    );
    let manifest = serde_json::json!({"spec": {"power": "on"}});
    fabric
        .manager
        .neurons()
        .connect(References::new(), &manifest, &link)
        .await
        .unwrap();
    assert_eq!(fabric.metrics.active_connections("mqtt"), 1);

    match next(&mut fabric.events).await {
        Seen::Data(adaptor, key, updated) => {
            assert_eq!(adaptor, "mqtt");
            assert_eq!(key, device);
            assert_eq!(updated["spec"], manifest["spec"]);
            assert_eq!(updated["status"]["observed"], true);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    std::fs::remove_file(&socket).unwrap();
    assert_eq!(next(&mut fabric.events).await, Seen::Adaptor("mqtt".into(), false));
    assert!(!fabric.manager.neurons().exist_adaptor("mqtt"));
    assert!(by_name.is_stopped());
    assert_eq!(fabric.metrics.active_connections("mqtt"), 0);

    fabric.shutdown.cancel();
    fabric.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reregistration_replaces_adaptor() {
    let dir = tempfile::tempdir().unwrap();
    let mut fabric = start(dir.path()).await;

    let socket = dir.path().join("mqtt.sock");
    echo_plugin(UnixListener::bind(&socket).unwrap());
    let request = RegisterRequest::new("mqtt", "mqtt.sock", limb_api::VERSION);

    limb_api::register(&fabric.registration, &request).await.unwrap();
    let first = fabric.manager.adaptors().get("mqtt").unwrap();
    limb_api::register(&fabric.registration, &request).await.unwrap();
    let second = fabric.manager.adaptors().get("mqtt").unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(first.is_stopped());
    assert!(!second.is_stopped());
    assert_eq!(fabric.manager.adaptors().len(), 1);

    assert_eq!(next(&mut fabric.events).await, Seen::Adaptor("mqtt".into(), true));

    fabric.shutdown.cancel();
    fabric.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_clears_registry() {
    let dir = tempfile::tempdir().unwrap();
    let mut fabric = start(dir.path()).await;

    echo_plugin(UnixListener::bind(dir.path().join("opcua.sock")).unwrap());
    limb_api::register(
        &fabric.registration,
        &RegisterRequest::new("opcua", "opcua.sock", limb_api::VERSION),
    )
    .await
    .unwrap();
    let opcua = fabric.manager.adaptors().get("opcua").unwrap();
    assert_eq!(next(&mut fabric.events).await, Seen::Adaptor("opcua".into(), true));

    let device = DeviceKey::new("ns", "valve");
    let link = DeviceLink::new(
        device.clone(),
        "opcua",
        DeviceModel::new("devices.limb.io/v1alpha1", "Valve"),
    );
    fabric
        .manager
        .neurons()
        .connect(References::new(), &serde_json::json!({"spec": {}}), &link)
        .await
        .unwrap();
    assert!(matches!(next(&mut fabric.events).await, Seen::Data(..)));
    let conn = opcua.get_connection(&device).unwrap();

    fabric.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), fabric.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(fabric.manager.adaptors().is_empty());
    assert!(opcua.is_stopped());
    assert!(conn.is_stopped());
    assert_eq!(fabric.metrics.active_connections("opcua"), 0);
    assert!(fabric.manager.queue().is_shutting_down());
    assert!(!fabric.registration.exists());

    // Stopping connections on shutdown is silent
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(seen) = fabric.events.try_recv() {
        assert!(!matches!(seen, Seen::Closed(..)), "unexpected {seen:?}");
    }
}
