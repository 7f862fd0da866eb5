//! Device connection
//!
//! One bidirectional stream between the fabric and an adaptor for a single
//! device. The receive loop classifies how a stream ends:
//! - Active close (`stop` was called): exit without notifying
//! - Passive close (the adaptor went away): notify closed, exit
//! - Any other error: notify the error, keep reading

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use limb_api::{
    ConnectRequest, ConnectResponse, DeviceModel, ErrorStatus, Frame, FrameReader, FrameWriter,
    MessageType, References,
};

use crate::error::{FabricError, Result};
use crate::notifier::ConnectionNotifier;
use crate::types::DeviceKey;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared between the connection handle and its receive loop
#[derive(Default)]
struct ConnectionState {
    /// `stop` was called
    stopped: AtomicBool,
    /// The receive loop has exited
    closed: AtomicBool,
}

/// A device's live session with an adaptor
pub struct Connection {
    adaptor: String,
    device: DeviceKey,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    state: Arc<ConnectionState>,
    token: CancellationToken,
}

impl Connection {
    /// Wrap `stream` and start its receive loop
    ///
    /// Cancelling `token` ends the receive loop silently, the same as `stop`.
    pub fn open<S>(
        adaptor: impl Into<String>,
        device: DeviceKey,
        stream: S,
        notifier: Arc<dyn ConnectionNotifier>,
        token: CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let adaptor = adaptor.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::new(write_half);
        let state = Arc::new(ConnectionState::default());

        tokio::spawn(receive_loop(
            FrameReader::new(read_half),
            adaptor.clone(),
            device.clone(),
            notifier,
            Arc::clone(&state),
            token.clone(),
        ));

        debug!(adaptor = %adaptor, device = %device, "Connection opened");

        Arc::new(Self {
            adaptor,
            device,
            writer: Mutex::new(FrameWriter::new(writer)),
            state,
            token,
        })
    }

    pub fn adaptor_name(&self) -> &str {
        &self.adaptor
    }

    pub fn device(&self) -> &DeviceKey {
        &self.device
    }

    /// Whether the connection was stopped or its stream has ended
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::SeqCst)
            || self.state.closed.load(Ordering::SeqCst)
            || self.token.is_cancelled()
    }

    /// Send one device request to the adaptor
    pub async fn send(
        &self,
        parameters: Option<serde_json::Value>,
        model: DeviceModel,
        device: String,
        references: References,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(self.closed_error());
        }

        let request = ConnectRequest {
            parameters,
            model,
            device,
            references,
        };
        let frame = Frame::json(MessageType::Connect, &request).map_err(|source| {
            FabricError::Encode {
                device: self.device.clone(),
                source,
            }
        })?;

        // A plugin that stops reading must not keep `stop` from taking the writer
        let mut writer = tokio::select! {
            _ = self.token.cancelled() => return Err(self.closed_error()),
            writer = self.writer.lock() => writer,
        };
        if self.state.stopped.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        let sent = tokio::select! {
            _ = self.token.cancelled() => return Err(self.closed_error()),
            sent = writer.send(&frame) => sent,
        };
        sent.map_err(|source| FabricError::Send {
            adaptor: self.adaptor.clone(),
            device: self.device.clone(),
            source,
        })?;

        trace!(adaptor = %self.adaptor, device = %self.device, bytes = frame.payload.len(), "Sent device request");
        Ok(())
    }

    /// Half-close the send side. Calling it again is a no-op.
    ///
    /// A send still in flight is abandoned, so its frame may be cut short.
    pub async fn stop(&self) -> Result<()> {
        if self.state.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.token.cancel();

        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => {}
            // The adaptor already went away
            Err(e) if e.is_closed() => {}
            Err(source) => {
                return Err(FabricError::Send {
                    adaptor: self.adaptor.clone(),
                    device: self.device.clone(),
                    source,
                });
            }
        }

        debug!(adaptor = %self.adaptor, device = %self.device, "Connection stopped");
        Ok(())
    }

    fn closed_error(&self) -> FabricError {
        FabricError::ConnectionClosed {
            adaptor: self.adaptor.clone(),
            device: self.device.clone(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("adaptor", &self.adaptor)
            .field("device", &self.device)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn receive_loop<S: AsyncRead>(
    mut reader: FrameReader<ReadHalf<S>>,
    adaptor: String,
    device: DeviceKey,
    notifier: Arc<dyn ConnectionNotifier>,
    state: Arc<ConnectionState>,
    token: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            result = reader.recv() => result,
        };

        match result {
            Ok(Some(frame)) => match frame.msg_type {
                MessageType::ConnectResponse => match frame.parse_json::<ConnectResponse>() {
                    Ok(response) => {
                        notifier.notice_connection_received_data(
                            &adaptor,
                            &device,
                            response.device.into_bytes(),
                        );
                    }
                    Err(e) => notifier.notice_connection_received_error(&adaptor, &device, e.to_string()),
                },
                MessageType::Error => {
                    let message = frame
                        .parse_json::<ErrorStatus>()
                        .map(|status| status.to_string())
                        .unwrap_or_else(|e| e.to_string());
                    notifier.notice_connection_received_error(&adaptor, &device, message);
                }
                other => {
                    notifier.notice_connection_received_error(
                        &adaptor,
                        &device,
                        format!("unexpected message type {other:?}"),
                    );
                }
            },
            Ok(None) => {
                closed_by_peer(&adaptor, &device, notifier.as_ref(), &state);
                break;
            }
            Err(e) if e.is_closed() => {
                closed_by_peer(&adaptor, &device, notifier.as_ref(), &state);
                break;
            }
            Err(e) => {
                warn!(adaptor = %adaptor, device = %device, error = %e, "Error receiving from adaptor");
                notifier.notice_connection_received_error(&adaptor, &device, e.to_string());
            }
        }
    }

    state.closed.store(true, Ordering::SeqCst);
    trace!(adaptor = %adaptor, device = %device, "Receive loop exited");
}

fn closed_by_peer(
    adaptor: &str,
    device: &DeviceKey,
    notifier: &dyn ConnectionNotifier,
    state: &ConnectionState,
) {
    // The peer closing in response to our own half-close is not a failure
    if state.stopped.load(Ordering::SeqCst) {
        return;
    }
    debug!(adaptor = %adaptor, device = %device, "Adaptor closed the connection");
    notifier.notice_connection_closed(adaptor, device);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::testing::{Notice, RecordingNotifier};
    use limb_api::ErrorCode;
    use std::time::Duration;
    use tokio::net::UnixStream;

    fn key() -> DeviceKey {
        DeviceKey::new("ns", "dev1")
    }

    fn response_frame(device: &str) -> Vec<u8> {
        Frame::json(
            MessageType::ConnectResponse,
            &ConnectResponse {
                device: device.to_string(),
            },
        )
        .unwrap()
        .encode()
    }

    #[tokio::test]
    async fn test_send_writes_connect_frame() {
        let (local, remote) = UnixStream::pair().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let conn = Connection::open("mqtt", key(), local, notifier, CancellationToken::new());

        conn.send(
            Some(serde_json::json!({"qos": 1})),
            DeviceModel::new("devices.example.io/v1alpha1", "MqttDevice"),
            r#"{"metadata":{"name":"dev1"}}"#.to_string(),
            References::new(),
        )
        .await
        .unwrap();

        let mut reader = FrameReader::new(remote);
        let frame = reader.recv().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::Connect);
        let request: ConnectRequest = frame.parse_json().unwrap();
        assert_eq!(request.model.kind, "MqttDevice");
        assert_eq!(request.parameters, Some(serde_json::json!({"qos": 1})));
    }

    #[tokio::test]
    async fn test_received_data_is_noticed() {
        let (local, remote) = UnixStream::pair().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let _conn = Connection::open("mqtt", key(), local, notifier.clone(), CancellationToken::new());

        let mut writer = FrameWriter::new(remote);
        writer
            .send_json(MessageType::ConnectResponse, &ConnectResponse { device: "{\"a\":1}".into() })
            .await
            .unwrap();

        let notices = notifier.wait_for(|n| !n.is_empty()).await;
        assert_eq!(
            notices[0],
            Notice::Data("mqtt".into(), key(), b"{\"a\":1}".to_vec())
        );
    }

    #[tokio::test]
    async fn test_active_close_is_silent() {
        let (local, remote) = UnixStream::pair().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let conn = Connection::open("mqtt", key(), local, notifier.clone(), CancellationToken::new());

        conn.stop().await.unwrap();
        conn.stop().await.unwrap();
        assert!(conn.is_stopped());

        // The adaptor sees EOF and hangs up in turn
        let mut reader = FrameReader::new(remote);
        assert!(reader.recv().await.unwrap().is_none());
        drop(reader);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(notifier.notices().is_empty());

        let err = conn
            .send(None, DeviceModel::default(), "{}".into(), References::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn test_passive_close_noticed_once() {
        let (local, remote) = UnixStream::pair().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let conn = Connection::open("mqtt", key(), local, notifier.clone(), CancellationToken::new());

        drop(remote);

        notifier.wait_for(|n| !n.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(notifier.notices(), vec![Notice::Closed("mqtt".into(), key())]);
        assert!(conn.is_stopped());
    }

    #[tokio::test]
    async fn test_errors_keep_loop_running() {
        let error_frame = Frame::json(
            MessageType::Error,
            &ErrorStatus::new(ErrorCode::Unavailable, "broker unreachable"),
        )
        .unwrap()
        .encode();

        let stream = tokio_test::io::Builder::new()
            .read(&error_frame)
            .read_error(std::io::Error::other("transient read failure"))
            .read(&response_frame("{}"))
            .build();

        let notifier = Arc::new(RecordingNotifier::default());
        let _conn = Connection::open("mqtt", key(), stream, notifier.clone(), CancellationToken::new());

        let notices = notifier
            .wait_for(|n| matches!(n.last(), Some(Notice::Closed(..))))
            .await;

        assert_eq!(notices.len(), 4);
        assert!(matches!(&notices[0], Notice::Error(_, _, msg) if msg.contains("broker unreachable")));
        assert!(matches!(&notices[1], Notice::Error(_, _, msg) if msg.contains("transient read failure")));
        assert_eq!(notices[2], Notice::Data("mqtt".into(), key(), b"{}".to_vec()));
        assert_eq!(notices[3], Notice::Closed("mqtt".into(), key()));
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_send() {
        // The remote end is never read, so a large frame fills the socket buffer
        let (local, _remote) = UnixStream::pair().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let conn = Connection::open("mqtt", key(), local, notifier.clone(), CancellationToken::new());

        let sending = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.send(None, DeviceModel::default(), "x".repeat(8 << 20), References::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sending.is_finished());

        tokio::time::timeout(Duration::from_secs(2), conn.stop())
            .await
            .expect("stop waited on the stalled send")
            .unwrap();

        let err = sending.await.unwrap().unwrap_err();
        assert!(matches!(err, FabricError::ConnectionClosed { .. }));
        assert!(notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_ends_loop_silently() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let token = CancellationToken::new();
        let conn = Connection::open("mqtt", key(), local, notifier.clone(), token.child_token());

        token.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(conn.is_stopped());
        assert!(notifier.notices().is_empty());
    }
}
