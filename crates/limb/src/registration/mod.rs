//! Registration Server
//!
//! Adaptor plugins announce themselves on the registration socket
//! (`<socket_dir>/limb.sock`) with a `Register` frame naming their own socket
//! file. The server validates the request, dials the plugin, installs it in
//! the registry and replies `Ok` or `Error` before any reconciliation runs.

pub mod watcher;

pub use watcher::SocketWatcher;

use std::sync::Arc;

use limb_api::{
    ErrorStatus, FrameReader, FrameWriter, MessageType, ProtocolError, RegisterRequest,
    is_qualified_name, is_socket_file, is_supported_version,
};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adaptor::{Adaptor, AdaptorChannel, Adaptors};
use crate::config::LimbConfig;
use crate::error::{FabricError, Result};
use crate::notifier::{AdaptorNotifier, ConnectionNotifier};

pub struct RegistrationServer {
    config: LimbConfig,
    adaptors: Arc<Adaptors>,
    watcher: Option<Arc<SocketWatcher>>,
    adaptor_notifier: Arc<dyn AdaptorNotifier>,
    connection_notifier: Arc<dyn ConnectionNotifier>,
}

impl RegistrationServer {
    pub fn new(
        config: LimbConfig,
        adaptors: Arc<Adaptors>,
        adaptor_notifier: Arc<dyn AdaptorNotifier>,
        connection_notifier: Arc<dyn ConnectionNotifier>,
    ) -> Self {
        Self {
            config,
            adaptors,
            watcher: None,
            adaptor_notifier,
            connection_notifier,
        }
    }

    /// Hand every registered adaptor to `watcher`
    pub fn with_watcher(mut self, watcher: Arc<SocketWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Remove socket files left behind by a previous run
    pub fn purge_stale_sockets(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.config.socket_dir)?;

        let mut purged = 0;
        for entry in std::fs::read_dir(&self.config.socket_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(limb_api::SOCKET_SUFFIX) || entry.file_type()?.is_dir() {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(socket = %name, "Removed stale socket");
                    purged += 1;
                }
                Err(e) => warn!(socket = %name, error = %e, "Failed to remove stale socket"),
            }
        }
        Ok(purged)
    }

    /// Purge stale sockets and bind the registration socket
    pub fn bind(&self) -> Result<UnixListener> {
        let purged = self.purge_stale_sockets()?;
        if purged > 0 {
            info!(count = purged, "Purged stale sockets");
        }
        let path = self.config.registration_socket_path();
        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "Registration server listening");
        Ok(listener)
    }

    /// Accept registrations until `shutdown` is cancelled
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind()?;
        self.serve_on(listener, shutdown).await
    }

    /// Accept registrations on an already bound listener
    pub async fn serve_on(self: Arc<Self>, listener: UnixListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let server = Arc::clone(&self);
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            server.handle_client(stream, token).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept registration connection");
                    }
                },
            }
        }

        let path = self.config.registration_socket_path();
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "Registration socket already gone");
        }
        info!("Registration server stopped");
        Ok(())
    }

    async fn handle_client(&self, stream: UnixStream, shutdown: CancellationToken) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return,
                frame = reader.recv() => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) if e.is_closed() => return,
                Err(
                    e @ (ProtocolError::UnknownMessageType(_)
                    | ProtocolError::FrameTooLarge(_)
                    | ProtocolError::EmptyFrame),
                ) => {
                    let status = ErrorStatus::invalid_argument(e.to_string());
                    if reply(&mut writer, Err(status)).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "Registration connection failed");
                    return;
                }
            };

            let outcome = match frame.msg_type {
                MessageType::Register => match frame.parse_json::<RegisterRequest>() {
                    Ok(request) => self.register(&request).await.map_err(|e| e.to_status()),
                    Err(e) => Err(ErrorStatus::invalid_argument(format!("malformed request: {e}"))),
                },
                other => Err(ErrorStatus::invalid_argument(format!(
                    "unexpected message {other:?}"
                ))),
            };

            if let Err(e) = reply(&mut writer, outcome).await {
                debug!(error = %e, "Failed to reply to registering adaptor");
                return;
            }
        }
    }

    /// Validate, dial and install an adaptor
    ///
    /// The reply does not wait for reconciliation of the new adaptor: the
    /// registration event is only queued.
    pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
        validate(request)?;

        let path = self.config.endpoint_path(&request.endpoint);
        let channel = match AdaptorChannel::dial(&request.name, &path, self.config.connect_timeout()).await {
            Ok(channel) => channel,
            Err(e) => {
                error!(adaptor = %request.name, endpoint = %request.endpoint, error = %e, "Failed to dial adaptor");
                return Err(e);
            }
        };

        let adaptor = Arc::new(Adaptor::new(
            request.name.clone(),
            request.endpoint.clone(),
            channel,
            Arc::clone(&self.connection_notifier),
        ));
        let replacement = self.adaptors.put(Arc::clone(&adaptor)).await;
        let installed = replacement.result.is_ok();
        for previous in &replacement.displaced {
            // A same-name adaptor that was replaced is announced as registered below
            if !installed || previous.name() != adaptor.name() {
                self.adaptor_notifier.notice_adaptor_unregistered(previous.name());
            }
        }
        replacement.result?;

        if let Some(watcher) = &self.watcher {
            watcher.watch(&adaptor);
        }
        self.adaptor_notifier.notice_adaptor_registered(adaptor.name());
        Ok(())
    }
}

fn validate(request: &RegisterRequest) -> Result<()> {
    if !is_qualified_name(&request.name) {
        return Err(FabricError::InvalidArgument(format!(
            "adaptor name {:?} is not a qualified name",
            request.name
        )));
    }
    if !is_socket_file(&request.endpoint) {
        return Err(FabricError::InvalidArgument(format!(
            "endpoint {:?} is not a socket file name ending in {}",
            request.endpoint,
            limb_api::SOCKET_SUFFIX
        )));
    }
    if !is_supported_version(&request.version) {
        return Err(FabricError::InvalidArgument(format!(
            "version {:?} is not supported, expected one of {:?}",
            request.version,
            limb_api::SUPPORTED_VERSIONS
        )));
    }
    Ok(())
}

async fn reply<W>(
    writer: &mut FrameWriter<W>,
    outcome: std::result::Result<(), ErrorStatus>,
) -> std::result::Result<(), ProtocolError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match outcome {
        Ok(()) => {
            writer
                .send_json(MessageType::Ok, &serde_json::json!({}))
                .await
        }
        Err(status) => writer.send_json(MessageType::Error, &status).await,
    }
}
