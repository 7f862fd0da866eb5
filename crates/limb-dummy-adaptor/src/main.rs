//! Dummy adaptor
//!
//! A reference adaptor plugin. It listens on its own socket, registers with
//! limb, and answers every device request by sending the manifest back with
//! `status.observedAt` set to the time it was seen.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use limb_api::{
    ConnectRequest, ConnectResponse, ErrorStatus, FrameReader, FrameWriter, MessageType,
    RegisterRequest,
};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Limb dummy adaptor
#[derive(Parser, Debug)]
#[command(name = "limb-dummy-adaptor")]
#[command(about = "Reference adaptor plugin for limb", long_about = None)]
struct Args {
    /// Directory holding limb's registration socket
    #[arg(long, default_value = limb_api::DEFAULT_SOCKET_DIR)]
    socket_dir: PathBuf,

    /// Adaptor name to register
    #[arg(long, default_value = "dummy")]
    name: String,

    /// Socket file name to listen on inside the socket directory
    #[arg(long, default_value = "dummy.sock")]
    endpoint: String,

    /// Seconds between registration attempts and restart checks
    #[arg(long, default_value = "5")]
    retry_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("limb_dummy_adaptor=info")),
        )
        .init();

    let args = Args::parse();

    let socket = args.socket_dir.join(&args.endpoint);
    let registration = args.socket_dir.join(limb_api::REGISTRATION_SOCKET);
    let request = RegisterRequest::new(&args.name, &args.endpoint, limb_api::VERSION);
    let retry = Duration::from_secs(args.retry_secs.max(1));

    tokio::select! {
        result = stay_registered(&socket, &registration, &request, retry) => result?,
        _ = tokio::signal::ctrl_c() => {}
    }

    info!("Shutting down");
    if let Err(e) = std::fs::remove_file(&socket) {
        warn!(path = %socket.display(), error = %e, "Failed to remove socket");
    }
    Ok(())
}

/// Keep the adaptor registered across limb restarts
///
/// limb removes every socket in the directory when it starts, so a missing
/// socket file or a new registration socket means binding and registering again.
async fn stay_registered(
    socket: &Path,
    registration: &Path,
    request: &RegisterRequest,
    poll: Duration,
) -> Result<()> {
    let mut server: Option<JoinHandle<()>> = None;
    loop {
        if server.is_none() || !socket.exists() {
            if let Some(task) = server.take() {
                task.abort();
            }
            let listener = bind(socket)?;
            info!(path = %socket.display(), "Dummy adaptor listening");
            server = Some(tokio::spawn(serve(listener)));
        }

        register_until_accepted(registration, request, poll).await;
        let registered_with = socket_id(registration);

        let mut ticker = tokio::time::interval(poll);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if restarted(socket, registration, registered_with) {
                info!(adaptor = %request.name, "limb restarted, registering again");
                break;
            }
        }
    }
}

/// Device and inode of a socket file
fn socket_id(path: &Path) -> Option<(u64, u64)> {
    std::fs::metadata(path).ok().map(|m| (m.dev(), m.ino()))
}

/// Whether limb came back since it accepted the registration
fn restarted(socket: &Path, registration: &Path, registered_with: Option<(u64, u64)>) -> bool {
    if !socket.exists() {
        return true;
    }
    match socket_id(registration) {
        Some(id) => Some(id) != registered_with,
        // Still down
        None => false,
    }
}

fn bind(socket: &Path) -> Result<UnixListener> {
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if socket.exists() {
        std::fs::remove_file(socket)
            .with_context(|| format!("Failed to remove stale socket {}", socket.display()))?;
    }
    UnixListener::bind(socket).with_context(|| format!("Failed to bind {}", socket.display()))
}

async fn register_until_accepted(registration: &Path, request: &RegisterRequest, retry: Duration) {
    loop {
        match limb_api::register(registration, request).await {
            Ok(()) => {
                info!(adaptor = %request.name, "Registered with limb");
                return;
            }
            Err(e) => {
                warn!(adaptor = %request.name, error = %e, "Registration failed, retrying in {:?}", retry);
                tokio::time::sleep(retry).await;
            }
        }
    }
}

async fn serve(listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(session(stream));
            }
            Err(e) => {
                error!(error = %e, "Failed to accept device session");
            }
        }
    }
}

/// Answer device requests on one stream until limb closes it
async fn session(stream: UnixStream) {
    let (r, w) = stream.into_split();
    let mut reader = FrameReader::new(r);
    let mut writer = FrameWriter::new(w);

    loop {
        let frame = match reader.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) if e.is_closed() => break,
            Err(e) => {
                warn!(error = %e, "Bad frame from limb");
                continue;
            }
        };
        if frame.msg_type != MessageType::Connect {
            debug!(msg_type = ?frame.msg_type, "Ignoring frame");
            continue;
        }

        let sent = match frame
            .parse_json::<ConnectRequest>()
            .map_err(|e| e.to_string())
            .and_then(|request| observe(&request, Utc::now()))
        {
            Ok(response) => writer.send_json(MessageType::ConnectResponse, &response).await,
            Err(message) => {
                let status = ErrorStatus::invalid_argument(message);
                writer.send_json(MessageType::Error, &status).await
            }
        };
        if let Err(e) = sent {
            debug!(error = %e, "Device session closed");
            break;
        }
    }
}

/// The request's manifest, stamped with `status.observedAt`
fn observe(request: &ConnectRequest, now: DateTime<Utc>) -> std::result::Result<ConnectResponse, String> {
    let mut manifest: serde_json::Value = serde_json::from_str(&request.device)
        .map_err(|e| format!("device manifest is not JSON: {e}"))?;
    let Some(object) = manifest.as_object_mut() else {
        return Err("device manifest is not an object".to_string());
    };

    let status = object
        .entry("status")
        .or_insert_with(|| serde_json::json!({}));
    if !status.is_object() {
        *status = serde_json::json!({});
    }
    if let Some(status) = status.as_object_mut() {
        status.insert("observedAt".to_string(), now.to_rfc3339().into());
    }

    debug!(kind = %request.model.kind, "Observed device");
    Ok(ConnectResponse {
        device: manifest.to_string(),
    })
}
