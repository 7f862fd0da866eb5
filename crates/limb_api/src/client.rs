//! Plugin-side registration client

use std::path::Path;

use tokio::net::UnixStream;

use crate::frame::{FrameReader, FrameWriter, MessageType, ProtocolError};
use crate::message::{ErrorStatus, RegisterRequest};

/// Why a registration attempt failed
#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("Failed to reach registration socket: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Registration rejected: {0}")]
    Rejected(ErrorStatus),

    #[error("Registration socket closed without a reply")]
    NoReply,
}

/// Register an adaptor with the fabric listening on `socket_path`
pub async fn register(socket_path: &Path, request: &RegisterRequest) -> Result<(), RegisterError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(ProtocolError::from)?;
    let (read_half, write_half) = stream.into_split();
    let mut writer = FrameWriter::new(write_half);
    let mut reader = FrameReader::new(read_half);

    writer.send_json(MessageType::Register, request).await?;

    let reply = reader.recv().await?.ok_or(RegisterError::NoReply)?;
    match reply.msg_type {
        MessageType::Ok => {
            tracing::debug!(adaptor = %request.name, "Registered with limb");
            Ok(())
        }
        MessageType::Error => Err(RegisterError::Rejected(reply.parse_json()?)),
        other => Err(ProtocolError::UnexpectedMessage(other).into()),
    }
}
