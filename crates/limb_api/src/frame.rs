//! Frame codec for adaptor sockets
//!
//! Every frame is `[u32 big-endian length][u8 message type][payload]`, where the
//! length covers the type byte and the payload. Payloads are JSON.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame (type byte + payload)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors produced while reading or writing frames
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unexpected message type: {0:?}")]
    UnexpectedMessage(MessageType),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Whether the error means the peer has gone away
    pub fn is_closed(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            ProtocolError::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Message types carried in the frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Plugin → limb.sock
    Register = 1,

    // Fabric → plugin
    Connect = 2,

    // Replies
    Ok = 10,
    Error = 13,

    // Plugin → fabric
    ConnectResponse = 20,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(MessageType::Register),
            2 => Ok(MessageType::Connect),
            10 => Ok(MessageType::Ok),
            13 => Ok(MessageType::Error),
            20 => Ok(MessageType::ConnectResponse),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// A single frame read from or written to a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Build a frame with a JSON payload
    pub fn json<T: Serialize>(msg_type: MessageType, data: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(msg_type, serde_json::to_vec(data)?))
    }

    /// Parse the payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode header and payload into one buffer
    pub fn encode(&self) -> Vec<u8> {
        let len = (1 + self.payload.len()) as u32;
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Writes frames to the send side of a socket
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a frame
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        if frame.payload.len() + 1 > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(frame.payload.len() + 1));
        }
        self.inner.write_all(&frame.encode()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a frame with a JSON payload
    pub async fn send_json<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        data: &T,
    ) -> Result<(), ProtocolError> {
        self.send(&Frame::json(msg_type, data)?).await
    }

    /// Half-close: the peer reads EOF after the frames already sent
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads frames from the receive side of a socket
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Receive a frame. Returns `Ok(None)` on a clean EOF between frames.
    ///
    /// The whole frame body is consumed before it is decoded, so a decode
    /// error leaves the stream positioned at the next frame.
    pub async fn recv(&mut self) -> Result<Option<Frame>, ProtocolError> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(ProtocolError::EmptyFrame);
        }

        if len > MAX_FRAME_LEN {
            let mut skipped = (&mut self.inner).take(len as u64);
            tokio::io::copy(&mut skipped, &mut tokio::io::sink()).await?;
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;

        let msg_type = MessageType::try_from(body[0])?;
        body.remove(0);

        Ok(Some(Frame::new(msg_type, body)))
    }
}
