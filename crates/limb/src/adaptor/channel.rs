//! Channel to an adaptor's socket
//!
//! Holds the endpoint path and a cancellation token that every connection
//! stream opened through the channel is bound to. Closing the channel ends
//! all of those streams.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::error::{FabricError, Result};

pub struct AdaptorChannel {
    path: PathBuf,
    connect_timeout: Duration,
    token: CancellationToken,
}

impl AdaptorChannel {
    /// Create a channel without probing the socket
    pub fn new(path: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            connect_timeout,
            token: CancellationToken::new(),
        }
    }

    /// Create a channel after checking the adaptor accepts connections
    pub async fn dial(adaptor: &str, path: impl Into<PathBuf>, connect_timeout: Duration) -> Result<Self> {
        let channel = Self::new(path, connect_timeout);
        // The check stream is dropped right away; adaptors treat it as an empty session
        channel.connect(adaptor).await?;
        Ok(channel)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new stream to the adaptor
    pub async fn open_stream(&self, adaptor: &str) -> Result<(UnixStream, CancellationToken)> {
        if self.is_closed() {
            return Err(FabricError::AdaptorStopped(adaptor.to_string()));
        }
        let stream = self.connect(adaptor).await?;
        Ok((stream, self.child_token()))
    }

    /// Token cancelled when the channel closes
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    async fn connect(&self, adaptor: &str) -> Result<UnixStream> {
        match tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.path)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(FabricError::Dial {
                adaptor: adaptor.to_string(),
                path: self.path.clone(),
                source,
            }),
            Err(_) => Err(FabricError::DialTimeout {
                adaptor: adaptor.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Close the channel. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl std::fmt::Debug for AdaptorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorChannel")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_dial_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = AdaptorChannel::dial("mqtt", dir.path().join("mqtt.sock"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Dial { .. }));
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mqtt.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let channel = AdaptorChannel::dial("mqtt", &path, Duration::from_secs(1)).await.unwrap();
        let (_stream, token) = channel.open_stream("mqtt").await.unwrap();

        assert!(channel.close());
        assert!(!channel.close());
        assert!(token.is_cancelled());

        let err = channel.open_stream("mqtt").await.unwrap_err();
        assert!(matches!(err, FabricError::AdaptorStopped(_)));
    }
}
