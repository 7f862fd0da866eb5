//! Event keys and connection payloads

use std::fmt;

use crate::types::DeviceKey;

/// Identity of a queued event
///
/// Keys carry only identifying fields. Data and error payloads are kept beside
/// the queue so that a newer payload replaces an older one under the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    AdaptorRegistered { name: String },
    AdaptorUnregistered { name: String },
    ConnectionReceivedData { adaptor: String, device: DeviceKey },
    ConnectionReceivedError { adaptor: String, device: DeviceKey },
    ConnectionClosed { adaptor: String, device: DeviceKey },
}

impl EventKey {
    /// Whether the event carries a payload in the side cache
    pub fn has_payload(&self) -> bool {
        matches!(
            self,
            EventKey::ConnectionReceivedData { .. } | EventKey::ConnectionReceivedError { .. }
        )
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::AdaptorRegistered { name } => write!(f, "registered:{name}"),
            EventKey::AdaptorUnregistered { name } => write!(f, "unregistered:{name}"),
            EventKey::ConnectionReceivedData { adaptor, device } => {
                write!(f, "data:{adaptor}:{device}")
            }
            EventKey::ConnectionReceivedError { adaptor, device } => {
                write!(f, "error:{adaptor}:{device}")
            }
            EventKey::ConnectionClosed { adaptor, device } => {
                write!(f, "closed:{adaptor}:{device}")
            }
        }
    }
}

/// What a connection reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Updated device manifest as sent by the adaptor
    Data(Vec<u8>),
    /// Stream error, the connection is still open
    Error(String),
    /// The adaptor closed the stream
    Closed,
}
