//! Notification sinks
//!
//! I/O loops (connection receive loops, the registration server, the socket
//! watcher) report outcomes through these traits. Implementations must not
//! block: they are called from inside the loops.

use crate::types::DeviceKey;

/// Receives adaptor registration changes
pub trait AdaptorNotifier: Send + Sync {
    fn notice_adaptor_registered(&self, name: &str);

    fn notice_adaptor_unregistered(&self, name: &str);
}

/// Receives the outcomes of a connection's receive loop
pub trait ConnectionNotifier: Send + Sync {
    /// An updated device manifest arrived
    fn notice_connection_received_data(&self, adaptor: &str, device: &DeviceKey, data: Vec<u8>);

    /// The stream reported an error but is still open
    fn notice_connection_received_error(&self, adaptor: &str, device: &DeviceKey, error: String);

    /// The adaptor closed the stream
    fn notice_connection_closed(&self, adaptor: &str, device: &DeviceKey);
}
