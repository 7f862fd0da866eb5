//! Adaptors and their device connections
//!
//! An [`Adaptor`] is a registered plugin reachable over its Unix socket. Each
//! device it serves gets its own [`Connection`], a long-lived framed stream
//! carrying connect requests out and manifest updates back.
//!
//! [`Adaptors`] is the process-wide registry of live adaptors.

mod channel;
mod connection;
mod handle;
mod registry;

pub use channel::AdaptorChannel;
pub use connection::Connection;
pub use handle::Adaptor;
pub use registry::{Adaptors, Replacement};
