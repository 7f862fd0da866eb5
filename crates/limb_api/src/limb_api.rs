//! Limb adaptor protocol
//!
//! Shared between the limb fabric and adaptor plugins:
//! - Length-prefixed frame codec used on every local socket
//! - Registration and device-session message payloads
//! - Name / endpoint / version validation
//! - A plugin-side registration client

pub mod client;
pub mod frame;
pub mod message;
pub mod validation;

pub use client::{register, RegisterError};
pub use frame::{Frame, FrameReader, FrameWriter, MessageType, ProtocolError, MAX_FRAME_LEN};
pub use message::{
    ConnectRequest, ConnectResponse, DeviceModel, ErrorCode, ErrorStatus, References,
    RegisterRequest,
};
pub use validation::{is_qualified_name, is_socket_file, is_supported_version};

/// Default directory holding the registration socket and every adaptor socket
pub const DEFAULT_SOCKET_DIR: &str = "/var/lib/limb/adaptors";

/// File name of the registration socket inside the socket directory
pub const REGISTRATION_SOCKET: &str = "limb.sock";

/// Suffix identifying adaptor endpoint sockets
pub const SOCKET_SUFFIX: &str = ".sock";

/// Protocol versions this fabric can talk to
pub const SUPPORTED_VERSIONS: &[&str] = &["v1alpha1"];

/// Protocol version spoken by this crate
pub const VERSION: &str = "v1alpha1";
