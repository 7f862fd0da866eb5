//! Registration input checks

use crate::{REGISTRATION_SOCKET, SOCKET_SUFFIX, SUPPORTED_VERSIONS};

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// Kubernetes-style qualified name: `[prefix/]name`
///
/// The optional prefix is a DNS-1123 subdomain. The name is at most 63
/// characters of `[A-Za-z0-9._-]`, starting and ending alphanumeric.
pub fn is_qualified_name(name: &str) -> bool {
    let (prefix, name) = match name.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, name),
    };

    if let Some(prefix) = prefix {
        if !is_dns1123_subdomain(prefix) {
            return false;
        }
    }

    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    let bytes = name.as_bytes();
    bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn is_dns1123_subdomain(value: &str) -> bool {
    if value.is_empty() || value.len() > MAX_PREFIX_LEN {
        return false;
    }

    value.split('.').all(|label| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && is_lower_alphanumeric(bytes[0])
            && is_lower_alphanumeric(bytes[bytes.len() - 1])
            && bytes.iter().all(|&b| is_lower_alphanumeric(b) || b == b'-')
    })
}

fn is_lower_alphanumeric(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// Whether `filename` names an adaptor socket inside the socket directory
pub fn is_socket_file(filename: &str) -> bool {
    filename.len() > SOCKET_SUFFIX.len()
        && filename.ends_with(SOCKET_SUFFIX)
        && filename != REGISTRATION_SOCKET
        && !filename.contains(['/', '\\'])
        && !filename.starts_with('.')
}

/// Whether the fabric can talk to a plugin speaking `version`
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}
