//! Message payloads carried inside frames

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Opaque reference bundle: reference name → item name → bytes
pub type References = HashMap<String, HashMap<String, Vec<u8>>>;

/// Registration request sent by a plugin to `limb.sock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Adaptor name, unique per node
    pub name: String,
    /// Socket file name of the plugin, relative to the socket directory
    pub endpoint: String,
    /// Protocol version spoken by the plugin
    pub version: String,
}

impl RegisterRequest {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            version: version.into(),
        }
    }
}

/// Type of the device model a link points at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
}

impl DeviceModel {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }
}

/// Device session request: fabric → plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Adaptor-specific connection parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    pub model: DeviceModel,
    /// Device manifest as JSON text
    pub device: String,
    #[serde(default, with = "base64_references")]
    pub references: References,
}

/// Device session response: plugin → fabric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Updated device manifest as JSON text
    pub device: String,
}

/// Failure classes returned over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidArgument,
    Internal,
    Unavailable,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InvalidArgument => write!(f, "invalid argument"),
            ErrorCode::Internal => write!(f, "internal"),
            ErrorCode::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Error payload of an `Error` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorStatus {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Reference bytes travel as base64 strings inside JSON
mod base64_references {
    use std::collections::HashMap;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::References;

    pub fn serialize<S: Serializer>(refs: &References, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: HashMap<&str, HashMap<&str, String>> = refs
            .iter()
            .map(|(name, items)| {
                let items = items
                    .iter()
                    .map(|(item, bytes)| (item.as_str(), STANDARD.encode(bytes)))
                    .collect();
                (name.as_str(), items)
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<References, D::Error> {
        let encoded = HashMap::<String, HashMap<String, String>>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, items)| {
                let items = items
                    .into_iter()
                    .map(|(item, text)| {
                        STANDARD
                            .decode(text.as_bytes())
                            .map(|bytes| (item, bytes))
                            .map_err(serde::de::Error::custom)
                    })
                    .collect::<Result<HashMap<_, _>, _>>()?;
                Ok((name, items))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_request_encodes_references_as_base64() {
        let mut references = References::new();
        references.insert(
            "credentials".to_string(),
            HashMap::from([("password".to_string(), b"s3cret".to_vec())]),
        );
        let request = ConnectRequest {
            parameters: None,
            model: DeviceModel::new("devices.example.io/v1alpha1", "MqttDevice"),
            device: r#"{"spec":{}}"#.to_string(),
            references,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["references"]["credentials"]["password"], "czNjcmV0");
        assert_eq!(json["model"]["apiVersion"], "devices.example.io/v1alpha1");
        assert!(json.get("parameters").is_none());

        let decoded: ConnectRequest = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.references["credentials"]["password"], b"s3cret");
    }

    #[test]
    fn test_references_reject_bad_base64() {
        let json = serde_json::json!({
            "model": {"apiVersion": "v1", "kind": "Dummy"},
            "device": "{}",
            "references": {"creds": {"token": "***"}}
        });
        assert!(serde_json::from_value::<ConnectRequest>(json).is_err());
    }

    #[test]
    fn test_error_status_display() {
        let status = ErrorStatus::invalid_argument("bad name");
        assert_eq!(status.to_string(), "invalid argument: bad name");
    }
}
