use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use limb_api::DeviceModel;

/// Namespace + name of a managed device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub namespace: String,
    pub name: String,
}

impl DeviceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for DeviceKey {
    type Err = String;

    /// Parses `namespace/name`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(format!("invalid device key {s:?}, expected namespace/name")),
        }
    }
}

/// What the reconciler knows about a device's link to an adaptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLink {
    /// The linked device
    pub device: DeviceKey,
    /// Adaptor recorded on the link status
    pub adaptor_name: String,
    /// Adaptor-specific parameters from the link spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// Device model the link resolved to
    pub model: DeviceModel,
}

impl DeviceLink {
    pub fn new(device: DeviceKey, adaptor_name: impl Into<String>, model: DeviceModel) -> Self {
        Self {
            device,
            adaptor_name: adaptor_name.into(),
            parameters: None,
            model,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }
}
