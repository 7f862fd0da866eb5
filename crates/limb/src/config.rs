//! Limb configuration
//!
//! Layered as: built-in defaults → optional TOML file → `LIMB_*` environment.
//! Nested keys use a double underscore, e.g. `LIMB_QUEUE__BASE_DELAY_MS`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Fabric configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimbConfig {
    /// Directory holding the registration socket and adaptor sockets
    pub socket_dir: PathBuf,

    /// File name of the registration socket
    pub registration_socket: String,

    /// Bound on dialing an adaptor socket
    pub connect_timeout_secs: u64,

    /// Bound on stopping an adaptor that is being replaced or removed
    pub kill_timeout_secs: u64,

    /// Reconciliation workers (0 = available parallelism)
    pub workers: usize,

    /// Watch the socket directory for removed adaptor sockets
    pub watch_sockets: bool,

    /// Event queue back-off
    pub queue: QueueConfig,

    /// OTLP collector to push metrics to
    pub otlp_endpoint: Option<String>,
}

/// Per-key exponential back-off for re-queued events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for LimbConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(limb_api::DEFAULT_SOCKET_DIR),
            registration_socket: limb_api::REGISTRATION_SOCKET.to_string(),
            connect_timeout_secs: 10,
            kill_timeout_secs: 10,
            workers: 0,
            watch_sockets: true,
            queue: QueueConfig::default(),
            otlp_endpoint: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_secs: 1000,
        }
    }
}

impl QueueConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

impl LimbConfig {
    /// Load configuration, optionally merging a TOML file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(LimbConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config = figment
            .merge(Env::prefixed("LIMB_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Configuration rooted at `socket_dir`, everything else default
    pub fn with_socket_dir(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            ..Default::default()
        }
    }

    pub fn registration_socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.registration_socket)
    }

    /// Path of an adaptor endpoint inside the socket directory
    pub fn endpoint_path(&self, endpoint: &str) -> PathBuf {
        self.socket_dir.join(endpoint)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    /// Number of reconciliation workers to spawn
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LimbConfig::default();
        assert_eq!(
            config.registration_socket_path(),
            PathBuf::from("/var/lib/limb/adaptors/limb.sock")
        );
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.queue.base_delay(), Duration::from_millis(5));
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limb.toml");
        std::fs::write(
            &path,
            r#"
socket_dir = "/run/limb"
kill_timeout_secs = 3
workers = 2
otlp_endpoint = "http://collector:4317"

[queue]
base_delay_ms = 50
"#,
        )
        .unwrap();

        let config = LimbConfig::load(Some(&path)).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/run/limb"));
        assert_eq!(config.kill_timeout(), Duration::from_secs(3));
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
        assert_eq!(config.queue.base_delay_ms, 50);
        assert_eq!(config.queue.max_delay_secs, 1000);
        assert_eq!(config.endpoint_path("mqtt.sock"), PathBuf::from("/run/limb/mqtt.sock"));
    }
}
