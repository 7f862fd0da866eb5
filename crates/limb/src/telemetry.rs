//! Metrics export
//!
//! Installs the global OpenTelemetry meter provider that [`FabricMetrics`]
//! records into. Metrics are pushed over OTLP when an endpoint is configured,
//! otherwise they stay in-process.
//!
//! [`FabricMetrics`]: crate::metrics::FabricMetrics

use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::{Resource, runtime};
use thiserror::Error;
use tracing::info;

use crate::config::LimbConfig;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    pub service_name: String,

    /// OTLP collector, e.g. `http://otel-collector:4317`
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// The configured endpoint, falling back to `OTEL_EXPORTER_OTLP_ENDPOINT`
    pub fn from_config(config: &LimbConfig) -> Self {
        Self {
            service_name: "limb".to_string(),
            otlp_endpoint: config
                .otlp_endpoint
                .clone()
                .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok())
                .filter(|endpoint| !endpoint.is_empty()),
        }
    }
}

/// Install the global meter provider
///
/// Returns the provider so it can be flushed on shutdown, or `None` when no
/// endpoint is configured.
pub fn init_metrics(config: &TelemetryConfig) -> Result<Option<SdkMeterProvider>, TelemetryError> {
    let Some(endpoint) = &config.otlp_endpoint else {
        info!("No OTLP endpoint configured, metrics are not exported");
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(build_resource(&config.service_name))
        .build();

    global::set_meter_provider(provider.clone());
    info!(endpoint = %endpoint, "Exporting metrics over OTLP");

    Ok(Some(provider))
}

fn build_resource(service_name: &str) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name.to_string(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_endpoint_wins() {
        let mut config = LimbConfig::default();
        config.otlp_endpoint = Some("http://collector:4317".to_string());

        let telemetry = TelemetryConfig::from_config(&config);
        assert_eq!(telemetry.service_name, "limb");
        assert_eq!(telemetry.otlp_endpoint.as_deref(), Some("http://collector:4317"));
    }

    #[test]
    fn test_empty_endpoint_is_disabled() {
        let mut config = LimbConfig::default();
        config.otlp_endpoint = Some(String::new());

        let telemetry = TelemetryConfig::from_config(&config);
        assert!(telemetry.otlp_endpoint.is_none());
    }

    #[test]
    fn test_no_endpoint_installs_nothing() {
        let config = TelemetryConfig {
            service_name: "limb".to_string(),
            otlp_endpoint: None,
        };
        assert!(init_metrics(&config).unwrap().is_none());
    }
}
