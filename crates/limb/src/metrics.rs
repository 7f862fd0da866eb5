//! Connection metrics
//!
//! OpenTelemetry instruments labelled by `adaptor`:
//! - Active connections (up/down counter)
//! - Connect and send error counters
//! - Send latency histogram
//!
//! Counts are mirrored in-process so they can be read back without an exporter.

use std::time::Duration;

use dashmap::DashMap;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Per-adaptor connection metrics
pub struct FabricMetrics {
    connections: UpDownCounter<i64>,
    connect_errors: Counter<u64>,
    send_errors: Counter<u64>,
    send_latency: Histogram<f64>,

    active: DashMap<String, i64>,
    connect_error_counts: DashMap<String, u64>,
    send_error_counts: DashMap<String, u64>,
}

impl FabricMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            connections: meter
                .i64_up_down_counter("limb_adaptor_connections")
                .with_description("Number of open device connections per adaptor")
                .with_unit("{connections}")
                .build(),
            connect_errors: meter
                .u64_counter("limb_adaptor_connect_errors_total")
                .with_description("Total number of failed connection attempts per adaptor")
                .with_unit("{errors}")
                .build(),
            send_errors: meter
                .u64_counter("limb_adaptor_send_errors_total")
                .with_description("Total number of failed sends per adaptor")
                .with_unit("{errors}")
                .build(),
            send_latency: meter
                .f64_histogram("limb_adaptor_send_latency_seconds")
                .with_description("Latency of sending a device request to an adaptor")
                .with_unit("s")
                .build(),
            active: DashMap::new(),
            connect_error_counts: DashMap::new(),
            send_error_counts: DashMap::new(),
        }
    }

    /// Metrics recorded against the globally installed meter provider
    pub fn global() -> Self {
        Self::new(&global::meter("limb"))
    }

    pub fn connection_opened(&self, adaptor: &str) {
        self.connections.add(1, &labels(adaptor));
        *self.active.entry(adaptor.to_string()).or_insert(0) += 1;
    }

    pub fn connection_closed(&self, adaptor: &str) {
        self.connections.add(-1, &labels(adaptor));
        *self.active.entry(adaptor.to_string()).or_insert(0) -= 1;
    }

    /// Drop every connection counted for an adaptor that went away
    pub fn adaptor_removed(&self, adaptor: &str) {
        if let Some((_, open)) = self.active.remove(adaptor) {
            if open != 0 {
                self.connections.add(-open, &labels(adaptor));
            }
        }
    }

    pub fn connect_error(&self, adaptor: &str) {
        self.connect_errors.add(1, &labels(adaptor));
        *self
            .connect_error_counts
            .entry(adaptor.to_string())
            .or_insert(0) += 1;
    }

    pub fn send_error(&self, adaptor: &str) {
        self.send_errors.add(1, &labels(adaptor));
        *self.send_error_counts.entry(adaptor.to_string()).or_insert(0) += 1;
    }

    pub fn observe_send_latency(&self, adaptor: &str, elapsed: Duration) {
        self.send_latency
            .record(elapsed.as_secs_f64(), &labels(adaptor));
    }

    pub fn active_connections(&self, adaptor: &str) -> i64 {
        self.active.get(adaptor).map(|v| *v).unwrap_or(0)
    }

    pub fn connect_errors(&self, adaptor: &str) -> u64 {
        self.connect_error_counts.get(adaptor).map(|v| *v).unwrap_or(0)
    }

    pub fn send_errors(&self, adaptor: &str) -> u64 {
        self.send_error_counts.get(adaptor).map(|v| *v).unwrap_or(0)
    }
}

fn labels(adaptor: &str) -> [KeyValue; 1] {
    [KeyValue::new("adaptor", adaptor.to_string())]
}
