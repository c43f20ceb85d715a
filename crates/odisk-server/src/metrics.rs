use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Label used once the number of distinct disk ids reaches [`Metrics::MAX_DISK_IDS`].
const OTHER_DISK_ID: &str = "__other__";

/// Prometheus metrics exported on `/metrics`.
pub struct Metrics {
    registry: Registry,

    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    disk_bytes_served_total: IntCounterVec,
    device_query_failures_total: IntCounter,

    known_disk_ids: Mutex<HashSet<String>>,
}

impl Metrics {
    /// Disk ids are positional (`diskN`), but a long-running server with churning images can
    /// still accumulate many of them.
    pub const MAX_DISK_IDS: usize = 64;

    pub fn new() -> Self {
        let registry = Registry::new();

        let build_info = IntGaugeVec::new(
            Opts::new("odisk_server_build_info", "Build information for odisk-server."),
            &["version"],
        )
        .expect("odisk_server_build_info metric must be valid");
        registry
            .register(Box::new(build_info.clone()))
            .expect("odisk_server_build_info must register");
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests."),
            &["route", "method", "status"],
        )
        .expect("http_requests_total metric must be valid");
        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("http_requests_total must register");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds.",
            ),
            &["route", "method"],
        )
        .expect("http_request_duration_seconds metric must be valid");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("http_request_duration_seconds must register");

        let disk_bytes_served_total = IntCounterVec::new(
            Opts::new(
                "disk_bytes_served_total",
                "Total number of disk bytes served by range reads.",
            ),
            &["disk_id"],
        )
        .expect("disk_bytes_served_total metric must be valid");
        registry
            .register(Box::new(disk_bytes_served_total.clone()))
            .expect("disk_bytes_served_total must register");

        let device_query_failures_total = IntCounter::new(
            "device_query_failures_total",
            "Device state queries that failed or timed out.",
        )
        .expect("device_query_failures_total metric must be valid");
        registry
            .register(Box::new(device_query_failures_total.clone()))
            .expect("device_query_failures_total must register");

        Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            disk_bytes_served_total,
            device_query_failures_total,
            known_disk_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn observe_http_request(&self, route: &str, method: &str, status: u16, latency: Duration) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[route, method, status.as_str()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[route, method])
            .observe(latency.as_secs_f64());
    }

    pub fn observe_bytes_served(&self, disk_id: &str, bytes: u64) {
        let label = self.disk_id_label(disk_id);
        self.disk_bytes_served_total
            .with_label_values(&[label.as_str()])
            .inc_by(bytes);
    }

    pub fn observe_device_query_failure(&self) {
        self.device_query_failures_total.inc();
    }

    fn disk_id_label(&self, disk_id: &str) -> String {
        let mut known = self
            .known_disk_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if known.contains(disk_id) {
            return disk_id.to_string();
        }
        if known.len() >= Self::MAX_DISK_IDS {
            return OTHER_DISK_ID.to_string();
        }
        known.insert(disk_id.to_string());
        disk_id.to_string()
    }

    pub fn encode(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buf) {
            tracing::error!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    pub fn metrics_content_type() -> &'static str {
        "text/plain; version=0.0.4"
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_id_labels_are_capped() {
        let metrics = Metrics::new();
        for i in 0..Metrics::MAX_DISK_IDS + 5 {
            metrics.observe_bytes_served(&format!("disk{i}"), 1);
        }
        let text = metrics.encode();
        assert!(text.contains("disk_bytes_served_total{disk_id=\"disk0\"} 1"));
        assert!(text.contains("disk_bytes_served_total{disk_id=\"__other__\"} 5"));
    }

    #[test]
    fn request_counters_are_labelled() {
        let metrics = Metrics::new();
        metrics.observe_http_request("/:disk", "GET", 200, Duration::from_millis(3));
        metrics.observe_device_query_failure();
        let text = metrics.encode();
        assert!(text.contains("http_requests_total{method=\"GET\",route=\"/:disk\",status=\"200\"} 1"));
        assert!(text.contains("device_query_failures_total 1"));
    }
}
