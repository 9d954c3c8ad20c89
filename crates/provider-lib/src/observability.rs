//! Observability infrastructure for the provider
//!
//! Provides:
//! - Prometheus metrics (remote request outcomes, summary latency, cache hits)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ProviderMetricsInner> = OnceLock::new();

struct ProviderMetricsInner {
    aci_requests: IntCounterVec,
    summary_latency_seconds: Histogram,
    summary_failures: IntCounter,
    pods_in_summary: IntGauge,
    pod_stats_errors: IntCounterVec,
    log_fetch_retries: IntCounter,
    cache_lookups: IntCounterVec,
}

impl ProviderMetricsInner {
    fn new() -> Self {
        Self {
            aci_requests: register_int_counter_vec!(
                "aci_provider_requests_total",
                "Container group control plane requests by operation and response status",
                &["operation", "status"]
            )
            .expect("Failed to register aci_provider_requests_total"),

            summary_latency_seconds: register_histogram!(
                "aci_provider_stats_summary_latency_seconds",
                "Time spent building the node stats summary",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register stats_summary_latency_seconds"),

            summary_failures: register_int_counter!(
                "aci_provider_stats_summary_failures_total",
                "Total number of failed stats summary computations"
            )
            .expect("Failed to register stats_summary_failures"),

            pods_in_summary: register_int_gauge!(
                "aci_provider_pods_in_summary",
                "Number of pods included in the last stats summary"
            )
            .expect("Failed to register pods_in_summary"),

            pod_stats_errors: register_int_counter_vec!(
                "aci_provider_pod_stats_errors_total",
                "Pod stats fetch failures by source",
                &["source"]
            )
            .expect("Failed to register pod_stats_errors_total"),

            log_fetch_retries: register_int_counter!(
                "aci_provider_log_fetch_retries_total",
                "Total number of retried container log fetches"
            )
            .expect("Failed to register log_fetch_retries"),

            cache_lookups: register_int_counter_vec!(
                "aci_provider_cache_lookups_total",
                "Cache lookups by cache name and result",
                &["cache", "result"]
            )
            .expect("Failed to register cache_lookups_total"),
        }
    }
}

/// Provider metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ProviderMetrics {
    _private: (),
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ProviderMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ProviderMetricsInner {
        GLOBAL_METRICS.get_or_init(ProviderMetricsInner::new)
    }

    /// Record a control plane response; `status` is `None` for transport errors
    pub fn record_aci_request(&self, operation: &str, status: Option<u16>) {
        let status = status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "error".to_string());
        self.inner()
            .aci_requests
            .with_label_values(&[operation, &status])
            .inc();
    }

    pub fn observe_summary_latency(&self, duration_secs: f64) {
        self.inner().summary_latency_seconds.observe(duration_secs);
    }

    pub fn inc_summary_failures(&self) {
        self.inner().summary_failures.inc();
    }

    pub fn set_pods_in_summary(&self, count: i64) {
        self.inner().pods_in_summary.set(count);
    }

    pub fn inc_pod_stats_errors(&self, source: &str) {
        self.inner()
            .pod_stats_errors
            .with_label_values(&[source])
            .inc();
    }

    pub fn inc_log_fetch_retries(&self) {
        self.inner().log_fetch_retries.inc();
    }

    pub fn record_cache_lookup(&self, cache: &str, hit: bool) {
        self.inner()
            .cache_lookups
            .with_label_values(&[cache, if hit { "hit" } else { "miss" }])
            .inc();
    }
}

/// Structured logger for provider lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, resource_group: &str, region: &str) {
        info!(
            event = "provider_started",
            node = %self.node_name,
            provider_version = %version,
            resource_group = %resource_group,
            region = %region,
            "ACI provider started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "provider_shutdown",
            node = %self.node_name,
            reason = %reason,
            "ACI provider shutting down"
        );
    }

    pub fn log_gpu_capabilities(&self, region: &str, skus: &[String]) {
        if skus.is_empty() {
            info!(
                event = "gpu_capabilities",
                node = %self.node_name,
                region = %region,
                "No GPU SKUs available in region, GPU support disabled"
            );
        } else {
            info!(
                event = "gpu_capabilities",
                node = %self.node_name,
                region = %region,
                skus = ?skus,
                "GPU SKUs available"
            );
        }
    }

    pub fn log_summary_failure(&self, error: &str) {
        warn!(
            event = "stats_summary_failed",
            node = %self.node_name,
            error = %error,
            "Failed to build stats summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_metrics_creation() {
        let metrics = ProviderMetrics::new();

        metrics.record_aci_request("get_container_group", Some(200));
        metrics.record_aci_request("get_container_group", None);
        metrics.observe_summary_latency(0.2);
        metrics.set_pods_in_summary(3);
        metrics.inc_pod_stats_errors("realtime");
        metrics.inc_log_fetch_retries();
        metrics.record_cache_lookup("container_group", true);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "aci_provider_requests_total"));
    }

    #[test]
    fn test_failure_and_retry_counts_are_counters() {
        let metrics = ProviderMetrics::new();
        metrics.inc_summary_failures();
        metrics.inc_log_fetch_retries();

        let families = prometheus::gather();
        for name in [
            "aci_provider_stats_summary_failures_total",
            "aci_provider_log_fetch_retries_total",
        ] {
            let family = families
                .iter()
                .find(|f| f.get_name() == name)
                .unwrap_or_else(|| panic!("{name} not registered"));
            assert_eq!(family.get_field_type(), prometheus::proto::MetricType::COUNTER);
            assert!(family.get_metric()[0].get_counter().get_value() >= 1.0);
        }
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("vk-aci");
        assert_eq!(logger.node_name, "vk-aci");
    }
}
