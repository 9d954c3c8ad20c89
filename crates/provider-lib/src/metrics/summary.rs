//! Node stats summary
//!
//! Fans out one stats fetch per running pod and folds the results into a
//! kubelet-style summary. A summary is all-or-nothing: one failing pod fails
//! the whole call.

use super::task_group::TaskGroup;
use super::{pod_phase, PodLister, PodStatsGetter};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::health::{components, HealthRegistry};
use crate::models::{CpuStats, MemoryStats, NodeStats, PodStats, Summary};
use crate::observability::{ProviderMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use prometheus::proto::MetricFamily;
use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Opts, Registry};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NANOS_PER_SECOND: f64 = 1e9;

#[derive(Debug, Clone)]
pub struct SummaryConfig {
    pub node_name: String,
    /// Maximum pod stats fetches in flight
    pub concurrency: usize,
}

impl SummaryConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            concurrency: 10,
        }
    }
}

pub struct StatsSummaryProvider {
    config: SummaryConfig,
    pods: Arc<dyn PodLister>,
    stats: Arc<dyn PodStatsGetter>,
    clock: Arc<dyn Clock>,
    start_time: DateTime<Utc>,
    lock: Mutex<()>,
    metrics: ProviderMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl StatsSummaryProvider {
    pub fn new(
        config: SummaryConfig,
        pods: Arc<dyn PodLister>,
        stats: Arc<dyn PodStatsGetter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let start_time = clock.now();
        let logger = StructuredLogger::new(config.node_name.clone());
        Self {
            config,
            pods,
            stats,
            clock,
            start_time,
            lock: Mutex::new(()),
            metrics: ProviderMetrics::new(),
            logger,
            health: None,
        }
    }

    /// Report summary outcomes to the health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Stats of every running pod on the node.
    ///
    /// Calls are serialized; a second caller waits for the first to finish.
    pub async fn get_stats_summary(&self, cancel: &CancellationToken) -> Result<Summary> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.lock.lock() => guard,
        };

        let started = Instant::now();
        let result = self.compute(cancel).await;
        self.metrics
            .observe_summary_latency(started.elapsed().as_secs_f64());

        let purged = self.stats.purge_expired();
        if purged > 0 {
            debug!(purged, "Dropped state of departed pods");
        }

        match &result {
            Ok(summary) => {
                self.metrics.set_pods_in_summary(summary.pods.len() as i64);
                if let Some(health) = &self.health {
                    health.set_healthy(components::STATS_SUMMARY).await;
                }
            }
            Err(e) => {
                self.metrics.inc_summary_failures();
                if !e.is_cancelled() {
                    self.logger.log_summary_failure(&e.to_string());
                }
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::STATS_SUMMARY, e.to_string())
                        .await;
                }
            }
        }
        result
    }

    async fn compute(&self, cancel: &CancellationToken) -> Result<Summary> {
        let pods = match self.pods.list().await {
            Ok(pods) => pods,
            Err(e) => {
                if let Some(health) = &self.health {
                    health
                        .set_degraded(components::POD_LISTER, e.to_string())
                        .await;
                }
                return Err(e);
            }
        };
        if let Some(health) = &self.health {
            health.set_healthy(components::POD_LISTER).await;
        }

        let total = pods.len();
        let mut group = TaskGroup::new(cancel, self.config.concurrency);
        for pod in pods.into_iter().filter(|p| pod_phase(p) == Some("Running")) {
            let stats = self.stats.clone();
            let metrics = self.metrics.clone();
            group.spawn(async move {
                let result = stats.get_pod_stats(&pod).await;
                if let Err(e) = &result {
                    if !e.is_cancelled() {
                        metrics.inc_pod_stats_errors(error_source(e));
                        warn!(
                            pod = pod.metadata.name.as_deref().unwrap_or_default(),
                            namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
                            error = %e,
                            "Failed to get pod stats"
                        );
                    }
                }
                result
            });
        }
        let running = group.len();

        let pods: Vec<PodStats> = group.wait().await?.into_iter().flatten().collect();
        debug!(
            listed = total,
            running,
            reported = pods.len(),
            "Built stats summary"
        );

        let now = self.clock.now();
        Ok(Summary {
            node: NodeStats {
                node_name: self.config.node_name.clone(),
                start_time: Some(self.start_time),
                cpu: Some(node_cpu(&pods, now)),
                memory: Some(node_memory(&pods, now)),
                network: None,
            },
            pods,
        })
    }

    /// The summary rendered as kubelet resource metrics
    pub async fn get_metrics_resource(&self, cancel: &CancellationToken) -> Result<Vec<MetricFamily>> {
        let summary = self.get_stats_summary(cancel).await?;
        render_resource_metrics(&summary)
    }
}

fn error_source(e: &Error) -> &'static str {
    match e {
        Error::Transient { .. } => "remote",
        Error::InvalidState(_) => "state",
        Error::Validation(_) | Error::NodeMismatch { .. } => "validation",
        _ => "other",
    }
}

fn node_cpu(pods: &[PodStats], now: DateTime<Utc>) -> CpuStats {
    let cpus = pods.iter().filter_map(|p| p.cpu.as_ref());
    let (rate, total) = cpus.fold((0u64, 0u64), |(rate, total), cpu| {
        (
            rate + cpu.usage_nano_cores.unwrap_or(0),
            total + cpu.usage_core_nano_seconds.unwrap_or(0),
        )
    });
    CpuStats {
        time: now,
        usage_nano_cores: Some(rate),
        usage_core_nano_seconds: Some(total),
    }
}

fn node_memory(pods: &[PodStats], now: DateTime<Utc>) -> MemoryStats {
    let memories = pods.iter().filter_map(|p| p.memory.as_ref());
    let (usage, working_set) = memories.fold((0u64, 0u64), |(usage, working_set), m| {
        (
            usage + m.usage_bytes.unwrap_or(0),
            working_set + m.working_set_bytes.unwrap_or(0),
        )
    });
    MemoryStats {
        time: now,
        usage_bytes: Some(usage),
        working_set_bytes: Some(working_set),
        rss_bytes: None,
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Serialization(format!("failed to render resource metrics: {e}"))
}

fn cpu_seconds(cpu: Option<&CpuStats>) -> Option<f64> {
    cpu.and_then(|c| c.usage_core_nano_seconds)
        .map(|ns| ns as f64 / NANOS_PER_SECOND)
}

fn working_set(memory: Option<&MemoryStats>) -> Option<f64> {
    memory.and_then(|m| m.working_set_bytes).map(|b| b as f64)
}

/// Resource metric families for a summary, in kubelet naming
pub fn render_resource_metrics(summary: &Summary) -> Result<Vec<MetricFamily>> {
    let registry = Registry::new();

    let node_cpu = Counter::new(
        "node_cpu_usage_seconds_total",
        "Cumulative cpu time consumed by the node in core-seconds",
    )
    .map_err(metrics_error)?;
    let node_memory = Gauge::new(
        "node_memory_working_set_bytes",
        "Current working set of the node in bytes",
    )
    .map_err(metrics_error)?;
    let pod_cpu = CounterVec::new(
        Opts::new(
            "pod_cpu_usage_seconds_total",
            "Cumulative cpu time consumed by the pod in core-seconds",
        ),
        &["namespace", "pod"],
    )
    .map_err(metrics_error)?;
    let pod_memory = GaugeVec::new(
        Opts::new(
            "pod_memory_working_set_bytes",
            "Current working set of the pod in bytes",
        ),
        &["namespace", "pod"],
    )
    .map_err(metrics_error)?;
    let container_cpu = CounterVec::new(
        Opts::new(
            "container_cpu_usage_seconds_total",
            "Cumulative cpu time consumed by the container in core-seconds",
        ),
        &["container", "namespace", "pod"],
    )
    .map_err(metrics_error)?;
    let container_memory = GaugeVec::new(
        Opts::new(
            "container_memory_working_set_bytes",
            "Current working set of the container in bytes",
        ),
        &["container", "namespace", "pod"],
    )
    .map_err(metrics_error)?;
    let container_start = GaugeVec::new(
        Opts::new(
            "container_start_time_seconds",
            "Start time of the container since unix epoch in seconds",
        ),
        &["container", "namespace", "pod"],
    )
    .map_err(metrics_error)?;
    let scrape_error = Gauge::new(
        "scrape_error",
        "1 if there was an error while getting container metrics, 0 otherwise",
    )
    .map_err(metrics_error)?;

    registry.register(Box::new(node_cpu.clone())).map_err(metrics_error)?;
    registry.register(Box::new(node_memory.clone())).map_err(metrics_error)?;
    registry.register(Box::new(pod_cpu.clone())).map_err(metrics_error)?;
    registry.register(Box::new(pod_memory.clone())).map_err(metrics_error)?;
    registry.register(Box::new(container_cpu.clone())).map_err(metrics_error)?;
    registry.register(Box::new(container_memory.clone())).map_err(metrics_error)?;
    registry.register(Box::new(container_start.clone())).map_err(metrics_error)?;
    registry.register(Box::new(scrape_error.clone())).map_err(metrics_error)?;

    if let Some(seconds) = cpu_seconds(summary.node.cpu.as_ref()) {
        node_cpu.inc_by(seconds);
    }
    if let Some(bytes) = working_set(summary.node.memory.as_ref()) {
        node_memory.set(bytes);
    }

    for pod in &summary.pods {
        let namespace = pod.pod_ref.namespace.as_str();
        let name = pod.pod_ref.name.as_str();

        if let Some(seconds) = cpu_seconds(pod.cpu.as_ref()) {
            pod_cpu.with_label_values(&[namespace, name]).inc_by(seconds);
        }
        if let Some(bytes) = working_set(pod.memory.as_ref()) {
            pod_memory.with_label_values(&[namespace, name]).set(bytes);
        }

        for container in &pod.containers {
            let labels = [container.name.as_str(), namespace, name];
            if let Some(seconds) = cpu_seconds(container.cpu.as_ref()) {
                container_cpu.with_label_values(&labels).inc_by(seconds);
            }
            if let Some(bytes) = working_set(container.memory.as_ref()) {
                container_memory.with_label_values(&labels).set(bytes);
            }
            if let Some(start) = container.start_time {
                container_start
                    .with_label_values(&labels)
                    .set(start.timestamp() as f64);
            }
        }
    }
    scrape_error.set(0.0);

    Ok(registry.gather())
}
