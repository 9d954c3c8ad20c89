//! Pod stats from the monitoring backend

use super::reconcile::{accumulate, CumulativeUsageTracker};
use super::{pod_identity, MetricsGetter, PodStatsGetter};
use crate::aci::container_group_name;
use crate::clock::Clock;
use crate::error::Result;
use crate::models::{
    AggregationType, ContainerStats, CpuStats, InterfaceStats, MemoryStats, Metric, MetricType,
    MetricValue, MetricsRequest, MetricsResult, NetworkStats, PodReference, PodStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Metadata dimension carrying the container name
pub const CONTAINER_NAME_DIMENSION: &str = "containername";

const CONTAINER_DIMENSION_FILTER: &str = "containerName eq '*'";
const LOOKBACK_MINUTES: i64 = 5;
/// CPU is reported in millicores
const MILLICORES_TO_NANOCORES: f64 = 1_000_000.0;
const DEFAULT_INTERFACE: &str = "eth0";

/// Stats computed from per-minute averages, with cumulative counters
/// reconciled across polls
pub struct AggregateStatsProvider {
    metrics: Arc<dyn MetricsGetter>,
    resource_group: String,
    tracker: CumulativeUsageTracker,
    clock: Arc<dyn Clock>,
}

impl AggregateStatsProvider {
    pub fn new(
        metrics: Arc<dyn MetricsGetter>,
        resource_group: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            metrics,
            resource_group: resource_group.into(),
            tracker: CumulativeUsageTracker::new(clock.clone()),
            clock,
        }
    }

    fn request(
        &self,
        end: DateTime<Utc>,
        types: Vec<MetricType>,
        dimension: Option<&str>,
    ) -> MetricsRequest {
        MetricsRequest {
            start: end - Duration::minutes(LOOKBACK_MINUTES),
            end,
            interval: Duration::minutes(1),
            types,
            aggregations: vec![AggregationType::Average],
            dimension: dimension.map(str::to_string),
        }
    }

    fn build_stats(
        &self,
        pod: &Pod,
        now: DateTime<Utc>,
        container_metrics: &MetricsResult,
        network_metrics: &MetricsResult,
    ) -> PodStats {
        let (namespace, name, uid) = pod_identity(pod);
        let start_time = pod
            .status
            .as_ref()
            .and_then(|s| s.start_time.as_ref())
            .map(|t| t.0);

        let mut containers: BTreeMap<String, ContainerStats> = BTreeMap::new();

        let (network_rx, network_tx) = self.tracker.update(uid, |usage| {
            for metric in &container_metrics.value {
                match metric.metric_type() {
                    Some(MetricType::CpuUsage) => {
                        for series in &metric.timeseries {
                            let Some(container) = series.dimension(CONTAINER_NAME_DIMENSION) else {
                                continue;
                            };
                            let Some(latest) = series.latest() else {
                                continue;
                            };
                            let cumulative = usage
                                .container_cpu
                                .entry(container.to_string())
                                .or_default();
                            let total =
                                accumulate(cumulative, &series.data, MILLICORES_TO_NANOCORES);

                            let stats = container_entry(&mut containers, container, start_time);
                            stats.cpu = Some(CpuStats {
                                time: latest.time_stamp,
                                usage_nano_cores: latest
                                    .average
                                    .map(|avg| (avg * MILLICORES_TO_NANOCORES).max(0.0) as u64),
                                usage_core_nano_seconds: Some(total),
                            });
                        }
                    }
                    Some(MetricType::MemoryUsage) => {
                        for series in &metric.timeseries {
                            let Some(container) = series.dimension(CONTAINER_NAME_DIMENSION) else {
                                continue;
                            };
                            let Some(latest) = series.latest() else {
                                continue;
                            };
                            let bytes = latest.average.map(|avg| avg.max(0.0) as u64);
                            let stats = container_entry(&mut containers, container, start_time);
                            stats.memory = Some(MemoryStats {
                                time: latest.time_stamp,
                                usage_bytes: bytes,
                                working_set_bytes: bytes,
                                rss_bytes: None,
                            });
                        }
                    }
                    _ => {}
                }
            }

            let rx = network_counter(network_metrics, MetricType::NetworkBytesReceivedPerSecond)
                .map(|(time, samples)| (time, accumulate(&mut usage.network_rx, samples, 1.0)));
            let tx = network_counter(network_metrics, MetricType::NetworkBytesTransmittedPerSecond)
                .map(|(time, samples)| (time, accumulate(&mut usage.network_tx, samples, 1.0)));
            (rx, tx)
        });

        let containers: Vec<ContainerStats> = containers.into_values().collect();

        let cpu = sum_cpu(&containers, now);
        let memory = sum_memory(&containers, now);
        let network = (network_rx.is_some() || network_tx.is_some()).then(|| {
            let time = network_rx
                .iter()
                .chain(network_tx.iter())
                .map(|(t, _)| *t)
                .max()
                .unwrap_or(now);
            let interface = InterfaceStats {
                name: DEFAULT_INTERFACE.to_string(),
                rx_bytes: network_rx.map(|(_, v)| v),
                tx_bytes: network_tx.map(|(_, v)| v),
                ..Default::default()
            };
            NetworkStats {
                time,
                default_interface: interface.clone(),
                interfaces: vec![interface],
            }
        });

        PodStats {
            pod_ref: PodReference {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid: uid.to_string(),
            },
            start_time,
            containers,
            cpu,
            memory,
            network,
        }
    }
}

fn container_entry<'a>(
    containers: &'a mut BTreeMap<String, ContainerStats>,
    name: &str,
    start_time: Option<DateTime<Utc>>,
) -> &'a mut ContainerStats {
    containers
        .entry(name.to_string())
        .or_insert_with(|| ContainerStats {
            name: name.to_string(),
            start_time,
            ..Default::default()
        })
}

/// Timestamp of the newest point and the full series of a pod-level metric
fn network_counter(
    result: &MetricsResult,
    metric_type: MetricType,
) -> Option<(DateTime<Utc>, &[MetricValue])> {
    let metric: &Metric = result
        .value
        .iter()
        .find(|m| m.metric_type() == Some(metric_type))?;
    let series = metric.timeseries.first()?;
    let latest = series.latest()?;
    Some((latest.time_stamp, &series.data))
}

fn sum_cpu(containers: &[ContainerStats], now: DateTime<Utc>) -> Option<CpuStats> {
    let cpus: Vec<&CpuStats> = containers.iter().filter_map(|c| c.cpu.as_ref()).collect();
    if cpus.is_empty() {
        return None;
    }
    Some(CpuStats {
        time: now,
        usage_nano_cores: Some(cpus.iter().filter_map(|c| c.usage_nano_cores).sum()),
        usage_core_nano_seconds: Some(cpus.iter().filter_map(|c| c.usage_core_nano_seconds).sum()),
    })
}

fn sum_memory(containers: &[ContainerStats], now: DateTime<Utc>) -> Option<MemoryStats> {
    let memories: Vec<&MemoryStats> = containers.iter().filter_map(|c| c.memory.as_ref()).collect();
    if memories.is_empty() {
        return None;
    }
    Some(MemoryStats {
        time: now,
        usage_bytes: Some(memories.iter().filter_map(|m| m.usage_bytes).sum()),
        working_set_bytes: Some(memories.iter().filter_map(|m| m.working_set_bytes).sum()),
        rss_bytes: None,
    })
}

#[async_trait]
impl PodStatsGetter for AggregateStatsProvider {
    async fn get_pod_stats(&self, pod: &Pod) -> Result<Option<PodStats>> {
        let (namespace, name, _) = pod_identity(pod);
        let cg_name = container_group_name(namespace, name);
        let now = self.clock.now();

        let container_request = self.request(
            now,
            vec![MetricType::CpuUsage, MetricType::MemoryUsage],
            Some(CONTAINER_DIMENSION_FILTER),
        );
        let network_request = self.request(
            now,
            vec![
                MetricType::NetworkBytesReceivedPerSecond,
                MetricType::NetworkBytesTransmittedPerSecond,
            ],
            None,
        );

        let (container_metrics, network_metrics) = tokio::try_join!(
            self.metrics
                .get_container_group_metrics(&self.resource_group, &cg_name, &container_request),
            self.metrics
                .get_container_group_metrics(&self.resource_group, &cg_name, &network_request),
        )?;

        debug!(
            container_group = %cg_name,
            metrics = container_metrics.value.len() + network_metrics.value.len(),
            "Fetched aggregate metrics"
        );

        Ok(Some(self.build_stats(
            pod,
            now,
            &container_metrics,
            &network_metrics,
        )))
    }

    fn purge_expired(&self) -> usize {
        self.tracker.purge_expired()
    }
}
