//! Pod stats acquisition and node summary aggregation
//!
//! Per-pod stats come from one of two sources:
//! - A realtime sidecar polled over HTTP inside the container group
//! - The monitoring backend, reconciled into cumulative counters
//!
//! `MetricsDecider` picks the source per pod and `StatsSummaryProvider` fans
//! the per-pod calls out and folds them into a node summary.

mod aggregate;
mod decider;
mod kube_lister;
mod realtime;
mod reconcile;
mod summary;
mod task_group;

pub use aggregate::AggregateStatsProvider;
pub use decider::{MetricsDecider, NonRealtimePolicy};
pub use kube_lister::KubePodLister;
pub use realtime::{RealtimePodStats, RealtimeStatsProvider, DEFAULT_REALTIME_METRICS_PORT};
pub use reconcile::{accumulate, CumulativeUsageTracker, CumulativeValue, PodCumulativeUsage};
pub use summary::{StatsSummaryProvider, SummaryConfig};
pub use task_group::TaskGroup;

use crate::error::Result;
use crate::models::{ContainerGroup, MetricsRequest, MetricsResult, PodStats};
use k8s_openapi::api::core::v1::Pod;

pub use async_trait::async_trait;

/// Source of stats for a single pod
#[async_trait]
pub trait PodStatsGetter: Send + Sync {
    /// Stats for `pod`, or `None` when the pod should be left out of the summary
    async fn get_pod_stats(&self, pod: &Pod) -> Result<Option<PodStats>>;

    /// Drop per-pod state of pods not seen within their TTL, returning how
    /// many entries were removed
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Pods scheduled on this node
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list(&self) -> Result<Vec<Pod>>;
}

#[async_trait]
pub trait ContainerGroupGetter: Send + Sync {
    async fn get_container_group(&self, resource_group: &str, name: &str) -> Result<ContainerGroup>;
}

/// Range queries against the monitoring backend
#[async_trait]
pub trait MetricsGetter: Send + Sync {
    async fn get_container_group_metrics(
        &self,
        resource_group: &str,
        container_group: &str,
        request: &MetricsRequest,
    ) -> Result<MetricsResult>;
}

/// Namespace, name and UID of a pod, with empty strings for missing fields
pub(crate) fn pod_identity(pod: &Pod) -> (&str, &str, &str) {
    let meta = &pod.metadata;
    (
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
        meta.uid.as_deref().unwrap_or_default(),
    )
}

pub(crate) fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    /// Pod with the given containers, phase and IP
    pub fn pod(name: &str, phase: &str, ip: Option<&str>, containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|c| Container {
                        name: c.to_string(),
                        image: Some("nginx".to_string()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
        }
    }
}
