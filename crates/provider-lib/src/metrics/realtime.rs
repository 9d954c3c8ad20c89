//! Pod stats pulled from the realtime metrics sidecar

use super::{pod_identity, pod_phase, PodStatsGetter};
use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{
    ContainerStats, CpuStats, InterfaceStats, MemoryStats, NetworkStats, PodReference, PodStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_REALTIME_METRICS_PORT: u16 = 18899;
const STATS_PATH: &str = "/v1/stats";
const PREVIOUS_POLL_TTL_MINUTES: i64 = 10;

/// Payload served by the sidecar; counters are cumulative since start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimePodStats {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<RealtimeCpu>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<RealtimeMemory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<RealtimeNetwork>,
    #[serde(default)]
    pub containers: Vec<RealtimeContainerStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeCpu {
    pub usage_core_nano_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMemory {
    #[serde(default)]
    pub usage_bytes: Option<u64>,
    #[serde(default)]
    pub working_set_bytes: Option<u64>,
    #[serde(default)]
    pub rss_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealtimeNetwork {
    #[serde(default)]
    pub interfaces: Vec<InterfaceStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeContainerStats {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<RealtimeCpu>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<RealtimeMemory>,
}

/// Nanocore rate between two cumulative readings; zero when it cannot be
/// computed
fn nano_core_rate(
    current: Option<&RealtimeCpu>,
    current_time: DateTime<Utc>,
    previous: Option<&RealtimeCpu>,
    previous_time: DateTime<Utc>,
) -> u64 {
    let (Some(current), Some(previous)) = (current, previous) else {
        return 0;
    };
    let seconds = (current_time - previous_time).num_seconds();
    if seconds <= 0 || current.usage_core_nano_seconds < previous.usage_core_nano_seconds {
        return 0;
    }
    (current.usage_core_nano_seconds - previous.usage_core_nano_seconds) / seconds as u64
}

fn memory_stats(memory: &RealtimeMemory, time: DateTime<Utc>) -> MemoryStats {
    MemoryStats {
        time,
        usage_bytes: memory.usage_bytes,
        working_set_bytes: memory.working_set_bytes,
        rss_bytes: memory.rss_bytes,
    }
}

/// Polls `http://{podIP}:{port}/v1/stats` and derives rates from the
/// previous poll of the same pod
pub struct RealtimeStatsProvider {
    http: Client,
    port: u16,
    previous: TtlCache<String, RealtimePodStats>,
}

impl RealtimeStatsProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            http: Client::new(),
            port: DEFAULT_REALTIME_METRICS_PORT,
            previous: TtlCache::new(
                "realtime_previous_poll",
                Duration::minutes(PREVIOUS_POLL_TTL_MINUTES),
                clock,
            ),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn fetch(&self, ip: &str) -> Result<RealtimePodStats> {
        let url = format!("http://{ip}:{}{STATS_PATH}", self.port);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::transient(
                Some(status.as_u16()),
                format!("GET {url} returned {status}"),
            ));
        }
        Ok(response.json().await?)
    }

    fn build_stats(
        pod: &Pod,
        current: &RealtimePodStats,
        previous: Option<&RealtimePodStats>,
    ) -> PodStats {
        let (namespace, name, uid) = pod_identity(pod);
        let time = current.timestamp;
        let previous_time = previous.map(|p| p.timestamp).unwrap_or(time);

        let containers = current
            .containers
            .iter()
            .map(|c| {
                let previous_cpu = previous
                    .and_then(|p| p.containers.iter().find(|pc| pc.name == c.name))
                    .and_then(|pc| pc.cpu.as_ref());
                ContainerStats {
                    name: c.name.clone(),
                    start_time: c.start_time,
                    cpu: c.cpu.as_ref().map(|cpu| CpuStats {
                        time,
                        usage_nano_cores: Some(nano_core_rate(
                            Some(cpu),
                            time,
                            previous_cpu,
                            previous_time,
                        )),
                        usage_core_nano_seconds: Some(cpu.usage_core_nano_seconds),
                    }),
                    memory: c.memory.as_ref().map(|m| memory_stats(m, time)),
                }
            })
            .collect();

        let cpu = current.cpu.as_ref().map(|cpu| CpuStats {
            time,
            usage_nano_cores: Some(nano_core_rate(
                Some(cpu),
                time,
                previous.and_then(|p| p.cpu.as_ref()),
                previous_time,
            )),
            usage_core_nano_seconds: Some(cpu.usage_core_nano_seconds),
        });

        let network = current.network.as_ref().and_then(|n| {
            let default_interface = n.interfaces.first()?.clone();
            Some(NetworkStats {
                time,
                default_interface,
                interfaces: n.interfaces.clone(),
            })
        });

        PodStats {
            pod_ref: PodReference {
                name: name.to_string(),
                namespace: namespace.to_string(),
                uid: uid.to_string(),
            },
            start_time: pod
                .status
                .as_ref()
                .and_then(|s| s.start_time.as_ref())
                .map(|t| t.0),
            containers,
            cpu,
            memory: current.memory.as_ref().map(|m| memory_stats(m, time)),
            network,
        }
    }
}

#[async_trait]
impl PodStatsGetter for RealtimeStatsProvider {
    async fn get_pod_stats(&self, pod: &Pod) -> Result<Option<PodStats>> {
        let (namespace, name, uid) = pod_identity(pod);
        let phase = pod_phase(pod).unwrap_or_default();
        if phase != "Running" {
            return Err(Error::invalid_state(format!(
                "pod {namespace}/{name} is {phase}, realtime stats need a running pod"
            )));
        }
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                Error::invalid_state(format!("pod {namespace}/{name} has no IP address"))
            })?;

        let mut current = self.fetch(ip).await?;

        let known: HashSet<&str> = pod
            .spec
            .iter()
            .flat_map(|s| s.containers.iter().map(|c| c.name.as_str()))
            .collect();
        let reported = current.containers.len();
        current.containers.retain(|c| known.contains(c.name.as_str()));
        if current.containers.len() != reported {
            debug!(
                pod = %name,
                namespace = %namespace,
                dropped = reported - current.containers.len(),
                "Dropped containers unknown to the pod spec"
            );
        }

        let uid = uid.to_string();
        let previous = self.previous.get(&uid);
        let stats = Self::build_stats(pod, &current, previous.as_ref());
        self.previous.set(uid, current);

        Ok(Some(stats))
    }

    fn purge_expired(&self) -> usize {
        self.previous.purge_expired()
    }
}
