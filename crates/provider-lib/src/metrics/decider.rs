//! Per-pod choice between realtime and aggregate stats

use super::{pod_identity, ContainerGroupGetter, PodStatsGetter};
use crate::aci::container_group_name;
use crate::aci::extensions::has_realtime_metrics_extension;
use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::error::Result;
use crate::models::{ContainerGroup, PodStats};
use crate::observability::ProviderMetrics;
use async_trait::async_trait;
use chrono::Duration;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const CONTAINER_GROUP_CACHE_TTL_MINUTES: i64 = 5;

/// What to do for pods whose group has no realtime metrics extension
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonRealtimePolicy {
    /// Fall back to the monitoring backend
    #[default]
    Aggregate,
    /// Leave the pod out of the summary
    Skip,
}

/// Routes each pod to the realtime or aggregate stats source depending on
/// the extensions of its container group
pub struct MetricsDecider {
    groups: Arc<dyn ContainerGroupGetter>,
    resource_group: String,
    realtime: Arc<dyn PodStatsGetter>,
    aggregate: Arc<dyn PodStatsGetter>,
    policy: NonRealtimePolicy,
    cache: TtlCache<String, ContainerGroup>,
    metrics: ProviderMetrics,
}

impl MetricsDecider {
    pub fn new(
        groups: Arc<dyn ContainerGroupGetter>,
        resource_group: impl Into<String>,
        realtime: Arc<dyn PodStatsGetter>,
        aggregate: Arc<dyn PodStatsGetter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            groups,
            resource_group: resource_group.into(),
            realtime,
            aggregate,
            policy: NonRealtimePolicy::default(),
            cache: TtlCache::new(
                "container_group",
                Duration::minutes(CONTAINER_GROUP_CACHE_TTL_MINUTES),
                clock,
            ),
            metrics: ProviderMetrics::new(),
        }
    }

    pub fn with_policy(mut self, policy: NonRealtimePolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn container_group(&self, pod: &Pod) -> Result<ContainerGroup> {
        let (namespace, name, uid) = pod_identity(pod);
        let key = uid.to_string();

        if let Some(cg) = self.cache.get(&key) {
            self.metrics.record_cache_lookup("container_group", true);
            return Ok(cg);
        }
        self.metrics.record_cache_lookup("container_group", false);

        let cg = self
            .groups
            .get_container_group(&self.resource_group, &container_group_name(namespace, name))
            .await?;
        self.cache.set(key, cg.clone());
        Ok(cg)
    }
}

#[async_trait]
impl PodStatsGetter for MetricsDecider {
    async fn get_pod_stats(&self, pod: &Pod) -> Result<Option<PodStats>> {
        let cg = self.container_group(pod).await?;

        if has_realtime_metrics_extension(&cg) {
            return self.realtime.get_pod_stats(pod).await;
        }

        let (namespace, name, _) = pod_identity(pod);
        match self.policy {
            NonRealtimePolicy::Aggregate => self.aggregate.get_pod_stats(pod).await,
            NonRealtimePolicy::Skip => {
                debug!(
                    pod = %name,
                    namespace = %namespace,
                    "No realtime metrics extension, skipping pod"
                );
                Ok(None)
            }
        }
    }

    fn purge_expired(&self) -> usize {
        self.cache.purge_expired() + self.realtime.purge_expired() + self.aggregate.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aci::extensions::build_realtime_metrics_extension;
    use crate::aci::validation::fixtures::container_group;
    use crate::clock::ManualClock;
    use crate::metrics::fixtures::pod;
    use crate::models::PodReference;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeGroups {
        realtime: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContainerGroupGetter for FakeGroups {
        async fn get_container_group(&self, _resource_group: &str, name: &str) -> Result<ContainerGroup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut cg = container_group(name, "vk");
            if self.realtime {
                cg.properties.as_mut().unwrap().extensions =
                    Some(vec![build_realtime_metrics_extension()]);
            }
            Ok(cg)
        }
    }

    /// Stats source that tags its output with its own name
    struct Labelled(&'static str);

    #[async_trait]
    impl PodStatsGetter for Labelled {
        async fn get_pod_stats(&self, _pod: &Pod) -> Result<Option<PodStats>> {
            Ok(Some(PodStats {
                pod_ref: PodReference {
                    name: self.0.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }))
        }
    }

    fn decider(groups: Arc<FakeGroups>, clock: Arc<ManualClock>) -> MetricsDecider {
        MetricsDecider::new(
            groups,
            "rg",
            Arc::new(Labelled("realtime")),
            Arc::new(Labelled("aggregate")),
            clock,
        )
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn groups(realtime: bool) -> Arc<FakeGroups> {
        Arc::new(FakeGroups {
            realtime,
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn test_realtime_extension_selects_realtime() {
        let decider = decider(groups(true), clock());
        let stats = decider
            .get_pod_stats(&pod("web", "Running", None, &["web"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.pod_ref.name, "realtime");
    }

    #[tokio::test]
    async fn test_default_policy_falls_back_to_aggregate() {
        let decider = decider(groups(false), clock());
        let stats = decider
            .get_pod_stats(&pod("web", "Running", None, &["web"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.pod_ref.name, "aggregate");
    }

    #[tokio::test]
    async fn test_skip_policy_omits_pod() {
        let decider = decider(groups(false), clock()).with_policy(NonRealtimePolicy::Skip);
        let stats = decider
            .get_pod_stats(&pod("web", "Running", None, &["web"]))
            .await
            .unwrap();
        assert!(stats.is_none());
    }

    #[tokio::test]
    async fn test_group_lookup_is_cached_for_five_minutes() {
        let groups = groups(true);
        let clock = clock();
        let decider = decider(groups.clone(), clock.clone());
        let web = pod("web", "Running", None, &["web"]);

        decider.get_pod_stats(&web).await.unwrap();
        decider.get_pod_stats(&web).await.unwrap();
        assert_eq!(groups.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::minutes(5));
        decider.get_pod_stats(&web).await.unwrap();
        assert_eq!(groups.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_policy_deserializes_lowercase() {
        let policy: NonRealtimePolicy = serde_json::from_str("\"skip\"").unwrap();
        assert_eq!(policy, NonRealtimePolicy::Skip);
    }

    #[tokio::test]
    async fn test_purge_drops_groups_of_departed_pods() {
        let clock = clock();
        let decider = decider(groups(true), clock.clone());
        decider
            .get_pod_stats(&pod("gone", "Running", None, &["web"]))
            .await
            .unwrap();

        clock.advance(Duration::minutes(3));
        decider
            .get_pod_stats(&pod("alive", "Running", None, &["web"]))
            .await
            .unwrap();
        assert_eq!(decider.cache.len(), 2);

        clock.advance(Duration::minutes(3));

        assert_eq!(decider.purge_expired(), 1);
        assert_eq!(decider.cache.len(), 1);
    }
}
