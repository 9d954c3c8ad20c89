//! Container group client facade
//!
//! Wraps the raw control plane calls with validation, pagination, structured
//! logging and response status capture. Only log fetches are retried.

use super::validation::{container_group_name, validate_container_group};
use super::{ApiResponse, ContainerGroupsApi};
use crate::error::{Error, Result};
use crate::metrics::ContainerGroupGetter;
use crate::models::{
    Capability, ContainerGroup, ExecRequest, ExecResponse, LogOptions,
};
use crate::observability::ProviderMetrics;
use crate::retry::{retry_with_backoff, RetryConfig};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Facade over the container group control plane
pub struct AciClient {
    api: Arc<dyn ContainerGroupsApi>,
    metrics: ProviderMetrics,
    log_retry: RetryConfig,
}

impl AciClient {
    pub fn new(api: Arc<dyn ContainerGroupsApi>, metrics: ProviderMetrics) -> Self {
        Self {
            api,
            metrics,
            log_retry: RetryConfig::default(),
        }
    }

    /// Override the retry policy used for log fetches
    pub fn with_log_retry(mut self, config: RetryConfig) -> Self {
        self.log_retry = config;
        self
    }

    fn record<T>(&self, operation: &str, result: &Result<ApiResponse<T>>) {
        let status = match result {
            Ok(response) => Some(response.status),
            Err(e) => e.status(),
        };
        self.metrics.record_aci_request(operation, status);
    }

    /// Start creating (or updating) the container group for a pod.
    ///
    /// Returns once the backend accepted the request; callers that need the
    /// group to be running poll `get_container_group_info`.
    pub async fn create_container_group(
        &self,
        resource_group: &str,
        namespace: &str,
        pod_name: &str,
        container_group: &ContainerGroup,
    ) -> Result<()> {
        let name = container_group_name(namespace, pod_name);
        debug!(container_group = %name, "Creating container group");

        let result = self
            .api
            .create_or_update(resource_group, &name, container_group)
            .await;
        self.record("create_container_group", &result);

        match result {
            Ok(response) => {
                info!(
                    container_group = %name,
                    status = response.status,
                    "Container group create accepted"
                );
                Ok(())
            }
            Err(e) => {
                warn!(container_group = %name, error = %e, "Failed to create container group");
                Err(e)
            }
        }
    }

    /// Fetch and validate the container group of a pod.
    ///
    /// With a non-empty `expected_node_name`, a group tagged for another node
    /// is rejected with [`Error::NodeMismatch`].
    pub async fn get_container_group_info(
        &self,
        resource_group: &str,
        namespace: &str,
        pod_name: &str,
        expected_node_name: &str,
    ) -> Result<ContainerGroup> {
        let name = container_group_name(namespace, pod_name);
        let mut cg = self.fetch_validated(resource_group, &name).await?;

        if !expected_node_name.is_empty() && cg.node_name() != Some(expected_node_name) {
            return Err(Error::NodeMismatch {
                name,
                expected: expected_node_name.to_string(),
                actual: cg.node_name().map(str::to_string),
            });
        }

        // the name is already validated, keep it consistent with the lookup key
        cg.name.get_or_insert(name);
        Ok(cg)
    }

    async fn fetch_validated(&self, resource_group: &str, name: &str) -> Result<ContainerGroup> {
        let result = self.api.get(resource_group, name).await;
        self.record("get_container_group", &result);

        let response = result.map_err(|e| {
            debug!(container_group = %name, error = %e, "Failed to get container group");
            e
        })?;

        let mut cg = response.value;
        validate_container_group(&mut cg)?;
        Ok(cg)
    }

    /// List every container group in the resource group.
    ///
    /// Pages are followed to exhaustion; an error on any page fails the call.
    pub async fn get_container_group_list_result(
        &self,
        resource_group: &str,
    ) -> Result<Vec<ContainerGroup>> {
        let mut groups = Vec::new();
        let mut next_link: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let result = self
                .api
                .list_page(resource_group, next_link.as_deref())
                .await;
            self.record("list_container_groups", &result);

            let page = match result {
                Ok(response) => response.value,
                Err(e) => {
                    warn!(
                        resource_group = %resource_group,
                        pages_read = pages,
                        error = %e,
                        "Container group listing failed, discarding partial results"
                    );
                    return Err(e);
                }
            };

            pages += 1;
            groups.extend(page.value);
            next_link = page.next_link.filter(|link| !link.is_empty());
            if next_link.is_none() {
                break;
            }
        }

        debug!(
            resource_group = %resource_group,
            pages,
            count = groups.len(),
            "Listed container groups"
        );
        Ok(groups)
    }

    /// Region capabilities; empty when the region reports none
    pub async fn list_capabilities(&self, region: &str) -> Result<Vec<Capability>> {
        let mut capabilities = Vec::new();
        let mut next_link: Option<String> = None;

        loop {
            let result = self
                .api
                .list_capabilities_page(region, next_link.as_deref())
                .await;
            self.record("list_capabilities", &result);

            let page = result?.value;
            capabilities.extend(page.value);
            next_link = page.next_link.filter(|link| !link.is_empty());
            if next_link.is_none() {
                break;
            }
        }

        if capabilities.is_empty() {
            info!(region = %region, "Region returned no capabilities");
        }
        Ok(capabilities)
    }

    pub async fn delete_container_group(&self, resource_group: &str, name: &str) -> Result<()> {
        let result = self.api.delete(resource_group, name).await;
        self.record("delete_container_group", &result);
        result?;

        info!(container_group = %name, "Deleted container group");
        Ok(())
    }

    pub async fn execute_container_command(
        &self,
        resource_group: &str,
        container_group: &str,
        container: &str,
        request: &ExecRequest,
    ) -> Result<ExecResponse> {
        let result = self
            .api
            .execute_command(resource_group, container_group, container, request)
            .await;
        self.record("execute_command", &result);
        Ok(result?.value)
    }

    /// Fetch container logs, retrying any failure until attempts run out or
    /// `cancel` fires
    pub async fn list_logs(
        &self,
        cancel: &CancellationToken,
        resource_group: &str,
        container_group: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<String> {
        let metrics = self.metrics.clone();
        retry_with_backoff(
            &self.log_retry,
            cancel,
            "list_logs",
            |_| metrics.inc_log_fetch_retries(),
            || async {
                let result = self
                    .api
                    .list_logs(resource_group, container_group, container, options)
                    .await;
                self.record("list_logs", &result);
                result.map(|response| response.value)
            },
        )
        .await
    }
}

#[async_trait]
impl ContainerGroupGetter for AciClient {
    async fn get_container_group(&self, resource_group: &str, name: &str) -> Result<ContainerGroup> {
        self.fetch_validated(resource_group, name).await
    }
}

/// Distinct GPU SKUs offered by a region; empty means GPU is unsupported
pub fn gpu_skus(capabilities: &[Capability]) -> Vec<String> {
    capabilities
        .iter()
        .filter_map(|c| c.gpu.as_deref())
        .filter(|gpu| !gpu.is_empty() && !gpu.eq_ignore_ascii_case("none"))
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
