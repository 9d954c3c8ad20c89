//! Pod listing from the Kubernetes API

use super::PodLister;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

/// Lists the pods bound to one node across all namespaces
pub struct KubePodLister {
    api: Api<Pod>,
    node_name: String,
}

impl KubePodLister {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            api: Api::all(client),
            node_name: node_name.into(),
        }
    }

    fn field_selector(&self) -> String {
        node_field_selector(&self.node_name)
    }
}

fn node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name}")
}

#[async_trait]
impl PodLister for KubePodLister {
    async fn list(&self) -> Result<Vec<Pod>> {
        let params = ListParams::default().fields(&self.field_selector());
        let pods = self.api.list(&params).await?;
        debug!(node = %self.node_name, count = pods.items.len(), "Listed node pods");
        Ok(pods.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_selector_targets_node() {
        assert_eq!(node_field_selector("virtual-kubelet"), "spec.nodeName=virtual-kubelet");
    }
}
