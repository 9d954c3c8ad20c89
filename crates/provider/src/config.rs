//! Provider configuration

use anyhow::{bail, Context, Result};
use provider_lib::metrics::{NonRealtimePolicy, DEFAULT_REALTIME_METRICS_PORT};
use provider_lib::OsType;
use serde::Deserialize;

/// Provider configuration, read from `ACI_*` environment variables.
///
/// Nested fields use `__`, e.g. `ACI_KUBE_PROXY__SECRET_PATH`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Virtual node name
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port serving health, metrics and stats
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub subscription_id: String,

    #[serde(default)]
    pub resource_group: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_arm_endpoint")]
    pub arm_endpoint: String,

    /// Bearer token for the management API
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_os_type")]
    pub os_type: OsType,

    #[serde(default)]
    pub cluster_name: String,

    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,

    #[serde(default)]
    pub kube_dns_ip: String,

    #[serde(default = "default_realtime_metrics_port")]
    pub realtime_metrics_port: u16,

    /// Pod stats fetches in flight per summary
    #[serde(default = "default_stats_concurrency")]
    pub stats_concurrency: usize,

    #[serde(default)]
    pub non_realtime_metrics: NonRealtimePolicy,

    #[serde(default = "default_true")]
    pub enable_realtime_metrics: bool,

    /// Cluster networking for container groups, disabled when absent
    #[serde(default)]
    pub kube_proxy: Option<KubeProxyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KubeProxyConfig {
    /// Directory with the service account `ca.crt` and `token`
    pub secret_path: String,
    pub master_uri: String,
    pub cluster_cidr: String,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "virtual-kubelet".to_string())
}

fn default_api_port() -> u16 {
    10255
}

fn default_region() -> String {
    "westus2".to_string()
}

fn default_arm_endpoint() -> String {
    "https://management.azure.com".to_string()
}

fn default_os_type() -> OsType {
    OsType::Linux
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

fn default_realtime_metrics_port() -> u16 {
    DEFAULT_REALTIME_METRICS_PORT
}

fn default_stats_concurrency() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(
            config::Environment::with_prefix("ACI")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn from_source(source: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(source)
            .build()
            .context("Failed to read provider configuration")?;

        let config: ProviderConfig = config
            .try_deserialize()
            .context("Invalid provider configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.subscription_id.is_empty() {
            bail!("ACI_SUBSCRIPTION_ID is required");
        }
        if self.resource_group.is_empty() {
            bail!("ACI_RESOURCE_GROUP is required");
        }
        if self.access_token.as_deref().map_or(true, str::is_empty) {
            bail!("ACI_ACCESS_TOKEN is required");
        }
        if self.stats_concurrency == 0 {
            bail!("ACI_STATS_CONCURRENCY must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix("ACI")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(Some(source))
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("ACI_SUBSCRIPTION_ID", "sub"),
        ("ACI_RESOURCE_GROUP", "rg"),
        ("ACI_ACCESS_TOKEN", "token"),
    ];

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::from_source(env(REQUIRED)).unwrap();

        assert_eq!(config.api_port, 10255);
        assert_eq!(config.realtime_metrics_port, 18899);
        assert_eq!(config.stats_concurrency, 10);
        assert_eq!(config.cluster_domain, "cluster.local");
        assert_eq!(config.os_type, OsType::Linux);
        assert_eq!(config.non_realtime_metrics, NonRealtimePolicy::Aggregate);
        assert!(config.enable_realtime_metrics);
        assert!(config.kube_proxy.is_none());
    }

    #[test]
    fn test_overrides_and_nested_values() {
        let mut vars = REQUIRED.to_vec();
        vars.extend_from_slice(&[
            ("ACI_API_PORT", "9000"),
            ("ACI_NON_REALTIME_METRICS", "skip"),
            ("ACI_ENABLE_REALTIME_METRICS", "false"),
            ("ACI_KUBE_PROXY__SECRET_PATH", "/var/run/secrets/kp"),
            ("ACI_KUBE_PROXY__MASTER_URI", "https://10.0.0.1:443"),
            ("ACI_KUBE_PROXY__CLUSTER_CIDR", "10.240.0.0/16"),
        ]);

        let config = ProviderConfig::from_source(env(&vars)).unwrap();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.non_realtime_metrics, NonRealtimePolicy::Skip);
        assert!(!config.enable_realtime_metrics);
        let kube_proxy = config.kube_proxy.unwrap();
        assert_eq!(kube_proxy.secret_path, "/var/run/secrets/kp");
        assert_eq!(kube_proxy.cluster_cidr, "10.240.0.0/16");
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let err = ProviderConfig::from_source(env(&[("ACI_SUBSCRIPTION_ID", "sub")])).unwrap_err();
        assert!(err.to_string().contains("ACI_RESOURCE_GROUP"));
    }
}
