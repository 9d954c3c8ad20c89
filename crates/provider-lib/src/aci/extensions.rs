//! Container group extensions
//!
//! Two extensions are understood locally:
//! - `kube-proxy`: runs a kube-proxy sidecar with an embedded kubeconfig
//! - `realtime-metrics`: opts the group into the stats sidecar on port 18899

use crate::error::{Error, Result};
use crate::models::{ContainerGroup, Extension, ExtensionProperties};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const KUBE_PROXY_EXTENSION_NAME: &str = "kube-proxy";
pub const KUBE_PROXY_EXTENSION_TYPE: &str = "kube-proxy";
pub const KUBE_PROXY_EXTENSION_VERSION: &str = "1.0";
pub const KUBE_PROXY_KUBE_VERSION: &str = "v1.9.10";

pub const REALTIME_METRICS_EXTENSION_NAME: &str = "vk-realtime-metrics";
pub const REALTIME_METRICS_EXTENSION_TYPE: &str = "realtime-metrics";
pub const REALTIME_METRICS_EXTENSION_VERSION: &str = "1.0";

pub const SETTING_CLUSTER_CIDR: &str = "clusterCIDR";
pub const SETTING_KUBE_VERSION: &str = "kubeVersion";
pub const SETTING_KUBE_CONFIG: &str = "kubeConfig";

const RECOGNIZED: &[(&str, &str)] = &[
    (KUBE_PROXY_EXTENSION_TYPE, KUBE_PROXY_EXTENSION_VERSION),
    (REALTIME_METRICS_EXTENSION_TYPE, REALTIME_METRICS_EXTENSION_VERSION),
];

/// Cluster credentials embedded into the kube-proxy kubeconfig
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClusterCredentials {
    certificate_authority_data: String,
    token: String,
}

/// Build the kube-proxy extension.
///
/// Credentials come from the ambient kubeconfig (`KUBECONFIG`) when it has
/// them, otherwise from the service account files under `secret_path`.
pub fn build_kube_proxy_extension(
    secret_path: impl AsRef<Path>,
    master_uri: &str,
    cluster_cidr: &str,
) -> Result<Extension> {
    let kubeconfig_path = std::env::var_os("KUBECONFIG").map(PathBuf::from);
    build_kube_proxy_extension_with(
        kubeconfig_path.as_deref(),
        secret_path.as_ref(),
        master_uri,
        cluster_cidr,
    )
}

pub(crate) fn build_kube_proxy_extension_with(
    kubeconfig_path: Option<&Path>,
    secret_path: &Path,
    master_uri: &str,
    cluster_cidr: &str,
) -> Result<Extension> {
    let credentials = match kubeconfig_path.and_then(credentials_from_kubeconfig) {
        Some(credentials) => {
            debug!("Using ambient kubeconfig credentials for kube-proxy extension");
            credentials
        }
        None => credentials_from_secret(secret_path)?,
    };

    let kubeconfig = EmbeddedKubeconfig::new(master_uri, credentials);
    let encoded = BASE64.encode(serde_yaml::to_string(&kubeconfig)?);

    let mut settings = Map::new();
    settings.insert(SETTING_CLUSTER_CIDR.to_string(), Value::from(cluster_cidr));
    settings.insert(SETTING_KUBE_VERSION.to_string(), Value::from(KUBE_PROXY_KUBE_VERSION));

    let mut protected_settings = Map::new();
    protected_settings.insert(SETTING_KUBE_CONFIG.to_string(), Value::from(encoded));

    info!(master_uri = %master_uri, cluster_cidr = %cluster_cidr, "Built kube-proxy extension");

    Ok(Extension {
        name: KUBE_PROXY_EXTENSION_NAME.to_string(),
        properties: ExtensionProperties {
            extension_type: KUBE_PROXY_EXTENSION_TYPE.to_string(),
            version: KUBE_PROXY_EXTENSION_VERSION.to_string(),
            settings,
            protected_settings,
        },
    })
}

/// Static descriptor opting a group into realtime metrics
pub fn build_realtime_metrics_extension() -> Extension {
    Extension {
        name: REALTIME_METRICS_EXTENSION_NAME.to_string(),
        properties: ExtensionProperties {
            extension_type: REALTIME_METRICS_EXTENSION_TYPE.to_string(),
            version: REALTIME_METRICS_EXTENSION_VERSION.to_string(),
            settings: Map::new(),
            protected_settings: Map::new(),
        },
    }
}

/// True when the group carries the realtime metrics extension, whatever its
/// version or settings
pub fn has_realtime_metrics_extension(cg: &ContainerGroup) -> bool {
    cg.extensions()
        .iter()
        .any(|e| e.properties.extension_type == REALTIME_METRICS_EXTENSION_TYPE)
}

/// True for the type/version pairs this provider acts on
pub fn is_recognized(extension: &Extension) -> bool {
    RECOGNIZED.iter().any(|(t, v)| {
        extension.properties.extension_type == *t && extension.properties.version == *v
    })
}

fn credentials_from_secret(secret_path: &Path) -> Result<ClusterCredentials> {
    let ca_path = secret_path.join("ca.crt");
    let token_path = secret_path.join("token");

    let ca = std::fs::read(&ca_path).map_err(|e| {
        Error::configuration(format!(
            "no kubeconfig available and cannot read {}: {e}",
            ca_path.display()
        ))
    })?;
    let token = std::fs::read_to_string(&token_path).map_err(|e| {
        Error::configuration(format!(
            "no kubeconfig available and cannot read {}: {e}",
            token_path.display()
        ))
    })?;

    Ok(ClusterCredentials {
        certificate_authority_data: BASE64.encode(ca),
        token: token.trim().to_string(),
    })
}

fn credentials_from_kubeconfig(path: &Path) -> Option<ClusterCredentials> {
    let content = std::fs::read_to_string(path).ok()?;
    let kubeconfig: AmbientKubeconfig = match serde_yaml::from_str(&content) {
        Ok(k) => k,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Ignoring unparsable kubeconfig");
            return None;
        }
    };

    let context_name = kubeconfig.current_context.as_deref()?;
    let context = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)?;
    let cluster = kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == context.context.cluster)?;
    let user = kubeconfig
        .users
        .iter()
        .find(|u| u.name == context.context.user)?;

    Some(ClusterCredentials {
        certificate_authority_data: cluster.cluster.certificate_authority_data.clone()?,
        token: user.user.token.clone()?,
    })
}

#[derive(Debug, Deserialize)]
struct AmbientKubeconfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClusterEntry {
    #[serde(rename = "certificate-authority-data", skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    server: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

/// Kubeconfig handed to the kube-proxy sidecar
#[derive(Debug, Serialize)]
struct EmbeddedKubeconfig {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: &'static str,
}

impl EmbeddedKubeconfig {
    const NAME: &'static str = "virtual-kubelet";

    fn new(master_uri: &str, credentials: ClusterCredentials) -> Self {
        Self {
            api_version: "v1",
            kind: "Config",
            clusters: vec![NamedCluster {
                name: Self::NAME.to_string(),
                cluster: ClusterEntry {
                    certificate_authority_data: Some(credentials.certificate_authority_data),
                    server: master_uri.to_string(),
                },
            }],
            users: vec![NamedUser {
                name: Self::NAME.to_string(),
                user: UserEntry {
                    token: Some(credentials.token),
                },
            }],
            contexts: vec![NamedContext {
                name: Self::NAME.to_string(),
                context: ContextEntry {
                    cluster: Self::NAME.to_string(),
                    user: Self::NAME.to_string(),
                },
            }],
            current_context: Self::NAME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aci::validation::fixtures::container_group;
    use tempfile::TempDir;

    fn decode_kubeconfig(extension: &Extension) -> serde_yaml::Value {
        let encoded = extension.properties.protected_settings[SETTING_KUBE_CONFIG]
            .as_str()
            .unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        serde_yaml::from_slice(&decoded).unwrap()
    }

    #[test]
    fn test_kube_proxy_extension_from_secret_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ca.crt"), b"CA-PEM").unwrap();
        std::fs::write(dir.path().join("token"), "secret-token\n").unwrap();

        let ext = build_kube_proxy_extension_with(
            None,
            dir.path(),
            "https://10.0.0.1:443",
            "10.240.0.0/16",
        )
        .unwrap();

        assert_eq!(ext.properties.extension_type, KUBE_PROXY_EXTENSION_TYPE);
        assert!(is_recognized(&ext));
        assert_eq!(ext.properties.settings[SETTING_CLUSTER_CIDR], "10.240.0.0/16");
        assert_eq!(ext.properties.settings[SETTING_KUBE_VERSION], KUBE_PROXY_KUBE_VERSION);

        let kubeconfig = decode_kubeconfig(&ext);
        assert_eq!(kubeconfig["clusters"][0]["cluster"]["server"], "https://10.0.0.1:443");
        assert_eq!(
            kubeconfig["clusters"][0]["cluster"]["certificate-authority-data"],
            BASE64.encode("CA-PEM")
        );
        assert_eq!(kubeconfig["users"][0]["user"]["token"], "secret-token");
        assert_eq!(kubeconfig["current-context"], "virtual-kubelet");
    }

    #[test]
    fn test_kube_proxy_extension_prefers_ambient_kubeconfig() {
        let dir = TempDir::new().unwrap();
        let kubeconfig_path = dir.path().join("config");
        std::fs::write(
            &kubeconfig_path,
            r#"
apiVersion: v1
kind: Config
current-context: admin@prod
clusters:
- name: prod
  cluster:
    server: https://prod.example.com
    certificate-authority-data: QU1CSUVOVA==
contexts:
- name: admin@prod
  context:
    cluster: prod
    user: admin
users:
- name: admin
  user:
    token: ambient-token
"#,
        )
        .unwrap();

        let ext = build_kube_proxy_extension_with(
            Some(&kubeconfig_path),
            &dir.path().join("missing"),
            "https://10.0.0.1:443",
            "10.240.0.0/16",
        )
        .unwrap();

        let kubeconfig = decode_kubeconfig(&ext);
        assert_eq!(kubeconfig["users"][0]["user"]["token"], "ambient-token");
        assert_eq!(
            kubeconfig["clusters"][0]["cluster"]["certificate-authority-data"],
            "QU1CSUVOVA=="
        );
    }

    #[test]
    fn test_kube_proxy_extension_without_credentials_fails() {
        let dir = TempDir::new().unwrap();
        let err = build_kube_proxy_extension_with(
            None,
            &dir.path().join("missing"),
            "https://10.0.0.1:443",
            "10.240.0.0/16",
        )
        .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_realtime_extension_detection_ignores_version() {
        let mut cg = container_group("default-web", "vk");
        assert!(!has_realtime_metrics_extension(&cg));

        let mut ext = build_realtime_metrics_extension();
        assert!(is_recognized(&ext));
        ext.properties.version = "2.0".to_string();
        ext.properties
            .settings
            .insert("anything".to_string(), Value::from(true));
        assert!(!is_recognized(&ext));

        cg.properties.as_mut().unwrap().extensions = Some(vec![ext]);
        assert!(has_realtime_metrics_extension(&cg));
    }
}
