//! Pod ↔ container group translation

use super::extensions::build_realtime_metrics_extension;
use super::validation::container_group_name;
use crate::dns::resolve_dns_config;
use crate::error::{Error, Result};
use crate::models::{
    states, Container, ContainerGroup, ContainerGroupProperties, ContainerProperties,
    ContainerState, EnvironmentVariable, Extension, GpuResource, IpAddress, OsType, Port,
    ResourceRequirements, ResourceSpec, CLUSTER_NAME_TAG, CREATION_TIMESTAMP_TAG, NAMESPACE_TAG,
    NODE_NAME_TAG, POD_NAME_TAG, UID_TAG,
};
use chrono::SecondsFormat;
use k8s_openapi::api::core::v1 as core;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;
use tracing::debug;

/// Extended resource name for GPU requests
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";
/// Pod annotation selecting the GPU SKU
pub const GPU_SKU_ANNOTATION: &str = "virtual-kubelet.io/gpu-type";

const DEFAULT_CPU_CORES: f64 = 1.0;
const DEFAULT_MEMORY_GB: f64 = 1.5;

/// Inputs that do not come from the pod itself
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub node_name: String,
    pub cluster_name: String,
    pub os_type: OsType,
    pub kube_dns_ip: String,
    pub cluster_domain: String,
    pub enable_realtime_metrics: bool,
    /// Prebuilt kube-proxy extension, when cluster networking is configured
    pub kube_proxy_extension: Option<Extension>,
    /// GPU SKUs the region offers; empty disables GPU
    pub gpu_skus: Vec<String>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            cluster_name: String::new(),
            os_type: OsType::Linux,
            kube_dns_ip: String::new(),
            cluster_domain: "cluster.local".to_string(),
            enable_realtime_metrics: true,
            kube_proxy_extension: None,
            gpu_skus: Vec::new(),
        }
    }
}

/// Build the container group that runs `pod`
pub fn container_group_from_pod(pod: &core::Pod, config: &TranslationConfig) -> Result<ContainerGroup> {
    let meta = &pod.metadata;
    let pod_name = meta
        .name
        .as_deref()
        .ok_or_else(|| Error::validation("pod has no name"))?;
    let namespace = meta.namespace.as_deref().unwrap_or("default");

    let spec = pod
        .spec
        .as_ref()
        .ok_or_else(|| Error::validation(format!("pod {namespace}/{pod_name} has no spec")))?;
    if spec.containers.is_empty() {
        return Err(Error::validation(format!(
            "pod {namespace}/{pod_name} declares no containers"
        )));
    }

    let gpu_sku = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(GPU_SKU_ANNOTATION))
        .map(String::as_str);

    let containers = spec
        .containers
        .iter()
        .map(|c| container_from_spec(c, gpu_sku, &config.gpu_skus))
        .collect::<Result<Vec<_>>>()?;

    let ports: Vec<Port> = containers
        .iter()
        .filter_map(|c| c.properties.as_ref())
        .flat_map(|p| p.ports.iter().flatten().cloned())
        .collect();
    let ip_address = (!ports.is_empty()).then(|| IpAddress {
        address_type: Some("Public".to_string()),
        ports,
        ..Default::default()
    });

    let mut extensions = Vec::new();
    if config.enable_realtime_metrics {
        extensions.push(build_realtime_metrics_extension());
    }
    if let Some(kube_proxy) = &config.kube_proxy_extension {
        extensions.push(kube_proxy.clone());
    }

    let mut tags = BTreeMap::new();
    tags.insert(POD_NAME_TAG.to_string(), pod_name.to_string());
    tags.insert(NAMESPACE_TAG.to_string(), namespace.to_string());
    tags.insert(NODE_NAME_TAG.to_string(), config.node_name.clone());
    tags.insert(CLUSTER_NAME_TAG.to_string(), config.cluster_name.clone());
    if let Some(uid) = &meta.uid {
        tags.insert(UID_TAG.to_string(), uid.clone());
    }
    if let Some(Time(created)) = &meta.creation_timestamp {
        tags.insert(
            CREATION_TIMESTAMP_TAG.to_string(),
            created.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    let name = container_group_name(namespace, pod_name);
    debug!(
        container_group = %name,
        containers = containers.len(),
        extensions = extensions.len(),
        "Translated pod to container group"
    );

    Ok(ContainerGroup {
        name: Some(name),
        tags: Some(tags),
        properties: Some(ContainerGroupProperties {
            containers: Some(containers),
            os_type: Some(config.os_type),
            restart_policy: Some(restart_policy(spec.restart_policy.as_deref()).to_string()),
            ip_address,
            extensions: (!extensions.is_empty()).then_some(extensions),
            dns_config: resolve_dns_config(pod, &config.kube_dns_ip, &config.cluster_domain),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn restart_policy(policy: Option<&str>) -> &'static str {
    match policy {
        Some("OnFailure") => "OnFailure",
        Some("Never") => "Never",
        _ => "Always",
    }
}

fn container_from_spec(
    container: &core::Container,
    gpu_sku: Option<&str>,
    available_skus: &[String],
) -> Result<Container> {
    let image = container
        .image
        .clone()
        .ok_or_else(|| Error::validation(format!("container {} has no image", container.name)))?;

    let command: Vec<String> = container
        .command
        .iter()
        .flatten()
        .chain(container.args.iter().flatten())
        .cloned()
        .collect();

    let environment_variables: Vec<EnvironmentVariable> = container
        .env
        .iter()
        .flatten()
        .filter_map(|env| {
            env.value.as_ref().map(|value| EnvironmentVariable {
                name: env.name.clone(),
                value: Some(value.clone()),
                secure_value: None,
            })
        })
        .collect();

    let ports: Vec<Port> = container
        .ports
        .iter()
        .flatten()
        .map(|p| Port {
            port: p.container_port,
            protocol: Some(p.protocol.clone().unwrap_or_else(|| "TCP".to_string())),
        })
        .collect();

    Ok(Container {
        name: Some(container.name.clone()),
        properties: Some(ContainerProperties {
            image: Some(image),
            command: (!command.is_empty()).then_some(command),
            ports: Some(ports),
            environment_variables: (!environment_variables.is_empty())
                .then_some(environment_variables),
            resources: Some(resources_from_spec(container, gpu_sku, available_skus)?),
            instance_view: None,
        }),
    })
}

fn resources_from_spec(
    container: &core::Container,
    gpu_sku: Option<&str>,
    available_skus: &[String],
) -> Result<ResourceRequirements> {
    let resources = container.resources.as_ref();
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());

    let request_cpu = requests
        .and_then(|r| r.get("cpu"))
        .and_then(parse_quantity)
        .map(round_cpu)
        .unwrap_or(DEFAULT_CPU_CORES);
    let request_memory = requests
        .and_then(|r| r.get("memory"))
        .and_then(parse_quantity)
        .map(bytes_to_gb)
        .unwrap_or(DEFAULT_MEMORY_GB);

    let limit_cpu = limits.and_then(|l| l.get("cpu")).and_then(parse_quantity);
    let limit_memory = limits.and_then(|l| l.get("memory")).and_then(parse_quantity);

    let gpu_count = limits
        .and_then(|l| l.get(GPU_RESOURCE_NAME))
        .and_then(parse_quantity)
        .map(|count| count.round() as i32)
        .filter(|count| *count > 0);

    let gpu = match gpu_count {
        Some(count) => Some(GpuResource {
            count,
            sku: select_gpu_sku(&container.name, gpu_sku, available_skus)?,
        }),
        None => None,
    };

    let limits = (limit_cpu.is_some() || limit_memory.is_some() || gpu.is_some()).then(|| {
        ResourceSpec {
            cpu: limit_cpu.map(round_cpu).unwrap_or(request_cpu),
            memory_in_gb: limit_memory.map(bytes_to_gb).unwrap_or(request_memory),
            gpu: gpu.clone(),
        }
    });

    Ok(ResourceRequirements {
        requests: ResourceSpec {
            cpu: request_cpu,
            memory_in_gb: request_memory,
            gpu,
        },
        limits,
    })
}

fn select_gpu_sku(container: &str, requested: Option<&str>, available: &[String]) -> Result<String> {
    if available.is_empty() {
        return Err(Error::validation(format!(
            "container {container} requests GPU but the region offers none"
        )));
    }
    match requested {
        Some(sku) => available
            .iter()
            .find(|s| s.eq_ignore_ascii_case(sku))
            .cloned()
            .ok_or_else(|| {
                Error::validation(format!(
                    "GPU SKU {sku} is not available, supported SKUs: {}",
                    available.join(", ")
                ))
            }),
        None => Ok(available[0].clone()),
    }
}

fn round_cpu(cores: f64) -> f64 {
    (cores * 100.0).round() / 100.0
}

fn bytes_to_gb(bytes: f64) -> f64 {
    ((bytes / 1e9) * 10.0).round() / 10.0
}

/// Numeric value of a Kubernetes quantity (`500m`, `1.5Gi`, `2`, `1e3`)
pub fn parse_quantity(quantity: &Quantity) -> Option<f64> {
    let raw = quantity.0.trim();
    if raw.is_empty() {
        return None;
    }

    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("n", 1e-9),
        ("u", 1e-6),
        ("m", 1e-3),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];

    for (suffix, factor) in SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }
    raw.parse::<f64>().ok()
}

/// Pod phase for a backend state string
pub fn pod_phase_from_state(state: &str) -> &'static str {
    match state {
        states::RUNNING => "Running",
        states::SUCCEEDED => "Succeeded",
        states::FAILED | states::CANCELED => "Failed",
        states::PENDING | states::CREATING | states::REPAIRING | states::ACCEPTED => "Pending",
        _ => "Unknown",
    }
}

/// Pod status observed from the container group running it
pub fn pod_status_from_container_group(pod: &core::Pod, cg: &ContainerGroup) -> core::PodStatus {
    let properties = cg.properties.as_ref();
    let state = properties
        .and_then(|p| p.instance_view.as_ref())
        .and_then(|v| v.state.as_deref())
        .or_else(|| properties.and_then(|p| p.provisioning_state.as_deref()))
        .unwrap_or(states::PENDING);
    let phase = pod_phase_from_state(state);

    let container_statuses: Vec<core::ContainerStatus> = cg
        .containers()
        .iter()
        .map(|c| container_status(c, pod))
        .collect();

    let start_time = cg
        .containers()
        .iter()
        .filter_map(|c| c.current_state().and_then(|s| s.start_time))
        .min()
        .map(Time);

    let all_ready = !container_statuses.is_empty() && container_statuses.iter().all(|s| s.ready);
    let ip = cg.ip().filter(|ip| !ip.is_empty()).map(str::to_string);

    core::PodStatus {
        phase: Some(phase.to_string()),
        pod_ip: ip,
        start_time,
        conditions: Some(vec![core::PodCondition {
            type_: "Ready".to_string(),
            status: if phase == "Running" && all_ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]),
        container_statuses: Some(container_statuses),
        ..Default::default()
    }
}

fn container_status(container: &Container, pod: &core::Pod) -> core::ContainerStatus {
    let name = container.name.clone().unwrap_or_default();
    let properties = container.properties.as_ref();
    let instance_view = properties.and_then(|p| p.instance_view.as_ref());

    let image = properties
        .and_then(|p| p.image.clone())
        .or_else(|| {
            pod.spec
                .as_ref()
                .and_then(|s| s.containers.iter().find(|c| c.name == name))
                .and_then(|c| c.image.clone())
        })
        .unwrap_or_default();

    let state = instance_view
        .and_then(|v| v.current_state.as_ref())
        .map(k8s_container_state);
    let ready = state.as_ref().map_or(false, |s| s.running.is_some());

    core::ContainerStatus {
        name,
        image,
        ready,
        started: Some(ready),
        restart_count: instance_view.and_then(|v| v.restart_count).unwrap_or(0),
        state,
        last_state: instance_view
            .and_then(|v| v.previous_state.as_ref())
            .map(k8s_container_state),
        ..Default::default()
    }
}

fn k8s_container_state(state: &ContainerState) -> core::ContainerState {
    match state.state.as_deref() {
        Some(states::RUNNING) => core::ContainerState {
            running: Some(core::ContainerStateRunning {
                started_at: state.start_time.map(Time),
            }),
            ..Default::default()
        },
        Some(states::TERMINATED) | Some(states::SUCCEEDED) | Some(states::FAILED) => {
            core::ContainerState {
                terminated: Some(core::ContainerStateTerminated {
                    exit_code: state.exit_code.unwrap_or(0),
                    started_at: state.start_time.map(Time),
                    finished_at: state.finish_time.map(Time),
                    reason: state.state.clone(),
                    message: state.detail_status.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }
        _ => core::ContainerState {
            waiting: Some(core::ContainerStateWaiting {
                reason: state.state.clone(),
                message: state.detail_status.clone(),
            }),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aci::extensions::{has_realtime_metrics_extension, KUBE_PROXY_EXTENSION_TYPE};
    use crate::aci::validation::fixtures::container_group;
    use crate::models::{ContainerGroupInstanceView, ContainerInstanceView, ExtensionProperties};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(containers: Vec<core::Container>) -> core::Pod {
        core::Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Some(core::PodSpec {
                containers,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn spec_container(name: &str) -> core::Container {
        core::Container {
            name: name.to_string(),
            image: Some("nginx:1.25".to_string()),
            ..Default::default()
        }
    }

    fn config() -> TranslationConfig {
        TranslationConfig {
            node_name: "vk".to_string(),
            cluster_name: "aks".to_string(),
            kube_dns_ip: "10.0.0.10".to_string(),
            ..Default::default()
        }
    }

    fn quantities(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&Quantity("500m".into())), Some(0.5));
        assert_eq!(parse_quantity(&Quantity("2".into())), Some(2.0));
        assert_eq!(parse_quantity(&Quantity("1Gi".into())), Some(1073741824.0));
        assert_eq!(parse_quantity(&Quantity("3G".into())), Some(3e9));
        assert_eq!(parse_quantity(&Quantity("1e3".into())), Some(1000.0));
        assert_eq!(parse_quantity(&Quantity("lots".into())), None);
    }

    #[test]
    fn test_defaults_and_tags() {
        let cg = container_group_from_pod(&pod(vec![spec_container("web")]), &config()).unwrap();

        assert_eq!(cg.name.as_deref(), Some("default-web"));
        assert_eq!(cg.node_name(), Some("vk"));
        let tags = cg.tags.as_ref().unwrap();
        assert_eq!(tags.get(POD_NAME_TAG).map(String::as_str), Some("web"));
        assert_eq!(tags.get(NAMESPACE_TAG).map(String::as_str), Some("default"));
        assert_eq!(tags.get(UID_TAG).map(String::as_str), Some("uid-1"));
        assert_eq!(tags.get(CLUSTER_NAME_TAG).map(String::as_str), Some("aks"));

        let resources = cg.containers()[0]
            .properties
            .as_ref()
            .unwrap()
            .resources
            .clone()
            .unwrap();
        assert_eq!(resources.requests.cpu, 1.0);
        assert_eq!(resources.requests.memory_in_gb, 1.5);
        assert!(resources.limits.is_none());

        let properties = cg.properties.as_ref().unwrap();
        assert_eq!(properties.restart_policy.as_deref(), Some("Always"));
        assert!(properties.ip_address.is_none());
        assert!(has_realtime_metrics_extension(&cg));
        assert_eq!(
            properties.dns_config.as_ref().unwrap().name_servers,
            vec!["10.0.0.10".to_string()]
        );
    }

    #[test]
    fn test_resources_ports_and_command() {
        let mut container = spec_container("web");
        container.command = Some(vec!["/bin/server".to_string()]);
        container.args = Some(vec!["--port".to_string(), "8080".to_string()]);
        container.ports = Some(vec![core::ContainerPort {
            container_port: 8080,
            ..Default::default()
        }]);
        container.env = Some(vec![core::EnvVar {
            name: "MODE".to_string(),
            value: Some("prod".to_string()),
            value_from: None,
        }]);
        container.resources = Some(core::ResourceRequirements {
            requests: Some(quantities(&[("cpu", "250m"), ("memory", "2G")])),
            limits: Some(quantities(&[("cpu", "2")])),
            ..Default::default()
        });

        let mut p = pod(vec![container]);
        p.spec.as_mut().unwrap().restart_policy = Some("OnFailure".to_string());
        let cg = container_group_from_pod(&p, &config()).unwrap();

        let props = cg.containers()[0].properties.as_ref().unwrap();
        assert_eq!(
            props.command.as_deref().unwrap(),
            ["/bin/server", "--port", "8080"]
        );
        assert_eq!(props.environment_variables.as_ref().unwrap()[0].name, "MODE");
        let resources = props.resources.as_ref().unwrap();
        assert_eq!(resources.requests.cpu, 0.25);
        assert_eq!(resources.requests.memory_in_gb, 2.0);
        assert_eq!(resources.limits.as_ref().unwrap().cpu, 2.0);

        let group = cg.properties.as_ref().unwrap();
        assert_eq!(group.restart_policy.as_deref(), Some("OnFailure"));
        let ip = group.ip_address.as_ref().unwrap();
        assert_eq!(ip.address_type.as_deref(), Some("Public"));
        assert_eq!(ip.ports[0].port, 8080);
        assert_eq!(ip.ports[0].protocol.as_deref(), Some("TCP"));
    }

    #[test]
    fn test_gpu_request_uses_annotation_sku() {
        let mut container = spec_container("train");
        container.resources = Some(core::ResourceRequirements {
            limits: Some(quantities(&[(GPU_RESOURCE_NAME, "2")])),
            ..Default::default()
        });
        let mut p = pod(vec![container]);
        p.metadata.annotations = Some(BTreeMap::from([(
            GPU_SKU_ANNOTATION.to_string(),
            "v100".to_string(),
        )]));

        let mut cfg = config();
        cfg.gpu_skus = vec!["K80".to_string(), "V100".to_string()];
        let cg = container_group_from_pod(&p, &cfg).unwrap();

        let gpu = cg.containers()[0]
            .properties
            .as_ref()
            .unwrap()
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap()
            .gpu
            .clone()
            .unwrap();
        assert_eq!(gpu.count, 2);
        assert_eq!(gpu.sku, "V100");
    }

    #[test]
    fn test_gpu_request_without_region_support_fails() {
        let mut container = spec_container("train");
        container.resources = Some(core::ResourceRequirements {
            limits: Some(quantities(&[(GPU_RESOURCE_NAME, "1")])),
            ..Default::default()
        });

        let err = container_group_from_pod(&pod(vec![container]), &config()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_pod_without_containers_is_rejected() {
        let err = container_group_from_pod(&pod(vec![]), &config()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_kube_proxy_extension_is_attached() {
        let mut cfg = config();
        cfg.enable_realtime_metrics = false;
        cfg.kube_proxy_extension = Some(Extension {
            name: "kube-proxy".to_string(),
            properties: ExtensionProperties {
                extension_type: KUBE_PROXY_EXTENSION_TYPE.to_string(),
                version: "1.0".to_string(),
                settings: Default::default(),
                protected_settings: Default::default(),
            },
        });

        let cg = container_group_from_pod(&pod(vec![spec_container("web")]), &cfg).unwrap();
        assert_eq!(cg.extensions().len(), 1);
        assert!(!has_realtime_metrics_extension(&cg));
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(pod_phase_from_state("Running"), "Running");
        assert_eq!(pod_phase_from_state("Succeeded"), "Succeeded");
        assert_eq!(pod_phase_from_state("Failed"), "Failed");
        assert_eq!(pod_phase_from_state("Canceled"), "Failed");
        for state in ["Pending", "Creating", "Repairing", "Accepted"] {
            assert_eq!(pod_phase_from_state(state), "Pending");
        }
        assert_eq!(pod_phase_from_state("Bogus"), "Unknown");
    }

    #[test]
    fn test_status_from_running_group() {
        let p = pod(vec![spec_container("web")]);
        let cg = container_group("default-web", "vk");

        let status = pod_status_from_container_group(&p, &cg);
        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(status.pod_ip.as_deref(), Some("10.0.0.4"));

        let containers = status.container_statuses.unwrap();
        assert_eq!(containers.len(), 1);
        assert!(containers[0].ready);
        assert!(containers[0].state.as_ref().unwrap().running.is_some());
        assert_eq!(status.conditions.unwrap()[0].status, "True");
    }

    #[test]
    fn test_status_terminated_container_with_last_state() {
        let p = pod(vec![spec_container("web")]);
        let mut cg = container_group("default-web", "vk");
        {
            let props = cg.properties.as_mut().unwrap();
            props.instance_view = Some(ContainerGroupInstanceView {
                state: Some("Canceled".to_string()),
                events: vec![],
            });
            let container = &mut props.containers.as_mut().unwrap()[0];
            container.properties.as_mut().unwrap().instance_view = Some(ContainerInstanceView {
                restart_count: Some(3),
                current_state: Some(ContainerState {
                    state: Some("Terminated".to_string()),
                    exit_code: Some(137),
                    ..Default::default()
                }),
                previous_state: Some(ContainerState {
                    state: Some("Waiting".to_string()),
                    ..Default::default()
                }),
                events: vec![],
            });
        }

        let status = pod_status_from_container_group(&p, &cg);
        assert_eq!(status.phase.as_deref(), Some("Failed"));

        let container = &status.container_statuses.unwrap()[0];
        assert!(!container.ready);
        assert_eq!(container.restart_count, 3);
        assert_eq!(
            container
                .state
                .as_ref()
                .unwrap()
                .terminated
                .as_ref()
                .unwrap()
                .exit_code,
            137
        );
        assert!(container.last_state.as_ref().unwrap().waiting.is_some());
    }
}
