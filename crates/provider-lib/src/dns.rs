//! Pod DNS policy resolution
//!
//! Maps a pod's `dnsPolicy` / `dnsConfig` to the container group DNS
//! override, clamped to the limits the backend resolver accepts.

use crate::models::DnsConfig;
use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

pub const MAX_DNS_NAMESERVERS: usize = 3;
pub const MAX_DNS_SEARCH_PATHS: usize = 6;
pub const MAX_DNS_SEARCH_DOMAIN_LENGTH: usize = 255;
pub const MAX_DNS_SEARCH_LINE_LENGTH: usize = 256;

const DNS_CLUSTER_FIRST: &str = "ClusterFirst";
const DNS_CLUSTER_FIRST_WITH_HOST_NET: &str = "ClusterFirstWithHostNet";

/// Resolve the DNS override for a pod.
///
/// Returns `None` when no nameserver is configured, leaving the platform
/// default resolver in place.
pub fn resolve_dns_config(pod: &Pod, kube_dns_ip: &str, cluster_domain: &str) -> Option<DnsConfig> {
    let spec = pod.spec.as_ref()?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");

    let mut nameservers: Vec<String> = Vec::new();
    let mut searches: Vec<String> = Vec::new();
    let mut options: Vec<String> = Vec::new();

    let policy = spec.dns_policy.as_deref().unwrap_or(DNS_CLUSTER_FIRST);
    if policy == DNS_CLUSTER_FIRST || policy == DNS_CLUSTER_FIRST_WITH_HOST_NET {
        if !kube_dns_ip.is_empty() {
            nameservers.push(kube_dns_ip.to_string());
        }
        searches.push(format!("{namespace}.svc.{cluster_domain}"));
        searches.push(format!("svc.{cluster_domain}"));
        searches.push(cluster_domain.to_string());
    }

    if let Some(dns_config) = spec.dns_config.as_ref() {
        nameservers.extend(dns_config.nameservers.iter().flatten().cloned());
        searches.extend(dns_config.searches.iter().flatten().cloned());
        for option in dns_config.options.iter().flatten() {
            match (option.name.as_deref(), option.value.as_deref()) {
                (Some(name), Some(value)) => options.push(format!("{name}:{value}")),
                (Some(name), None) => options.push(name.to_string()),
                _ => {}
            }
        }
    }

    let nameservers = form_dns_nameservers_fits_limits(dedup(nameservers), pod);
    if nameservers.is_empty() {
        return None;
    }
    let searches = form_dns_searches_fits_limits(dedup(searches), pod);
    let options = dedup(options);

    Some(DnsConfig {
        name_servers: nameservers,
        search_domains: (!searches.is_empty()).then(|| searches.join(" ")),
        options: (!options.is_empty()).then(|| options.join(" ")),
    })
}

/// Keep at most three nameservers
pub fn form_dns_nameservers_fits_limits(mut nameservers: Vec<String>, pod: &Pod) -> Vec<String> {
    if nameservers.len() > MAX_DNS_NAMESERVERS {
        warn!(
            pod = %pod_label(pod),
            dropped = ?&nameservers[MAX_DNS_NAMESERVERS..],
            "Nameserver limits exceeded, some nameservers have been omitted"
        );
        nameservers.truncate(MAX_DNS_NAMESERVERS);
    }
    nameservers
}

/// Keep at most six search domains whose joined line fits the resolver limit
pub fn form_dns_searches_fits_limits(searches: Vec<String>, pod: &Pod) -> Vec<String> {
    let mut limits_exceeded = false;

    let mut searches: Vec<String> = searches
        .into_iter()
        .filter(|s| {
            let fits = s.len() <= MAX_DNS_SEARCH_DOMAIN_LENGTH;
            limits_exceeded |= !fits;
            fits
        })
        .collect();

    if searches.len() > MAX_DNS_SEARCH_PATHS {
        searches.truncate(MAX_DNS_SEARCH_PATHS);
        limits_exceeded = true;
    }

    while !searches.is_empty() && searches.join(" ").len() > MAX_DNS_SEARCH_LINE_LENGTH {
        searches.pop();
        limits_exceeded = true;
    }

    if limits_exceeded {
        warn!(
            pod = %pod_label(pod),
            applied = %searches.join(" "),
            "Search line limits exceeded, some search paths have been omitted"
        );
    }

    searches
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

fn pod_label(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}
