//! ACI provider - virtual kubelet backed by container groups
//!
//! Serves node stats for the pods bound to the virtual node, collected from
//! realtime sidecars or the monitoring backend, alongside health and metrics.

use anyhow::{Context, Result};
use provider_lib::{
    aci::{extensions::build_kube_proxy_extension, gpu_skus, TranslationConfig},
    clock::system_clock,
    health::{components, HealthRegistry},
    metrics::{AggregateStatsProvider, KubePodLister, RealtimeStatsProvider},
    observability::{ProviderMetrics, StructuredLogger},
    AciClient, ArmClient, ArmConfig, MetricsDecider, StaticTokenSource, StatsSummaryProvider,
    SummaryConfig,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const PROVIDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting aci-provider");

    let config = config::ProviderConfig::load()?;
    info!(
        node_name = %config.node_name,
        resource_group = %config.resource_group,
        region = %config.region,
        "Provider configured"
    );

    let health_registry = HealthRegistry::with_provider_components().await;
    let metrics = ProviderMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(PROVIDER_VERSION, &config.resource_group, &config.region);

    let clock = system_clock();
    let token = config.access_token.clone().unwrap_or_default();
    let arm = Arc::new(ArmClient::new(
        ArmConfig::new(&config.subscription_id).with_endpoint(&config.arm_endpoint),
        Arc::new(StaticTokenSource::new(token)),
    )?);
    let aci = Arc::new(AciClient::new(arm.clone(), metrics.clone()));

    let skus = match aci.list_capabilities(&config.region).await {
        Ok(capabilities) => {
            health_registry.set_healthy(components::ACI_CLIENT).await;
            gpu_skus(&capabilities)
        }
        Err(e) => {
            warn!(error = %e, "Failed to list region capabilities, GPU disabled");
            health_registry
                .set_degraded(components::ACI_CLIENT, e.to_string())
                .await;
            Vec::new()
        }
    };
    logger.log_gpu_capabilities(&config.region, &skus);

    let kube_proxy_extension = config
        .kube_proxy
        .as_ref()
        .map(|kp| build_kube_proxy_extension(&kp.secret_path, &kp.master_uri, &kp.cluster_cidr))
        .transpose()
        .context("Failed to build kube-proxy extension")?;

    let translation = TranslationConfig {
        node_name: config.node_name.clone(),
        cluster_name: config.cluster_name.clone(),
        os_type: config.os_type,
        kube_dns_ip: config.kube_dns_ip.clone(),
        cluster_domain: config.cluster_domain.clone(),
        enable_realtime_metrics: config.enable_realtime_metrics,
        kube_proxy_extension,
        gpu_skus: skus,
    };
    info!(
        os_type = ?translation.os_type,
        realtime_metrics = translation.enable_realtime_metrics,
        kube_proxy = translation.kube_proxy_extension.is_some(),
        gpu_skus = translation.gpu_skus.len(),
        "Pod translation configured"
    );

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let pods = Arc::new(KubePodLister::new(kube_client, &config.node_name));

    let realtime =
        Arc::new(RealtimeStatsProvider::new(clock.clone()).with_port(config.realtime_metrics_port));
    let aggregate = Arc::new(AggregateStatsProvider::new(
        arm.clone(),
        &config.resource_group,
        clock.clone(),
    ));
    let decider = Arc::new(
        MetricsDecider::new(
            aci.clone(),
            &config.resource_group,
            realtime,
            aggregate,
            clock.clone(),
        )
        .with_policy(config.non_realtime_metrics),
    );

    let summary_config = SummaryConfig {
        node_name: config.node_name.clone(),
        concurrency: config.stats_concurrency,
    };
    let summary = Arc::new(
        StatsSummaryProvider::new(summary_config, pods, decider, clock)
            .with_health(health_registry.clone()),
    );

    let shutdown = CancellationToken::new();
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        summary,
        shutdown.clone(),
    ));

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    shutdown.cancel();

    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }
    info!("Shutdown complete");

    Ok(())
}
