//! HTTP client for the container instance and monitoring management APIs

use super::{ApiResponse, ContainerGroupsApi, TokenSource};
use crate::error::{Error, Result};
use crate::metrics::MetricsGetter;
use crate::models::{
    CapabilityListPage, ContainerGroup, ContainerGroupListPage, ExecRequest, ExecResponse,
    LogOptions, Logs, MetricsRequest, MetricsResult,
};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_ENDPOINT: &str = "https://management.azure.com/";
const CONTAINER_INSTANCE_API_VERSION: &str = "2021-10-01";
const MONITOR_API_VERSION: &str = "2018-01-01";

/// Management endpoint settings
#[derive(Debug, Clone)]
pub struct ArmConfig {
    pub endpoint: String,
    pub subscription_id: String,
    pub container_instance_api_version: String,
    pub monitor_api_version: String,
    pub request_timeout: Duration,
}

impl ArmConfig {
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            subscription_id: subscription_id.into(),
            container_instance_api_version: CONTAINER_INSTANCE_API_VERSION.to_string(),
            monitor_api_version: MONITOR_API_VERSION.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// Control plane and monitoring client speaking the management REST API
pub struct ArmClient {
    http: Client,
    base_url: Url,
    config: ArmConfig,
    tokens: Arc<dyn TokenSource>,
}

impl ArmClient {
    pub fn new(config: ArmConfig, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;

        let mut endpoint = config.endpoint.clone();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base_url = Url::parse(&endpoint)
            .map_err(|e| Error::configuration(format!("invalid management endpoint: {e}")))?;

        Ok(Self {
            http,
            base_url,
            config,
            tokens,
        })
    }

    fn container_group_path(&self, resource_group: &str, name: &str) -> String {
        format!(
            "subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{}",
            self.config.subscription_id, resource_group, name
        )
    }

    fn url(&self, path: &str, api_version: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| Error::configuration(format!("invalid request path {path}: {e}")))?;
        url.query_pairs_mut().append_pair("api-version", api_version);
        Ok(url)
    }

    fn aci_url(&self, path: &str) -> Result<Url> {
        self.url(path, &self.config.container_instance_api_version)
    }

    fn next_link_url(link: &str) -> Result<Url> {
        Url::parse(link).map_err(|e| Error::validation(format!("invalid next link {link}: {e}")))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<(u16, String)> {
        let token = self.tokens.token().await?;
        debug!(method = %method, path = %url.path(), "Sending management request");

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(Error::transient(
                Some(status.as_u16()),
                format!("{method} {} returned {status}: {text}", url.path()),
            ));
        }
        Ok((status.as_u16(), text))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse<T>> {
        let (status, text) = self.send(method, url, body).await?;
        let value = serde_json::from_str(&text)?;
        Ok(ApiResponse::new(status, value))
    }
}

/// ISO-8601 duration understood by the monitoring API
fn iso8601_interval(interval: chrono::Duration) -> String {
    let seconds = interval.num_seconds().max(1);
    if seconds % 3600 == 0 {
        format!("PT{}H", seconds / 3600)
    } else if seconds % 60 == 0 {
        format!("PT{}M", seconds / 60)
    } else {
        format!("PT{seconds}S")
    }
}

#[async_trait]
impl ContainerGroupsApi for ArmClient {
    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        container_group: &ContainerGroup,
    ) -> Result<ApiResponse<()>> {
        let url = self.aci_url(&self.container_group_path(resource_group, name))?;
        let body = serde_json::to_value(container_group)?;
        let (status, _) = self.send(Method::PUT, url, Some(body)).await?;
        Ok(ApiResponse::new(status, ()))
    }

    async fn get(&self, resource_group: &str, name: &str) -> Result<ApiResponse<ContainerGroup>> {
        let url = self.aci_url(&self.container_group_path(resource_group, name))?;
        self.send_json(Method::GET, url, None).await
    }

    async fn list_page(
        &self,
        resource_group: &str,
        next_link: Option<&str>,
    ) -> Result<ApiResponse<ContainerGroupListPage>> {
        let url = match next_link {
            Some(link) => Self::next_link_url(link)?,
            None => self.aci_url(&format!(
                "subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups",
                self.config.subscription_id, resource_group
            ))?,
        };
        self.send_json(Method::GET, url, None).await
    }

    async fn delete(&self, resource_group: &str, name: &str) -> Result<ApiResponse<()>> {
        let url = self.aci_url(&self.container_group_path(resource_group, name))?;
        let (status, _) = self.send(Method::DELETE, url, None).await?;
        Ok(ApiResponse::new(status, ()))
    }

    async fn execute_command(
        &self,
        resource_group: &str,
        container_group: &str,
        container: &str,
        request: &ExecRequest,
    ) -> Result<ApiResponse<ExecResponse>> {
        let url = self.aci_url(&format!(
            "{}/containers/{}/exec",
            self.container_group_path(resource_group, container_group),
            container
        ))?;
        let body = serde_json::to_value(request)?;
        self.send_json(Method::POST, url, Some(body)).await
    }

    async fn list_logs(
        &self,
        resource_group: &str,
        container_group: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<ApiResponse<String>> {
        let mut url = self.aci_url(&format!(
            "{}/containers/{}/logs",
            self.container_group_path(resource_group, container_group),
            container
        ))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(tail) = options.tail {
                query.append_pair("tail", &tail.to_string());
            }
            if options.timestamps {
                query.append_pair("timestamps", "true");
            }
        }

        let response: ApiResponse<Logs> = self.send_json(Method::GET, url, None).await?;
        Ok(ApiResponse::new(response.status, response.value.content))
    }

    async fn list_capabilities_page(
        &self,
        region: &str,
        next_link: Option<&str>,
    ) -> Result<ApiResponse<CapabilityListPage>> {
        let url = match next_link {
            Some(link) => Self::next_link_url(link)?,
            None => self.aci_url(&format!(
                "subscriptions/{}/providers/Microsoft.ContainerInstance/locations/{}/capabilities",
                self.config.subscription_id, region
            ))?,
        };
        self.send_json(Method::GET, url, None).await
    }
}

#[async_trait]
impl MetricsGetter for ArmClient {
    async fn get_container_group_metrics(
        &self,
        resource_group: &str,
        container_group: &str,
        request: &MetricsRequest,
    ) -> Result<MetricsResult> {
        let path = format!(
            "{}/providers/Microsoft.Insights/metrics",
            self.container_group_path(resource_group, container_group)
        );
        let mut url = self.url(&path, &self.config.monitor_api_version)?;
        {
            let timespan = format!(
                "{}/{}",
                request.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                request.end.to_rfc3339_opts(SecondsFormat::Secs, true)
            );
            let names: Vec<&str> = request.types.iter().map(|t| t.as_str()).collect();
            let aggregations: Vec<&str> = request.aggregations.iter().map(|a| a.as_str()).collect();

            let mut query = url.query_pairs_mut();
            query.append_pair("timespan", &timespan);
            query.append_pair("interval", &iso8601_interval(request.interval));
            query.append_pair("metricnames", &names.join(","));
            query.append_pair("aggregation", &aggregations.join(","));
            if let Some(filter) = &request.dimension {
                query.append_pair("$filter", filter);
            }
        }

        let response: ApiResponse<MetricsResult> = self.send_json(Method::GET, url, None).await?;
        Ok(response.value)
    }
}
