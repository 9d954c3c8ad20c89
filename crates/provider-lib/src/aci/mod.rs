//! Container-instance control plane integration
//!
//! This module provides:
//! - Resource naming and payload validation
//! - The `AciClient` facade over the raw control plane calls
//! - An HTTP implementation of the control plane and monitoring APIs
//! - Extension descriptors attached to container groups
//! - Pod ↔ container group translation

mod arm;
mod client;
pub mod extensions;
mod translate;
pub(crate) mod validation;

pub use arm::{ArmClient, ArmConfig};
pub use client::{gpu_skus, AciClient};
pub use translate::{
    container_group_from_pod, pod_phase_from_state, pod_status_from_container_group,
    TranslationConfig,
};
pub use validation::{container_group_name, validate_container, validate_container_group};

use crate::error::Result;
use crate::models::{
    CapabilityListPage, ContainerGroup, ContainerGroupListPage, ExecRequest, ExecResponse,
    LogOptions,
};
use async_trait::async_trait;

/// Remote response together with the HTTP status it came back with
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub value: T,
}

impl<T> ApiResponse<T> {
    pub fn new(status: u16, value: T) -> Self {
        Self { status, value }
    }
}

/// Raw container group control plane calls, one method per remote operation
#[async_trait]
pub trait ContainerGroupsApi: Send + Sync {
    /// Start a create-or-update; the remote operation continues asynchronously
    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        container_group: &ContainerGroup,
    ) -> Result<ApiResponse<()>>;

    async fn get(&self, resource_group: &str, name: &str) -> Result<ApiResponse<ContainerGroup>>;

    /// Fetch one listing page; `next_link` is `None` for the first page
    async fn list_page(
        &self,
        resource_group: &str,
        next_link: Option<&str>,
    ) -> Result<ApiResponse<ContainerGroupListPage>>;

    async fn delete(&self, resource_group: &str, name: &str) -> Result<ApiResponse<()>>;

    async fn execute_command(
        &self,
        resource_group: &str,
        container_group: &str,
        container: &str,
        request: &ExecRequest,
    ) -> Result<ApiResponse<ExecResponse>>;

    async fn list_logs(
        &self,
        resource_group: &str,
        container_group: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<ApiResponse<String>>;

    async fn list_capabilities_page(
        &self,
        region: &str,
        next_link: Option<&str>,
    ) -> Result<ApiResponse<CapabilityListPage>>;
}

/// Source of bearer tokens for the control plane
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// Token provided up front, e.g. from the environment
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
