//! Core library of the container-instance virtual kubelet provider
//!
//! This crate provides:
//! - The container group client facade and its HTTP implementation
//! - Pod ↔ container group translation, DNS and extension handling
//! - Per-pod stats from realtime sidecars or the monitoring backend
//! - Node stats summary aggregation
//! - Health checks and observability

pub mod aci;
pub mod cache;
pub mod clock;
pub mod dns;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod retry;

pub use aci::{
    AciClient, ApiResponse, ArmClient, ArmConfig, ContainerGroupsApi, StaticTokenSource,
    TokenSource,
};
pub use error::{Error, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use metrics::{
    MetricsDecider, NonRealtimePolicy, PodLister, PodStatsGetter, StatsSummaryProvider,
    SummaryConfig,
};
pub use models::*;
pub use observability::{ProviderMetrics, StructuredLogger};
