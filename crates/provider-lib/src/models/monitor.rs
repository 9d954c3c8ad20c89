//! Monitoring backend query and response model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Metric names understood by the monitoring backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    CpuUsage,
    MemoryUsage,
    NetworkBytesReceivedPerSecond,
    NetworkBytesTransmittedPerSecond,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::CpuUsage => "CpuUsage",
            MetricType::MemoryUsage => "MemoryUsage",
            MetricType::NetworkBytesReceivedPerSecond => "NetworkBytesReceivedPerSecond",
            MetricType::NetworkBytesTransmittedPerSecond => "NetworkBytesTransmittedPerSecond",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "CpuUsage" => Some(MetricType::CpuUsage),
            "MemoryUsage" => Some(MetricType::MemoryUsage),
            "NetworkBytesReceivedPerSecond" => Some(MetricType::NetworkBytesReceivedPerSecond),
            "NetworkBytesTransmittedPerSecond" => {
                Some(MetricType::NetworkBytesTransmittedPerSecond)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationType {
    Average,
    Total,
    Maximum,
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::Average => "average",
            AggregationType::Total => "total",
            AggregationType::Maximum => "maximum",
        }
    }
}

/// Range query against the monitoring backend
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: Duration,
    pub types: Vec<MetricType>,
    pub aggregations: Vec<AggregationType>,
    /// Dimension filter, e.g. `containerName eq '*'`
    pub dimension: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsResult {
    #[serde(default)]
    pub value: Vec<Metric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: LocalizableString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub timeseries: Vec<TimeSeries>,
}

impl Metric {
    pub fn metric_type(&self) -> Option<MetricType> {
        MetricType::parse(&self.name.value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalizableString {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localized_value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    #[serde(default)]
    pub metadatavalues: Vec<MetadataValue>,
    #[serde(default)]
    pub data: Vec<MetricValue>,
}

impl TimeSeries {
    /// Value of the metadata dimension with exactly this name
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.metadatavalues
            .iter()
            .find(|m| m.name.value == name)
            .map(|m| m.value.as_str())
    }

    /// Most recent data point carrying an average
    pub fn latest(&self) -> Option<&MetricValue> {
        self.data
            .iter()
            .filter(|v| v.average.is_some())
            .max_by_key(|v| v.time_stamp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataValue {
    pub name: LocalizableString,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    pub time_stamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
}
