//! Service metadata and liveness announcements.
//!
//! A service announces its description once on `$LL.register.<name>` and
//! then proves it is alive on `$LL.heartbeat.<name>` at a fixed interval.

use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Subject prefix for metadata announcements.
pub const REGISTER_PREFIX: &str = "$LL.register";

/// Subject prefix for heartbeats.
pub const HEARTBEAT_PREFIX: &str = "$LL.heartbeat";

/// Interval between heartbeats unless the service overrides it.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Version reported before any metadata is registered.
pub(crate) const UNKNOWN_VERSION: &str = "unknown";

pub fn register_subject(service: &str) -> String {
    format!("{REGISTER_PREFIX}.{service}")
}

pub fn heartbeat_subject(service: &str) -> String {
    format!("{HEARTBEAT_PREFIX}.{service}")
}

/// Describes a service and the methods it serves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodMetadata>,
    #[serde(default)]
    pub registered_at: Timestamp,
    #[serde(default)]
    pub last_seen: Timestamp,
}

/// Describes one method.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParameterMetadata>,
    #[serde(default)]
    pub returns: Vec<ReturnMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<ExampleMetadata>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterMetadata {
    pub name: String,
    /// One of `string`, `number`, `boolean`, `array`, `object`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReturnMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExampleMetadata {
    pub input: Value,
    pub output: Value,
    #[serde(default)]
    pub description: String,
}

/// Body published on `$LL.register.<name>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub service: String,
    pub version: String,
    pub metadata: ServiceMetadata,
    pub timestamp: Timestamp,
}

/// Body published on `$LL.heartbeat.<name>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub service: String,
    pub version: String,
    pub timestamp: Timestamp,
}
