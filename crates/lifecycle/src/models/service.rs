//! Per-service declarative specs.
//!
//! Two schema generations coexist. The legacy [`Service`] row stores several
//! fields as hand-authored text (comma-separated ports, JSON affinity); the
//! newer [`Deployable`] (full-YAML mode) is fully typed. Both implement
//! [`ServiceSpec`], which is all the manifest generator reads.

use super::CapacityType;
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage medium backing a service disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskMedium {
    #[default]
    Ebs,
    Disk,
    Memory,
}

impl DiskMedium {
    /// Disks that need a `PersistentVolumeClaim` (single-attach).
    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        matches!(self, Self::Ebs | Self::Disk)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDisk {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub medium: DiskMedium,
    #[serde(default = "default_storage_size")]
    pub storage_size: String,
    #[serde(default)]
    pub access_mode: Option<String>,
}

fn default_storage_size() -> String {
    "1Gi".to_string()
}

/// Readiness probe configuration; liveness is derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    #[serde(default)]
    pub tcp_socket_port: Option<i32>,
    #[serde(default)]
    pub http_get_path: Option<String>,
    #[serde(default)]
    pub http_get_port: Option<i32>,
    #[serde(default)]
    pub initial_delay_seconds: Option<i32>,
    #[serde(default)]
    pub period_seconds: Option<i32>,
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub success_threshold: Option<i32>,
    #[serde(default)]
    pub failure_threshold: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu: ResourceQuantity,
    #[serde(default)]
    pub memory: ResourceQuantity,
}

/// Accessor surface shared by both schema generations.
pub trait ServiceSpec: Send + Sync {
    fn name(&self) -> &str;
    fn ports(&self) -> Result<Vec<i32>>;
    fn grpc(&self) -> bool;
    fn grpc_host(&self) -> Option<&str>;
    fn cname(&self) -> Option<&str>;
    fn resources(&self) -> ResourceSpec;
    fn readiness(&self) -> ProbeConfig;
    fn command(&self) -> Result<Option<Vec<String>>>;
    fn args(&self) -> Result<Option<Vec<String>>>;
    fn init_command(&self) -> Result<Option<Vec<String>>>;
    fn init_args(&self) -> Result<Option<Vec<String>>>;
    fn disks(&self) -> &[ServiceDisk];
    /// Full affinity object replacing the computed node affinity.
    fn affinity_override(&self) -> Result<Option<serde_json::Value>>;
    fn node_selector(&self) -> Result<BTreeMap<String, String>>;
    fn capacity_type(&self) -> Option<CapacityType>;
}

/// Service type as written in `lifecycle.yaml`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ServiceType {
    #[default]
    Github,
    Docker,
    Helm,
    Cli,
    ExternalHttp,
    Configuration,
}

/// Full-YAML generation service spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployable {
    pub name: String,
    #[serde(default, rename = "type")]
    pub service_type: ServiceType,
    /// Prebuilt image for `docker` services
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub init_image: Option<String>,
    #[serde(default)]
    pub ports: Vec<i32>,
    #[serde(default)]
    pub grpc: bool,
    #[serde(default)]
    pub grpc_host: Option<String>,
    #[serde(default)]
    pub cname: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub init_env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub readiness: ProbeConfig,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub init_command: Option<Vec<String>>,
    #[serde(default)]
    pub init_args: Option<Vec<String>>,
    #[serde(default)]
    pub disks: Vec<ServiceDisk>,
    #[serde(default)]
    pub node_affinity: Option<serde_json::Value>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub capacity_type: Option<CapacityType>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub replica_count: Option<i32>,
}

impl ServiceSpec for Deployable {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Result<Vec<i32>> {
        Ok(self.ports.clone())
    }

    fn grpc(&self) -> bool {
        self.grpc
    }

    fn grpc_host(&self) -> Option<&str> {
        self.grpc_host.as_deref()
    }

    fn cname(&self) -> Option<&str> {
        self.cname.as_deref()
    }

    fn resources(&self) -> ResourceSpec {
        self.resources.clone()
    }

    fn readiness(&self) -> ProbeConfig {
        self.readiness.clone()
    }

    fn command(&self) -> Result<Option<Vec<String>>> {
        Ok(self.command.clone())
    }

    fn args(&self) -> Result<Option<Vec<String>>> {
        Ok(self.args.clone())
    }

    fn init_command(&self) -> Result<Option<Vec<String>>> {
        Ok(self.init_command.clone())
    }

    fn init_args(&self) -> Result<Option<Vec<String>>> {
        Ok(self.init_args.clone())
    }

    fn disks(&self) -> &[ServiceDisk] {
        &self.disks
    }

    fn affinity_override(&self) -> Result<Option<serde_json::Value>> {
        Ok(self.node_affinity.clone())
    }

    fn node_selector(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.node_selector.clone())
    }

    fn capacity_type(&self) -> Option<CapacityType> {
        self.capacity_type
    }
}

/// Legacy generation service row.
///
/// Text columns are parsed on access; malformed values surface as
/// [`Error::MalformedField`] rather than being guessed at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    /// Comma-separated port list, e.g. `"8080,9090"`
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub grpc: bool,
    #[serde(default)]
    pub grpc_host: Option<String>,
    #[serde(default)]
    pub cname: Option<String>,
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub readiness_tcp_socket_port: Option<i32>,
    #[serde(default)]
    pub readiness_http_get_path: Option<String>,
    #[serde(default)]
    pub readiness_http_get_port: Option<i32>,
    #[serde(default)]
    pub readiness_initial_delay_seconds: Option<i32>,
    #[serde(default)]
    pub readiness_period_seconds: Option<i32>,
    #[serde(default)]
    pub readiness_timeout_seconds: Option<i32>,
    #[serde(default)]
    pub readiness_success_threshold: Option<i32>,
    #[serde(default)]
    pub readiness_failure_threshold: Option<i32>,
    /// JSON array text
    #[serde(default)]
    pub command: Option<String>,
    /// JSON array text
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub init_command: Option<String>,
    #[serde(default)]
    pub init_arguments: Option<String>,
    #[serde(default)]
    pub service_disks: Vec<ServiceDisk>,
    /// JSON object text
    #[serde(default)]
    pub node_affinity: Option<String>,
    /// JSON object text
    #[serde(default)]
    pub node_selector: Option<String>,
    #[serde(default)]
    pub capacity_type: Option<CapacityType>,
}

impl Service {
    /// Materialize the legacy row a full-YAML service would be stored as.
    pub fn from_deployable(deployable: &Deployable) -> Result<Self> {
        let to_text = |value: &Option<Vec<String>>| -> Result<Option<String>> {
            value
                .as_ref()
                .map(|v| serde_json::to_string(v).map_err(Error::from))
                .transpose()
        };

        let ports = deployable
            .ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let node_affinity = deployable
            .node_affinity
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let node_selector = if deployable.node_selector.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&deployable.node_selector)?)
        };

        let readiness = &deployable.readiness;
        Ok(Self {
            name: deployable.name.clone(),
            port: (!ports.is_empty()).then_some(ports),
            grpc: deployable.grpc,
            grpc_host: deployable.grpc_host.clone(),
            cname: deployable.cname.clone(),
            cpu_request: deployable.resources.cpu.request.clone(),
            cpu_limit: deployable.resources.cpu.limit.clone(),
            memory_request: deployable.resources.memory.request.clone(),
            memory_limit: deployable.resources.memory.limit.clone(),
            readiness_tcp_socket_port: readiness.tcp_socket_port,
            readiness_http_get_path: readiness.http_get_path.clone(),
            readiness_http_get_port: readiness.http_get_port,
            readiness_initial_delay_seconds: readiness.initial_delay_seconds,
            readiness_period_seconds: readiness.period_seconds,
            readiness_timeout_seconds: readiness.timeout_seconds,
            readiness_success_threshold: readiness.success_threshold,
            readiness_failure_threshold: readiness.failure_threshold,
            command: to_text(&deployable.command)?,
            arguments: to_text(&deployable.args)?,
            init_command: to_text(&deployable.init_command)?,
            init_arguments: to_text(&deployable.init_args)?,
            service_disks: deployable.disks.clone(),
            node_affinity,
            node_selector,
            capacity_type: deployable.capacity_type,
        })
    }
}

fn parse_json_list(field: &str, raw: Option<&str>) -> Result<Option<Vec<String>>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(|e| Error::malformed(field, e)),
        None => Ok(None),
    }
}

impl ServiceSpec for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Result<Vec<i32>> {
        let Some(raw) = self.port.as_deref() else {
            return Ok(vec![]);
        };
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<i32>().map_err(|e| Error::malformed("port", e)))
            .collect()
    }

    fn grpc(&self) -> bool {
        self.grpc
    }

    fn grpc_host(&self) -> Option<&str> {
        self.grpc_host.as_deref()
    }

    fn cname(&self) -> Option<&str> {
        self.cname.as_deref()
    }

    fn resources(&self) -> ResourceSpec {
        ResourceSpec {
            cpu: ResourceQuantity {
                request: self.cpu_request.clone(),
                limit: self.cpu_limit.clone(),
            },
            memory: ResourceQuantity {
                request: self.memory_request.clone(),
                limit: self.memory_limit.clone(),
            },
        }
    }

    fn readiness(&self) -> ProbeConfig {
        ProbeConfig {
            tcp_socket_port: self.readiness_tcp_socket_port,
            http_get_path: self.readiness_http_get_path.clone(),
            http_get_port: self.readiness_http_get_port,
            initial_delay_seconds: self.readiness_initial_delay_seconds,
            period_seconds: self.readiness_period_seconds,
            timeout_seconds: self.readiness_timeout_seconds,
            success_threshold: self.readiness_success_threshold,
            failure_threshold: self.readiness_failure_threshold,
        }
    }

    fn command(&self) -> Result<Option<Vec<String>>> {
        parse_json_list("command", self.command.as_deref())
    }

    fn args(&self) -> Result<Option<Vec<String>>> {
        parse_json_list("arguments", self.arguments.as_deref())
    }

    fn init_command(&self) -> Result<Option<Vec<String>>> {
        parse_json_list("initCommand", self.init_command.as_deref())
    }

    fn init_args(&self) -> Result<Option<Vec<String>>> {
        parse_json_list("initArguments", self.init_arguments.as_deref())
    }

    fn disks(&self) -> &[ServiceDisk] {
        &self.service_disks
    }

    fn affinity_override(&self) -> Result<Option<serde_json::Value>> {
        match self.node_affinity.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => serde_json::from_str(text)
                .map(Some)
                .map_err(|e| Error::malformed("nodeAffinity", e)),
            _ => Ok(None),
        }
    }

    fn node_selector(&self) -> Result<BTreeMap<String, String>> {
        match self.node_selector.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => {
                serde_json::from_str(text).map_err(|e| Error::malformed("nodeSelector", e))
            }
            _ => Ok(BTreeMap::new()),
        }
    }

    fn capacity_type(&self) -> Option<CapacityType> {
        self.capacity_type
    }
}
