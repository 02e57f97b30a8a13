//! Deploy: one service instance within a build.

use super::service::{Deployable, Service, ServiceSpec, ServiceType};
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployType {
    #[default]
    Github,
    Docker,
    Helm,
    Cli,
    ExternalHttp,
    Configuration,
}

impl DeployType {
    /// Types handed to the image build coordinator.
    #[must_use]
    pub const fn is_image_buildable(&self) -> bool {
        matches!(self, Self::Github | Self::Docker | Self::Helm)
    }

    #[must_use]
    pub const fn is_cli(&self) -> bool {
        matches!(self, Self::Cli)
    }

    /// Types rendered by the manifest generator; Helm releases are applied by their chart.
    #[must_use]
    pub const fn generates_manifest(&self) -> bool {
        matches!(self, Self::Github | Self::Docker)
    }
}

impl From<ServiceType> for DeployType {
    fn from(value: ServiceType) -> Self {
        match value {
            ServiceType::Github => Self::Github,
            ServiceType::Docker => Self::Docker,
            ServiceType::Helm => Self::Helm,
            ServiceType::Cli => Self::Cli,
            ServiceType::ExternalHttp => Self::ExternalHttp,
            ServiceType::Configuration => Self::Configuration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    #[default]
    Pending,
    Building,
    Built,
    BuildFailed,
    Deploying,
    Ready,
    DeployFailed,
    Error,
    TornDown,
}

impl fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Built => "built",
            Self::BuildFailed => "build_failed",
            Self::Deploying => "deploying",
            Self::Ready => "ready",
            Self::DeployFailed => "deploy_failed",
            Self::Error => "error",
            Self::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deploy {
    /// `<service>-<build uuid>`; also the Kubernetes object name
    pub uuid: String,
    pub build_uuid: String,
    pub service_name: String,
    #[serde(default)]
    pub deploy_type: DeployType,
    #[serde(default)]
    pub status: DeployStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    /// Inactive deploys keep their history but are never rendered
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub init_docker_image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub init_env: BTreeMap<String, String>,
    /// Overrides set from pull request comments; win over `env`
    #[serde(default)]
    pub comment_env: BTreeMap<String, String>,
    #[serde(default)]
    pub comment_init_env: BTreeMap<String, String>,
    #[serde(default)]
    pub replica_count: Option<i32>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub manifest: Option<String>,
    /// Legacy generation spec
    #[serde(default)]
    pub service: Option<Service>,
    /// Full-YAML generation spec
    #[serde(default)]
    pub deployable: Option<Deployable>,
}

impl Deploy {
    #[must_use]
    pub fn new(build_uuid: &str, service_name: &str) -> Self {
        Self {
            uuid: deploy_uuid(service_name, build_uuid),
            build_uuid: build_uuid.to_string(),
            service_name: service_name.to_string(),
            deploy_type: DeployType::Github,
            status: DeployStatus::Pending,
            status_message: None,
            active: true,
            docker_image: None,
            init_docker_image: None,
            env: BTreeMap::new(),
            init_env: BTreeMap::new(),
            comment_env: BTreeMap::new(),
            comment_init_env: BTreeMap::new(),
            replica_count: None,
            sha: None,
            manifest: None,
            service: None,
            deployable: None,
        }
    }

    /// Service spec for the schema generation the build uses.
    pub fn service_spec(&self, enable_full_yaml: bool) -> Result<&dyn ServiceSpec> {
        let spec: Option<&dyn ServiceSpec> = if enable_full_yaml {
            self.deployable.as_ref().map(|d| d as &dyn ServiceSpec)
        } else {
            self.service.as_ref().map(|s| s as &dyn ServiceSpec)
        };
        spec.ok_or_else(|| Error::MissingField {
            object: format!("deploy {}", self.uuid),
            field: if enable_full_yaml {
                "deployable".to_string()
            } else {
                "service".to_string()
            },
        })
    }

    /// Runtime env with comment overrides applied.
    #[must_use]
    pub fn merged_env(&self) -> BTreeMap<String, String> {
        let mut merged = self.env.clone();
        merged.extend(self.comment_env.clone());
        merged
    }

    #[must_use]
    pub fn merged_init_env(&self) -> BTreeMap<String, String> {
        let mut merged = self.init_env.clone();
        merged.extend(self.comment_init_env.clone());
        merged
    }
}

#[must_use]
pub fn deploy_uuid(service_name: &str, build_uuid: &str) -> String {
    format!("{service_name}-{build_uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_overrides_win() {
        let mut deploy = Deploy::new("b1", "web");
        deploy.env.insert("LOG_LEVEL".into(), "info".into());
        deploy.env.insert("PORT".into(), "8080".into());
        deploy.comment_env.insert("LOG_LEVEL".into(), "debug".into());

        let merged = deploy.merged_env();
        assert_eq!(merged["LOG_LEVEL"], "debug");
        assert_eq!(merged["PORT"], "8080");
    }

    #[test]
    fn service_spec_follows_schema_generation() {
        let mut deploy = Deploy::new("b1", "web");
        deploy.deployable = Some(Deployable {
            name: "web".into(),
            ..Deployable::default()
        });

        assert_eq!(deploy.service_spec(true).unwrap().name(), "web");
        let err = deploy.service_spec(false).err().unwrap();
        assert!(matches!(err, Error::MissingField { ref field, .. } if field == "service"));
    }

    #[test]
    fn buildable_types() {
        assert!(DeployType::Helm.is_image_buildable());
        assert!(!DeployType::Helm.generates_manifest());
        assert!(!DeployType::Cli.is_image_buildable());
        assert!(DeployType::Docker.generates_manifest());
    }
}
