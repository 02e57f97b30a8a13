//! `lifecycle.yaml` import and deploy-set resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Build, Deploy, DeployStatus, DeployType, Deployable, Service, ServiceType};
use crate::types::{Error, Result};

static SERVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid service name regex")
});

/// Deploy names are `<service>-<build uuid>`; leave room for the build part.
const MAX_SERVICE_NAME_LEN: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub default_services: Vec<ServiceRef>,
    #[serde(default)]
    pub optional_services: Vec<ServiceRef>,
    /// Overrides the build's TTL flag
    #[serde(default)]
    pub ttl: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleYaml {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub services: Vec<Deployable>,
}

impl LifecycleYaml {
    /// Parse and validate; every failure is a [`Error::ConfigParseError`].
    pub fn parse(text: &str) -> Result<Self> {
        let yaml: Self =
            serde_yaml::from_str(text).map_err(|e| Error::ConfigParseError(e.to_string()))?;
        yaml.validate()?;
        Ok(yaml)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::ConfigParseError(msg));

        let mut names = BTreeSet::new();
        for service in &self.services {
            if !SERVICE_NAME.is_match(&service.name) || service.name.len() > MAX_SERVICE_NAME_LEN {
                return invalid(format!(
                    "service name '{}' must be a lowercase DNS label of at most {MAX_SERVICE_NAME_LEN} characters",
                    service.name
                ));
            }
            if !names.insert(service.name.as_str()) {
                return invalid(format!("duplicate service '{}'", service.name));
            }
        }

        for reference in self
            .environment
            .default_services
            .iter()
            .chain(&self.environment.optional_services)
        {
            if !names.contains(reference.name.as_str()) {
                return invalid(format!(
                    "environment references unknown service '{}'",
                    reference.name
                ));
            }
        }

        for service in &self.services {
            for dependency in &service.depends_on {
                if !names.contains(dependency.as_str()) {
                    return invalid(format!(
                        "service '{}' depends on unknown service '{dependency}'",
                        service.name
                    ));
                }
            }
            if let Some(disk) = service.disks.iter().find(|d| d.mount_path.trim().is_empty()) {
                return invalid(format!(
                    "disk '{}' of service '{}' has no mountPath",
                    disk.name, service.name
                ));
            }
            if service.service_type == ServiceType::Docker && service.image.is_none() {
                return invalid(format!("docker service '{}' requires an image", service.name));
            }
        }

        Ok(())
    }

    fn is_default(&self, name: &str) -> bool {
        self.environment.default_services.is_empty()
            || self
                .environment
                .default_services
                .iter()
                .any(|s| s.name == name)
    }
}

/// Supplies the raw `lifecycle.yaml` of a build.
#[async_trait]
pub trait DeclarativeConfigSource: Send + Sync {
    async fn fetch_yaml(&self, build: &Build) -> Result<String>;
}

/// Configs registered in-process, keyed by build uuid.
#[derive(Default)]
pub struct InlineConfigSource {
    configs: DashMap<String, String>,
}

impl InlineConfigSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, build_uuid: &str, yaml: impl Into<String>) {
        self.configs.insert(build_uuid.to_string(), yaml.into());
    }
}

#[async_trait]
impl DeclarativeConfigSource for InlineConfigSource {
    async fn fetch_yaml(&self, build: &Build) -> Result<String> {
        self.configs
            .get(&build.uuid)
            .map(|yaml| yaml.value().clone())
            .ok_or_else(|| {
                Error::ConfigParseError(format!("no lifecycle.yaml found for build {}", build.uuid))
            })
    }
}

/// Re-derive the deploy set of `build` from `yaml`.
///
/// Deploys keep their identity (`<service>-<build uuid>`), comment overrides
/// and, for optional services, their `active` flag. Deploys of services that
/// disappeared are kept inactive for history.
pub fn resolve_deploys(
    build: &Build,
    yaml: &LifecycleYaml,
    existing: &[Deploy],
    registry: &str,
) -> Result<Vec<Deploy>> {
    let previous: BTreeMap<&str, &Deploy> =
        existing.iter().map(|d| (d.uuid.as_str(), d)).collect();
    let mut resolved = Vec::with_capacity(yaml.services.len());
    let mut seen = BTreeSet::new();

    for service in &yaml.services {
        let mut deploy = Deploy::new(&build.uuid, &service.name);
        let prior = previous.get(deploy.uuid.as_str()).copied();

        deploy.deploy_type = DeployType::from(service.service_type);
        deploy.active = if yaml.is_default(&service.name) {
            true
        } else {
            prior.is_some_and(|d| d.active)
        };
        deploy.docker_image = match service.service_type {
            ServiceType::Github => Some(format!(
                "{registry}/{}:{}",
                service.name,
                build.sha.as_deref().unwrap_or(&build.uuid)
            )),
            _ => service.image.clone(),
        };
        deploy.init_docker_image = service.init_image.clone();
        deploy.env = service.env.clone();
        deploy.init_env = service.init_env.clone();
        deploy.replica_count = service.replica_count;
        deploy.sha = build.sha.clone();
        deploy.status = DeployStatus::Pending;
        if let Some(prior) = prior {
            deploy.comment_env = prior.comment_env.clone();
            deploy.comment_init_env = prior.comment_init_env.clone();
        }
        if !build.enable_full_yaml {
            deploy.service = Some(Service::from_deployable(service)?);
        }
        deploy.deployable = Some(service.clone());

        seen.insert(deploy.uuid.clone());
        resolved.push(deploy);
    }

    for stale in existing.iter().filter(|d| !seen.contains(&d.uuid)) {
        debug!(deploy_uuid = %stale.uuid, "Service removed from config, deactivating deploy");
        resolved.push(Deploy {
            active: false,
            ..stale.clone()
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
version: "1.0.0"
environment:
  defaultServices:
    - name: web
    - name: worker
  optionalServices:
    - name: admin
services:
  - name: web
    type: github
    ports: [8080]
    env:
      API_URL: "{{worker_internalHostname}}"
    dependsOn: [worker]
  - name: worker
    type: docker
    image: "redis:7"
    capacityType: SPOT
    disks:
      - name: cache
        mountPath: /data
        medium: EBS
  - name: admin
    type: docker
    image: "admin:latest"
"#;

    #[test]
    fn parses_full_yaml() {
        let yaml = LifecycleYaml::parse(YAML).unwrap();
        assert_eq!(yaml.services.len(), 3);
        assert_eq!(yaml.services[1].service_type, ServiceType::Docker);
        assert_eq!(yaml.services[0].depends_on, vec!["worker"]);
    }

    #[test]
    fn unknown_dependency_is_config_error() {
        let text = YAML.replace("dependsOn: [worker]", "dependsOn: [cache]");
        let err = LifecycleYaml::parse(&text).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("unknown service 'cache'"));
    }

    #[test]
    fn invalid_capacity_type_is_config_error() {
        let text = YAML.replace("capacityType: SPOT", "capacityType: CHEAP");
        assert!(LifecycleYaml::parse(&text).unwrap_err().is_config_error());
    }

    #[test]
    fn duplicate_services_rejected() {
        let text = YAML.replace("name: admin\n    type", "name: web\n    type");
        let err = LifecycleYaml::parse(&text).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn resolution_preserves_optional_state_and_history() {
        let mut build = Build::new("b1");
        build.sha = Some("abc123".into());
        let yaml = LifecycleYaml::parse(YAML).unwrap();

        let mut admin = Deploy::new("b1", "admin");
        admin.active = true;
        admin.comment_env.insert("DEBUG".into(), "1".into());
        let removed = Deploy::new("b1", "legacy");

        let deploys = resolve_deploys(&build, &yaml, &[admin, removed], "registry.local").unwrap();
        let by_name: BTreeMap<_, _> = deploys.iter().map(|d| (d.service_name.as_str(), d)).collect();

        assert!(by_name["web"].active);
        assert_eq!(
            by_name["web"].docker_image.as_deref(),
            Some("registry.local/web:abc123")
        );
        assert_eq!(by_name["worker"].docker_image.as_deref(), Some("redis:7"));
        assert!(by_name["admin"].active);
        assert_eq!(by_name["admin"].comment_env["DEBUG"], "1");
        assert!(!by_name["legacy"].active);
        assert_eq!(deploys.len(), 4);
    }

    #[test]
    fn new_optional_service_starts_inactive() {
        let build = Build::new("b1");
        let yaml = LifecycleYaml::parse(YAML).unwrap();
        let deploys = resolve_deploys(&build, &yaml, &[], "r").unwrap();
        let admin = deploys.iter().find(|d| d.service_name == "admin").unwrap();
        assert!(!admin.active);
    }

    #[test]
    fn legacy_builds_get_service_rows() {
        let mut build = Build::new("b1");
        build.enable_full_yaml = false;
        let yaml = LifecycleYaml::parse(YAML).unwrap();
        let deploys = resolve_deploys(&build, &yaml, &[], "r").unwrap();
        assert!(deploys.iter().all(|d| d.service.is_some()));
        assert_eq!(deploys[0].service.as_ref().unwrap().port.as_deref(), Some("8080"));
    }
}
