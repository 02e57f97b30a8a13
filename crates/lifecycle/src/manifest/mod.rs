//! Manifest generation.
//!
//! A pure function of a build, its deploys and the global configuration. Each
//! active, manifest-generating deploy yields, in order: a Deployment, its
//! NodePort Service, one PersistentVolumeClaim per persistent disk, a gRPC
//! Mapping when gRPC is enabled, and an ExternalName Service when a CNAME is
//! set. The only time-dependent output is the rollout annotation, taken from
//! the supplied clock.

pub mod affinity;
pub mod companions;
pub mod container;
pub mod secrets;
pub mod volumes;

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::Serialize;
use tracing::debug;

use crate::config::LifecycleConfig;
use crate::models::{Build, Deploy, ServiceSpec};
use crate::types::{Error, Result};

use container::{build_env, readiness_probe, resource_requirements, ContainerParts, DatadogTags};

pub const DEPLOYED_AT_ANNOTATION: &str = "lifecycle/deployed-at";
const DOCUMENT_SEPARATOR: &str = "---\n";

pub struct ManifestInput<'a> {
    pub build: &'a Build,
    pub deploys: &'a [Deploy],
    pub namespace: &'a str,
    pub service_account: &'a str,
    pub config: &'a LifecycleConfig,
    pub now: DateTime<Utc>,
}

/// Documents generated for one deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployManifest {
    pub deploy_uuid: String,
    pub documents: Vec<String>,
}

impl DeployManifest {
    #[must_use]
    pub fn to_yaml(&self) -> String {
        join_documents(self.documents.iter().map(String::as_str))
    }
}

/// `---`-separated bundle.
pub fn join_documents<'a>(documents: impl IntoIterator<Item = &'a str>) -> String {
    let mut bundle = String::new();
    for doc in documents {
        bundle.push_str(DOCUMENT_SEPARATOR);
        bundle.push_str(doc);
        if !doc.ends_with('\n') {
            bundle.push('\n');
        }
    }
    bundle
}

fn to_document<T: Serialize>(object: &T) -> Result<String> {
    Ok(serde_yaml::to_string(object)?)
}

/// Labels shared by every object of a deploy; `deploy_uuid` doubles as the
/// pod selector.
#[must_use]
pub fn deploy_labels(build: &Build, deploy: &Deploy) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("name".to_string(), deploy.uuid.clone()),
        ("lc_uuid".to_string(), build.uuid.clone()),
        ("deploy_uuid".to_string(), deploy.uuid.clone()),
        (
            "app.kubernetes.io/name".to_string(),
            deploy.service_name.clone(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "lifecycle".to_string(),
        ),
    ])
}

fn selector(deploy: &Deploy) -> BTreeMap<String, String> {
    BTreeMap::from([("deploy_uuid".to_string(), deploy.uuid.clone())])
}

/// Manifests for every active deploy that renders to Kubernetes objects.
pub fn generate_manifests(input: &ManifestInput<'_>) -> Result<Vec<DeployManifest>> {
    input
        .deploys
        .iter()
        .filter(|deploy| deploy.active && deploy.deploy_type.generates_manifest())
        .map(|deploy| generate_deploy_manifest(input, deploy))
        .collect()
}

/// The full bundle for a build.
pub fn generate_manifest(input: &ManifestInput<'_>) -> Result<String> {
    let manifests = generate_manifests(input)?;
    Ok(join_documents(
        manifests
            .iter()
            .flat_map(|m| m.documents.iter().map(String::as_str)),
    ))
}

fn generate_deploy_manifest(input: &ManifestInput<'_>, deploy: &Deploy) -> Result<DeployManifest> {
    let build = input.build;
    let spec = deploy.service_spec(build.enable_full_yaml)?;
    let labels = deploy_labels(build, deploy);
    let ports = spec.ports()?;

    let wiring = volumes::wire_disks(&deploy.uuid, input.namespace, spec.disks(), &labels);
    let deployment = deployment(input, deploy, spec, &ports, &labels, &wiring)?;

    let mut documents = vec![to_document(&deployment)?];

    if !ports.is_empty() {
        let service = companions::node_port_service(
            &deploy.uuid,
            input.namespace,
            &ports,
            &labels,
            &selector(deploy),
        );
        documents.push(to_document(&service)?);
    }

    for claim in &wiring.claims {
        documents.push(to_document(claim)?);
    }

    if spec.grpc() {
        let port = *ports.first().ok_or_else(|| Error::MissingField {
            object: format!("deploy {}", deploy.uuid),
            field: "ports".to_string(),
        })?;
        let hostname = spec.grpc_host().map_or_else(
            || format!("{}.{}", deploy.uuid, input.config.domains.grpc),
            ToString::to_string,
        );
        let mapping =
            companions::grpc_mapping(&deploy.uuid, input.namespace, &hostname, port, &labels);
        documents.push(to_document(&mapping)?);
    }

    if let Some(cname) = spec.cname() {
        let alias =
            companions::external_name_service(spec.name(), input.namespace, cname, &labels);
        documents.push(to_document(&alias)?);
    }

    debug!(
        deploy_uuid = %deploy.uuid,
        documents = documents.len(),
        "Generated deploy manifest"
    );

    Ok(DeployManifest {
        deploy_uuid: deploy.uuid.clone(),
        documents,
    })
}

fn deployment(
    input: &ManifestInput<'_>,
    deploy: &Deploy,
    spec: &dyn ServiceSpec,
    ports: &[i32],
    labels: &BTreeMap<String, String>,
    wiring: &volumes::DiskWiring,
) -> Result<Deployment> {
    let build = input.build;
    let config = input.config;

    let image = deploy.docker_image.clone().ok_or_else(|| Error::MissingField {
        object: format!("deploy {}", deploy.uuid),
        field: "dockerImage".to_string(),
    })?;

    let version = deploy
        .sha
        .as_deref()
        .or(build.sha.as_deref())
        .unwrap_or("latest");
    let tags = DatadogTags {
        env: &config.datadog.env,
        service: spec.name(),
        version,
        build_uuid: &build.uuid,
    };

    let owner = format!("deploy {}", deploy.uuid);
    let main = ContainerParts {
        name: spec.name().to_string(),
        image,
        command: spec.command()?,
        args: spec.args()?,
        env: build_env(&deploy.merged_env(), spec.name(), &tags),
        ports: ports.to_vec(),
        resources: Some(resource_requirements(&spec.resources(), &config.resources)),
        readiness: readiness_probe(&spec.readiness(), ports, &owner)?,
        volume_mounts: wiring.mounts.clone(),
    }
    .into_container();

    let init_containers = match deploy.init_docker_image.clone() {
        Some(init_image) => Some(vec![ContainerParts {
            name: format!("{}-init", spec.name()),
            image: init_image,
            command: spec.init_command()?,
            args: spec.init_args()?,
            env: build_env(&deploy.merged_init_env(), spec.name(), &tags),
            volume_mounts: wiring.mounts.clone(),
            ..ContainerParts::default()
        }
        .into_container()]),
        None => None,
    };

    let capacity = spec.capacity_type().unwrap_or(build.capacity_type);
    let affinity = affinity::node_affinity(
        spec.affinity_override()?,
        capacity,
        build.is_static,
        &config.node_pools,
    )?;
    let node_selector = spec.node_selector()?;

    let strategy = if wiring.requires_recreate() {
        "Recreate"
    } else {
        "RollingUpdate"
    };

    let annotations = BTreeMap::from([(
        DEPLOYED_AT_ANNOTATION.to_string(),
        input.now.to_rfc3339_opts(SecondsFormat::Secs, true),
    )]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(deploy.uuid.clone()),
            namespace: Some(input.namespace.to_string()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(deploy.replica_count.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(selector(deploy)),
                ..LabelSelector::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some(strategy.to_string()),
                ..DeploymentStrategy::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    annotations: Some(annotations),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(input.service_account.to_string()),
                    containers: vec![main],
                    init_containers,
                    affinity: Some(affinity),
                    node_selector: (!node_selector.is_empty()).then_some(node_selector),
                    volumes: (!wiring.volumes.is_empty()).then(|| wiring.volumes.clone()),
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    })
}
