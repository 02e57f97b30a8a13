//! Container synthesis: env, probes, resources.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, Probe,
    ResourceRequirements, SecretKeySelector, TCPSocketAction, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::secrets::{generate_secret_name, parse_secret_refs_from_env, SecretRef};
use crate::config::DefaultResources;
use crate::models::{ProbeConfig, ResourceSpec};
use crate::types::{Error, Result};

/// Liveness starts this long after the pod, whatever readiness says.
pub const LIVENESS_INITIAL_DELAY_SECONDS: i32 = 600;

/// Env values the generator sets only when the service did not.
#[derive(Debug, Clone)]
pub struct DatadogTags<'a> {
    pub env: &'a str,
    pub service: &'a str,
    pub version: &'a str,
    pub build_uuid: &'a str,
}

fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn literal(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

/// Render an env map into container env vars.
///
/// Secret placeholders become `secretKeyRef`s, `POD_IP` and `DD_AGENT_HOST`
/// always come from the downward API, and the Datadog tags fill in only
/// missing keys.
#[must_use]
pub fn build_env(
    env: &BTreeMap<String, String>,
    service_name: &str,
    tags: &DatadogTags<'_>,
) -> Vec<EnvVar> {
    const FIELD_REFS: [(&str, &str); 2] =
        [("POD_IP", "status.podIP"), ("DD_AGENT_HOST", "status.hostIP")];

    let secrets: BTreeMap<String, SecretRef> = parse_secret_refs_from_env(env)
        .into_iter()
        .map(|secret| (secret.env_key.clone(), secret))
        .collect();

    let mut vars: Vec<EnvVar> = env
        .iter()
        .filter(|(key, _)| !FIELD_REFS.iter().any(|(name, _)| name == key))
        .map(|(key, value)| match secrets.get(key) {
            Some(secret) => EnvVar {
                name: key.clone(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: generate_secret_name(service_name, &secret.provider),
                        key: secret.env_key.clone(),
                        ..SecretKeySelector::default()
                    }),
                    ..EnvVarSource::default()
                }),
                ..EnvVar::default()
            },
            None => literal(key, value),
        })
        .collect();

    vars.extend(FIELD_REFS.iter().map(|(name, path)| field_ref(name, path)));

    for (key, value) in [
        ("DD_ENV", tags.env),
        ("DD_SERVICE", tags.service),
        ("DD_VERSION", tags.version),
        ("LC_UUID", tags.build_uuid),
    ] {
        if !env.contains_key(key) {
            vars.push(literal(key, value));
        }
    }

    vars
}

/// Readiness probe from a TCP port or an HTTP path, TCP taking precedence.
///
/// An HTTP probe without an explicit port uses the first container port and
/// is a [`Error::MissingField`] on `owner` when there is none.
pub fn readiness_probe(
    config: &ProbeConfig,
    ports: &[i32],
    owner: &str,
) -> Result<Option<Probe>> {
    let mut probe = Probe {
        initial_delay_seconds: config.initial_delay_seconds,
        period_seconds: config.period_seconds,
        timeout_seconds: config.timeout_seconds,
        success_threshold: config.success_threshold,
        failure_threshold: config.failure_threshold,
        ..Probe::default()
    };

    if let Some(port) = config.tcp_socket_port {
        probe.tcp_socket = Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..TCPSocketAction::default()
        });
    } else if let Some(path) = config.http_get_path.as_ref() {
        let port = config
            .http_get_port
            .or_else(|| ports.first().copied())
            .ok_or_else(|| Error::MissingField {
                object: owner.to_string(),
                field: "readiness.httpGet.port".to_string(),
            })?;
        probe.http_get = Some(HTTPGetAction {
            path: Some(path.clone()),
            port: IntOrString::Int(port),
            ..HTTPGetAction::default()
        });
    } else {
        return Ok(None);
    }

    Ok(Some(probe))
}

/// Liveness reuses readiness with a fixed grace period.
#[must_use]
pub fn liveness_probe(readiness: &Probe) -> Probe {
    Probe {
        initial_delay_seconds: Some(LIVENESS_INITIAL_DELAY_SECONDS),
        ..readiness.clone()
    }
}

/// Service resources with configured defaults filling the gaps.
#[must_use]
pub fn resource_requirements(spec: &ResourceSpec, defaults: &DefaultResources) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();

    let cpu_request = spec.cpu.request.clone().unwrap_or_else(|| defaults.cpu_request.clone());
    let memory_request = spec
        .memory
        .request
        .clone()
        .unwrap_or_else(|| defaults.memory_request.clone());
    requests.insert("cpu".to_string(), Quantity(cpu_request));
    requests.insert("memory".to_string(), Quantity(memory_request));

    if let Some(limit) = spec.cpu.limit.clone().or_else(|| defaults.cpu_limit.clone()) {
        limits.insert("cpu".to_string(), Quantity(limit));
    }
    if let Some(limit) = spec
        .memory
        .limit
        .clone()
        .or_else(|| defaults.memory_limit.clone())
    {
        limits.insert("memory".to_string(), Quantity(limit));
    }

    ResourceRequirements {
        requests: Some(requests),
        limits: (!limits.is_empty()).then_some(limits),
        ..ResourceRequirements::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContainerParts {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub env: Vec<EnvVar>,
    pub ports: Vec<i32>,
    pub resources: Option<ResourceRequirements>,
    pub readiness: Option<Probe>,
    pub volume_mounts: Vec<VolumeMount>,
}

impl ContainerParts {
    #[must_use]
    pub fn into_container(self) -> Container {
        let liveness = self.readiness.as_ref().map(liveness_probe);
        Container {
            name: self.name,
            image: Some(self.image),
            command: self.command,
            args: self.args,
            env: (!self.env.is_empty()).then_some(self.env),
            ports: (!self.ports.is_empty()).then(|| {
                self.ports
                    .iter()
                    .map(|port| ContainerPort {
                        container_port: *port,
                        ..ContainerPort::default()
                    })
                    .collect()
            }),
            resources: self.resources,
            readiness_probe: self.readiness,
            liveness_probe: liveness,
            volume_mounts: (!self.volume_mounts.is_empty()).then_some(self.volume_mounts),
            ..Container::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> DatadogTags<'static> {
        DatadogTags {
            env: "lifecycle",
            service: "api",
            version: "abc123",
            build_uuid: "b1",
        }
    }

    fn find<'a>(vars: &'a [EnvVar], name: &str) -> &'a EnvVar {
        vars.iter().find(|v| v.name == name).unwrap()
    }

    #[test]
    fn secret_placeholder_becomes_secret_key_ref() {
        let env = BTreeMap::from([("DB_PASS".to_string(), "{{aws:myapp/db:password}}".to_string())]);
        let vars = build_env(&env, "api", &tags());
        let var = find(&vars, "DB_PASS");

        assert_eq!(var.value, None);
        let secret = var.value_from.as_ref().unwrap().secret_key_ref.as_ref().unwrap();
        assert_eq!(secret.name, "api-aws-secrets");
        assert_eq!(secret.key, "DB_PASS");
    }

    #[test]
    fn field_refs_override_user_values() {
        let env = BTreeMap::from([("POD_IP".to_string(), "1.2.3.4".to_string())]);
        let vars = build_env(&env, "api", &tags());

        let pod_ip: Vec<_> = vars.iter().filter(|v| v.name == "POD_IP").collect();
        assert_eq!(pod_ip.len(), 1);
        assert_eq!(
            pod_ip[0].value_from.as_ref().unwrap().field_ref.as_ref().unwrap().field_path,
            "status.podIP"
        );
        assert!(find(&vars, "DD_AGENT_HOST").value_from.is_some());
    }

    #[test]
    fn datadog_tags_are_first_writer_wins() {
        let env = BTreeMap::from([("DD_SERVICE".to_string(), "custom".to_string())]);
        let vars = build_env(&env, "api", &tags());

        assert_eq!(vars.iter().filter(|v| v.name == "DD_SERVICE").count(), 1);
        assert_eq!(find(&vars, "DD_SERVICE").value.as_deref(), Some("custom"));
        assert_eq!(find(&vars, "DD_VERSION").value.as_deref(), Some("abc123"));
        assert_eq!(find(&vars, "LC_UUID").value.as_deref(), Some("b1"));
    }

    #[test]
    fn liveness_forces_grace_period() {
        let config = ProbeConfig {
            tcp_socket_port: Some(8080),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..ProbeConfig::default()
        };
        let readiness = readiness_probe(&config, &[], "deploy api-b1").unwrap().unwrap();
        let liveness = liveness_probe(&readiness);

        assert_eq!(readiness.initial_delay_seconds, Some(5));
        assert_eq!(liveness.initial_delay_seconds, Some(600));
        assert_eq!(liveness.period_seconds, Some(10));
        assert_eq!(liveness.tcp_socket, readiness.tcp_socket);
    }

    #[test]
    fn http_probe_defaults_to_first_port() {
        let config = ProbeConfig {
            http_get_path: Some("/healthz".into()),
            ..ProbeConfig::default()
        };
        let probe = readiness_probe(&config, &[3000, 9090], "deploy api-b1")
            .unwrap()
            .unwrap();
        let http = probe.http_get.unwrap();
        assert_eq!(http.port, IntOrString::Int(3000));
        assert!(readiness_probe(&ProbeConfig::default(), &[3000], "deploy api-b1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn http_probe_without_any_port_is_rejected() {
        let config = ProbeConfig {
            http_get_path: Some("/healthz".into()),
            ..ProbeConfig::default()
        };
        match readiness_probe(&config, &[], "deploy api-b1") {
            Err(Error::MissingField { object, field }) => {
                assert_eq!(object, "deploy api-b1");
                assert_eq!(field, "readiness.httpGet.port");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn defaults_fill_missing_resources() {
        let spec = ResourceSpec::default();
        let resources = resource_requirements(&spec, &DefaultResources::default());
        let requests = resources.requests.unwrap();
        assert_eq!(requests["cpu"], Quantity("10m".into()));
        assert_eq!(resources.limits.unwrap()["memory"], Quantity("2Gi".into()));
    }
}
