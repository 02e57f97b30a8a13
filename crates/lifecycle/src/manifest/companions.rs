//! Objects generated alongside each Deployment.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec as KubeServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Value};

pub const MAPPING_API_VERSION: &str = "getambassador.io/v3alpha1";

/// NodePort service addressing the deploy inside the cluster.
#[must_use]
pub fn node_port_service(
    name: &str,
    namespace: &str,
    ports: &[i32],
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(KubeServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector.clone()),
            ports: Some(
                ports
                    .iter()
                    .map(|port| ServicePort {
                        name: Some(format!("tcp-{port}")),
                        port: *port,
                        target_port: Some(IntOrString::Int(*port)),
                        protocol: Some("TCP".to_string()),
                        ..ServicePort::default()
                    })
                    .collect(),
            ),
            ..KubeServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Ambassador mapping routing a gRPC host to the deploy's first port.
#[must_use]
pub fn grpc_mapping(
    deploy_uuid: &str,
    namespace: &str,
    hostname: &str,
    port: i32,
    labels: &BTreeMap<String, String>,
) -> Value {
    json!({
        "apiVersion": MAPPING_API_VERSION,
        "kind": "Mapping",
        "metadata": {
            "name": format!("{deploy_uuid}-grpc"),
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "hostname": hostname,
            "prefix": "/",
            "grpc": true,
            "timeout_ms": 0,
            "service": format!("{deploy_uuid}:{port}"),
        }
    })
}

/// Alias letting other deploys reach an external host by service name.
#[must_use]
pub fn external_name_service(
    service_name: &str,
    namespace: &str,
    cname: &str,
    labels: &BTreeMap<String, String>,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(service_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(KubeServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(cname.to_string()),
            ..KubeServiceSpec::default()
        }),
        ..Service::default()
    }
}
