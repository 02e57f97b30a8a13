//! Disk wiring: volumes, mounts and claims.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::models::{DiskMedium, ServiceDisk};

const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";

#[must_use]
pub fn claim_name(deploy_uuid: &str, disk_name: &str) -> String {
    format!("{deploy_uuid}-{disk_name}-claim")
}

fn volume_name(deploy_uuid: &str, disk: &ServiceDisk) -> String {
    if disk.medium.is_persistent() {
        claim_name(deploy_uuid, &disk.name)
    } else {
        disk.name.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiskWiring {
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
    pub claims: Vec<PersistentVolumeClaim>,
}

impl DiskWiring {
    /// Single-attach volumes cannot be shared by surge pods.
    #[must_use]
    pub fn requires_recreate(&self) -> bool {
        !self.claims.is_empty()
    }
}

#[must_use]
pub fn wire_disks(
    deploy_uuid: &str,
    namespace: &str,
    disks: &[ServiceDisk],
    labels: &BTreeMap<String, String>,
) -> DiskWiring {
    let mut wiring = DiskWiring::default();

    for disk in disks {
        let name = volume_name(deploy_uuid, disk);

        let volume = match disk.medium {
            DiskMedium::Ebs | DiskMedium::Disk => {
                wiring.claims.push(PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(namespace.to_string()),
                        labels: Some(labels.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec![disk
                            .access_mode
                            .clone()
                            .unwrap_or_else(|| DEFAULT_ACCESS_MODE.to_string())]),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([(
                                "storage".to_string(),
                                Quantity(disk.storage_size.clone()),
                            )])),
                            ..VolumeResourceRequirements::default()
                        }),
                        ..PersistentVolumeClaimSpec::default()
                    }),
                    ..PersistentVolumeClaim::default()
                });
                Volume {
                    name: name.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: name.clone(),
                        ..PersistentVolumeClaimVolumeSource::default()
                    }),
                    ..Volume::default()
                }
            }
            DiskMedium::Memory => Volume {
                name: name.clone(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    size_limit: Some(Quantity(disk.storage_size.clone())),
                }),
                ..Volume::default()
            },
        };

        wiring.volumes.push(volume);
        wiring.mounts.push(VolumeMount {
            name,
            mount_path: disk.mount_path.clone(),
            ..VolumeMount::default()
        });
    }

    wiring
}
