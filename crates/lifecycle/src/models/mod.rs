pub mod build;
pub mod deploy;
pub mod service;

pub use build::{namespace_for, Build, BuildStatus, CapacityType};
pub use deploy::{deploy_uuid, Deploy, DeployStatus, DeployType};
pub use service::{
    Deployable, DiskMedium, ProbeConfig, ResourceQuantity, ResourceSpec, Service, ServiceDisk,
    ServiceSpec, ServiceType,
};
