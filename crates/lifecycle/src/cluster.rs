//! Kubernetes access seam.
//!
//! Everything the orchestrator does to a cluster goes through [`ClusterClient`].
//! [`KubeCluster`] is the production implementation; tests substitute fakes.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::{Client, ResourceExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::types::{CreateOutcome, DeleteOutcome, Error, Result};

/// Field manager used for every server-side apply.
pub const FIELD_MANAGER: &str = "lifecycle";

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// `None` when the namespace does not exist.
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    async fn create_namespace(&self, namespace: &Namespace) -> Result<CreateOutcome>;

    /// Apply a JSON Patch to an existing namespace.
    async fn patch_namespace(&self, name: &str, patch: json_patch::Patch) -> Result<()>;

    async fn delete_namespace(&self, name: &str) -> Result<DeleteOutcome>;

    async fn get_service_account(&self, namespace: &str, name: &str)
        -> Result<Option<ServiceAccount>>;

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<CreateOutcome>;

    /// Strategic-merge patch of a service account.
    async fn patch_service_account(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()>;

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<CreateOutcome>;

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<CreateOutcome>;

    /// Server-side apply every document of a `---`-separated bundle.
    /// Returns the number of objects applied.
    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<usize>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;
}

/// Map a create result so 409 Conflict counts as success.
fn tolerate_conflict<T>(result: std::result::Result<T, kube::Error>) -> Result<CreateOutcome> {
    match result {
        Ok(_) => Ok(CreateOutcome::Created),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(e.into()),
    }
}

/// Map a get result so 404 Not Found is `None`.
fn tolerate_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Split `group/version` (or core `version`) into a GVK.
fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

/// Split a bundle into its non-empty documents.
pub fn split_documents(manifest: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value)?);
    }
    Ok(objects)
}

pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        tolerate_not_found(api.get(name).await)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<CreateOutcome> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let outcome = tolerate_conflict(api.create(&PostParams::default(), namespace).await)?;
        info!(namespace = %namespace.name_any(), ?outcome, "Created namespace");
        Ok(outcome)
    }

    async fn patch_namespace(&self, name: &str, patch: json_patch::Patch) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        debug!(namespace = %name, "Patched namespace labels");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<DeleteOutcome> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        tolerate_not_found(api.get(name).await)
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<CreateOutcome> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        tolerate_conflict(api.create(&PostParams::default(), account).await)
    }

    async fn patch_service_account(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<CreateOutcome> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        tolerate_conflict(api.create(&PostParams::default(), role).await)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<CreateOutcome> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        tolerate_conflict(api.create(&PostParams::default(), binding).await)
    }

    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<usize> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let objects = split_documents(manifest)?;

        for obj in &objects {
            let types = obj.types.as_ref().ok_or_else(|| Error::MissingField {
                object: obj.name_any(),
                field: "apiVersion/kind".to_string(),
            })?;
            let gvk = parse_gvk(&types.api_version, &types.kind);
            let (resource, _caps) = kube::discovery::pinned_kind(&self.client, &gvk).await?;

            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), namespace, &resource);
            let name = obj.name_any();
            api.patch(&name, &params, &Patch::Apply(obj)).await?;
            debug!(namespace = %namespace, kind = %types.kind, name = %name, "Applied object");
        }

        info!(namespace = %namespace, objects = objects.len(), "Applied manifest");
        Ok(objects.len())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_group_has_empty_group() {
        let gvk = parse_gvk("v1", "Service");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");

        let gvk = parse_gvk("getambassador.io/v3alpha1", "Mapping");
        assert_eq!(gvk.group, "getambassador.io");
        assert_eq!(gvk.version, "v3alpha1");
        assert_eq!(gvk.kind, "Mapping");
    }

    #[test]
    fn split_skips_empty_documents() {
        let bundle = "---\napiVersion: v1\nkind: Service\nmetadata:\n  name: a\n---\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: b\n";
        let objects = split_documents(bundle).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].name_any(), "a");
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Deployment");
    }

    #[test]
    fn conflict_is_success() {
        let conflict: std::result::Result<(), kube::Error> =
            Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "already exists".into(),
                reason: "AlreadyExists".into(),
                code: 409,
            }));
        assert_eq!(
            tolerate_conflict(conflict).unwrap(),
            CreateOutcome::AlreadyExists
        );
    }
}
