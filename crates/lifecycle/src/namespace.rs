//! Namespace and service-account provisioning.
//!
//! Both operations are safe to run concurrently for the same build: existence
//! checks and conflict-as-success replace locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::cluster::ClusterClient;
use crate::config::ConfigProvider;
use crate::rollout::{poll_until, PollStatus, RetryPolicy};
use crate::ttl::{TtlLabeler, TtlRequest};
use crate::types::{Error, Result};

pub const ROLE_ARN_ANNOTATION: &str = "eks.amazonaws.com/role-arn";
const ROLE_NAME: &str = "lifecycle-app";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceOutcome {
    Created,
    /// Existing namespace had its TTL labels refreshed
    Patched,
    /// Existing static namespace, left untouched
    Unchanged,
}

pub struct NamespaceProvisioner {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<dyn ConfigProvider>,
    ttl: TtlLabeler,
    /// Overrides the configured wait for the `default` account
    account_policy: Option<RetryPolicy>,
}

impl NamespaceProvisioner {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            ttl: TtlLabeler::new(config.clone()),
            cluster,
            config,
            account_policy: None,
        }
    }

    #[must_use]
    pub fn with_account_policy(mut self, policy: RetryPolicy) -> Self {
        self.account_policy = Some(policy);
        self
    }

    #[instrument(skip(self), fields(namespace = %name, build_uuid = %build_uuid))]
    pub async fn create_or_update_namespace(
        &self,
        name: &str,
        build_uuid: &str,
        static_env: bool,
        ttl: bool,
    ) -> Result<NamespaceOutcome> {
        let request = TtlRequest {
            namespace: name,
            build_uuid,
            static_env,
            ttl,
        };

        let Some(existing) = self.cluster.get_namespace(name).await? else {
            let labels = self.ttl.generate_ttl_labels(&request, Utc::now()).await;
            info!("{}", labels.log_message);
            let namespace = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(labels.labels),
                    ..ObjectMeta::default()
                },
                ..Namespace::default()
            };
            // A racing trigger may have created it since the GET
            self.cluster.create_namespace(&namespace).await?;
            return Ok(NamespaceOutcome::Created);
        };

        if static_env {
            debug!("Static namespace exists, skipping TTL patch");
            return Ok(NamespaceOutcome::Unchanged);
        }

        let current = existing.metadata.labels.unwrap_or_default();
        let patch = self
            .ttl
            .generate_ttl_patch(&request, &current, Utc::now())
            .await?;
        self.cluster.patch_namespace(name, patch).await?;
        info!("Refreshed namespace TTL labels");
        Ok(NamespaceOutcome::Patched)
    }

    /// Ensure the workload service account exists, carries the IAM role and
    /// is bound to the namespace role. Returns the account name.
    #[instrument(skip(self), fields(namespace = %namespace))]
    pub async fn create_or_update_service_account(
        &self,
        namespace: &str,
        role_arn: Option<&str>,
    ) -> Result<String> {
        let config = self.config.fetch_or_default().await;
        let account = config.service_account;
        let name = account.name.clone();

        if account.is_default_account() {
            let policy = self.account_policy.unwrap_or_else(|| account.ready_policy());
            let cluster = &self.cluster;
            let name = name.as_str();
            let status = poll_until(policy, |attempt| async move {
                match cluster.get_service_account(namespace, name).await? {
                    Some(_) => Ok(PollStatus::Ready(())),
                    None => {
                        debug!(attempt, "Default service account not provisioned yet");
                        Ok(PollStatus::NotYetReady)
                    }
                }
            })
            .await?;

            if let PollStatus::TimedOut { attempts } = status {
                return Err(Error::ServiceAccountTimeout {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    attempts,
                });
            }
        } else {
            let sa = ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_string()),
                    ..ObjectMeta::default()
                },
                ..ServiceAccount::default()
            };
            let outcome = self.cluster.create_service_account(namespace, &sa).await?;
            debug!(account = %name, ?outcome, "Ensured service account");
        }

        if let Some(arn) = role_arn.or(account.role_arn.as_deref()) {
            let patch = json!({
                "metadata": {
                    "annotations": { ROLE_ARN_ANNOTATION: arn }
                }
            });
            self.cluster
                .patch_service_account(namespace, &name, patch)
                .await?;
            debug!(account = %name, role_arn = %arn, "Annotated service account");
        }

        self.ensure_rbac(namespace, &name).await?;
        Ok(name)
    }

    async fn ensure_rbac(&self, namespace: &str, account: &str) -> Result<()> {
        let labels = BTreeMap::from([(
            "app.kubernetes.io/managed-by".to_string(),
            "lifecycle".to_string(),
        )]);

        let role = Role {
            metadata: ObjectMeta {
                name: Some(ROLE_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec![String::new(), "apps".to_string()]),
                resources: Some(vec![
                    "pods".to_string(),
                    "pods/log".to_string(),
                    "services".to_string(),
                    "configmaps".to_string(),
                    "deployments".to_string(),
                ]),
                verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
                ..PolicyRule::default()
            }]),
        };

        let binding = RoleBinding {
            metadata: ObjectMeta {
                name: Some(format!("{ROLE_NAME}-{account}")),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: ROLE_NAME.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: account.to_string(),
                namespace: Some(namespace.to_string()),
                ..Subject::default()
            }]),
        };

        self.cluster.create_role(namespace, &role).await?;
        self.cluster.create_role_binding(namespace, &binding).await?;
        Ok(())
    }
}
