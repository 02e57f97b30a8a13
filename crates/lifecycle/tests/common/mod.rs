//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, PodCondition, PodStatus, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::ObjectMeta;
use lifecycle::cluster::ClusterClient;
use lifecycle::config::{LifecycleConfig, RolloutConfig, StaticConfigProvider};
use lifecycle::declarative::InlineConfigSource;
use lifecycle::images::ImageBuilder;
use lifecycle::queue::{JobQueue, LifecycleJob};
use lifecycle::rollout::RetryPolicy;
use lifecycle::store::{BuildStore, InMemoryBuildStore};
use lifecycle::types::{CreateOutcome, DeleteOutcome, Error, Result};
use lifecycle::{BuildController, ControllerDeps, Deploy};

/// What `list_pods` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodMode {
    /// Nothing is ever scheduled
    Absent,
    /// One pod that never turns ready
    NeverReady,
    /// One ready pod
    Ready,
}

pub struct FakeCluster {
    pub namespaces: Mutex<BTreeMap<String, Namespace>>,
    pub accounts: Mutex<BTreeSet<(String, String)>>,
    pub calls: Mutex<Vec<String>>,
    pub applied: Mutex<Vec<String>>,
    pub pod_mode: Mutex<PodMode>,
    pub list_calls: AtomicU32,
    /// Whether the cluster auto-provisions the `default` account
    pub provisions_default_account: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            namespaces: Mutex::default(),
            accounts: Mutex::default(),
            calls: Mutex::default(),
            applied: Mutex::default(),
            pod_mode: Mutex::new(PodMode::Ready),
            list_calls: AtomicU32::new(0),
            provisions_default_account: AtomicBool::new(true),
            fail_delete: AtomicBool::new(false),
        }
    }
}

impl FakeCluster {
    pub fn with_pods(mode: PodMode) -> Self {
        let cluster = Self::default();
        *cluster.pod_mode.lock().unwrap() = mode;
        cluster
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn namespace_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.namespaces
            .lock()
            .unwrap()
            .get(name)
            .and_then(|ns| ns.metadata.labels.clone())
            .unwrap_or_default()
    }
}

fn pod(ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("pod-0".into()),
            ..ObjectMeta::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: if ready { "True" } else { "False" }.into(),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        self.record(format!("get_namespace {name}"));
        Ok(self.namespaces.lock().unwrap().get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<CreateOutcome> {
        let name = namespace.metadata.name.clone().unwrap_or_default();
        self.record(format!("create_namespace {name}"));
        let mut namespaces = self.namespaces.lock().unwrap();
        if namespaces.contains_key(&name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        namespaces.insert(name, namespace.clone());
        Ok(CreateOutcome::Created)
    }

    async fn patch_namespace(&self, name: &str, patch: json_patch::Patch) -> Result<()> {
        self.record(format!("patch_namespace {name}"));
        let mut namespaces = self.namespaces.lock().unwrap();
        let namespace = namespaces
            .get_mut(name)
            .ok_or_else(|| Error::BuildNotFound(name.to_string()))?;
        let mut doc = serde_json::to_value(&*namespace)?;
        if doc["metadata"]["labels"].is_null() {
            doc["metadata"]["labels"] = serde_json::json!({});
        }
        json_patch::patch(&mut doc, &patch.0)
            .map_err(|e| Error::ConfigError(format!("bad patch: {e}")))?;
        *namespace = serde_json::from_value(doc)?;
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<DeleteOutcome> {
        self.record(format!("delete_namespace {name}"));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::ConfigError("apiserver unavailable".into()));
        }
        Ok(match self.namespaces.lock().unwrap().remove(name) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>> {
        self.record(format!("get_service_account {namespace}/{name}"));
        let exists = self
            .accounts
            .lock()
            .unwrap()
            .contains(&(namespace.to_string(), name.to_string()))
            || (name == "default" && self.provisions_default_account.load(Ordering::SeqCst));
        Ok(exists.then(ServiceAccount::default))
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<CreateOutcome> {
        let name = account.metadata.name.clone().unwrap_or_default();
        self.record(format!("create_service_account {namespace}/{name}"));
        let inserted = self
            .accounts
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name));
        Ok(if inserted {
            CreateOutcome::Created
        } else {
            CreateOutcome::AlreadyExists
        })
    }

    async fn patch_service_account(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        self.record(format!("patch_service_account {namespace}/{name} {patch}"));
        Ok(())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<CreateOutcome> {
        let name = role.metadata.name.clone().unwrap_or_default();
        self.record(format!("create_role {namespace}/{name}"));
        Ok(CreateOutcome::Created)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<CreateOutcome> {
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.record(format!("create_role_binding {namespace}/{name}"));
        Ok(CreateOutcome::Created)
    }

    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<usize> {
        self.record(format!("apply_manifest {namespace}"));
        self.applied.lock().unwrap().push(manifest.to_string());
        Ok(manifest.matches("---\n").count())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.record(format!("list_pods {namespace} {label_selector}"));
        Ok(match *self.pod_mode.lock().unwrap() {
            PodMode::Absent => vec![],
            PodMode::NeverReady => vec![pod(false)],
            PodMode::Ready => vec![pod(true)],
        })
    }
}

/// Image builder failing for the listed services.
#[derive(Default)]
pub struct ScriptedBuilder {
    pub failing: BTreeSet<String>,
    pub built: Mutex<Vec<String>>,
    /// Claim a new run for this build mid-build, superseding the current one
    pub supersede: Mutex<Option<Arc<dyn BuildStore>>>,
}

impl ScriptedBuilder {
    pub fn failing(services: &[&str]) -> Self {
        Self {
            failing: services.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ImageBuilder for ScriptedBuilder {
    async fn build_image(&self, deploy: &Deploy, _enable_full_yaml: bool, _index: usize) -> bool {
        self.built.lock().unwrap().push(deploy.service_name.clone());
        let store = self.supersede.lock().unwrap().clone();
        if let Some(store) = store {
            store.claim_run(&deploy.build_uuid).await.unwrap();
        }
        !self.failing.contains(&deploy.service_name)
    }

    async fn deploy_cli(&self, deploy: &Deploy) -> bool {
        !self.failing.contains(&deploy.service_name)
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    pub jobs: Mutex<Vec<LifecycleJob>>,
    /// Reject every enqueue as a closed queue would
    pub closed: AtomicBool,
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, job: LifecycleJob) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::QueueError(format!("queue closed, dropped {} job", job.kind())));
        }
        self.jobs.lock().unwrap().push(job);
        Ok(())
    }
}

/// Config with zero-interval, small-budget polling.
pub fn fast_config() -> LifecycleConfig {
    LifecycleConfig {
        rollout: RolloutConfig {
            interval_seconds: 0,
            exists_attempts: 3,
            ready_attempts: 4,
        },
        ..LifecycleConfig::default()
    }
}

pub const LIFECYCLE_YAML: &str = r#"
version: "1.0.0"
environment:
  defaultServices:
    - name: web
    - name: worker
services:
  - name: web
    type: github
    ports: [8080]
    env:
      WORKER_HOST: "{{worker_internalHostname}}"
      DB_PASS: "{{aws:prod/db:password}}"
    dependsOn: [worker]
  - name: worker
    type: docker
    image: "redis:7"
    capacityType: SPOT
    disks:
      - name: cache
        mountPath: /data
        medium: EBS
        storageSize: 5Gi
"#;

pub struct Harness {
    pub store: Arc<InMemoryBuildStore>,
    pub cluster: Arc<FakeCluster>,
    pub builder: Arc<ScriptedBuilder>,
    pub source: Arc<InlineConfigSource>,
    pub queue: Arc<RecordingQueue>,
    pub controller: BuildController,
}

impl Harness {
    pub fn new(cluster: FakeCluster, builder: ScriptedBuilder) -> Self {
        Self::with_config(cluster, builder, fast_config())
    }

    pub fn with_config(cluster: FakeCluster, builder: ScriptedBuilder, config: LifecycleConfig) -> Self {
        let store = Arc::new(InMemoryBuildStore::new());
        let cluster = Arc::new(cluster);
        let builder = Arc::new(builder);
        let source = Arc::new(InlineConfigSource::new());
        let queue = Arc::new(RecordingQueue::default());

        let controller = BuildController::new(ControllerDeps {
            store: store.clone(),
            cluster: cluster.clone(),
            builder: builder.clone(),
            config: Arc::new(StaticConfigProvider::new(config)),
            source: source.clone(),
            queue: queue.clone(),
        })
        .with_account_policy(RetryPolicy::new(Duration::ZERO, 3));

        Self {
            store,
            cluster,
            builder,
            source,
            queue,
            controller,
        }
    }

    pub async fn register(&self, build: lifecycle::Build, yaml: &str) {
        self.source.set(&build.uuid, yaml);
        self.store.upsert_build(build).await.unwrap();
    }
}
