//! Build lifecycle controller.
//!
//! Drives a build through `QUEUED → BUILDING → BUILT → DEPLOYING → DEPLOYED`
//! (or `ERROR` / `CONFIG_ERROR`) and `TEARING_DOWN → TORN_DOWN`. Every run
//! claims a fresh run token first; all later writes are conditional on that
//! token, so when a build is retriggered the older run's commits become
//! no-ops instead of overwriting the newer run.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use notify::NotifyEvent;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::config::{ConfigProvider, LifecycleConfig};
use crate::declarative::{resolve_deploys, DeclarativeConfigSource, LifecycleYaml};
use crate::env::EnvRenderer;
use crate::graph::DependencyGraph;
use crate::images::{ImageBuildCoordinator, ImageBuilder};
use crate::links::dashboard_links;
use crate::manifest::{generate_manifests, join_documents, DeployManifest, ManifestInput};
use crate::models::{Build, BuildStatus, Deploy, DeployStatus};
use crate::namespace::NamespaceProvisioner;
use crate::queue::{JobQueue, LifecycleJob};
use crate::rollout::{RetryPolicy, RolloutVerifier};
use crate::store::{BuildPatch, BuildStore, CommitOutcome, DeployPatch};
use crate::types::{DeleteOutcome, Error, Result};

/// Collaborators injected into the controller.
pub struct ControllerDeps {
    pub store: Arc<dyn BuildStore>,
    pub cluster: Arc<dyn ClusterClient>,
    pub builder: Arc<dyn ImageBuilder>,
    pub config: Arc<dyn ConfigProvider>,
    pub source: Arc<dyn DeclarativeConfigSource>,
    pub queue: Arc<dyn JobQueue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run committed this final status
    Completed(BuildStatus),
    /// A newer run took over; this one stopped without writing
    Superseded,
    /// Nothing to do
    Skipped,
}

pub struct BuildController {
    store: Arc<dyn BuildStore>,
    cluster: Arc<dyn ClusterClient>,
    config: Arc<dyn ConfigProvider>,
    source: Arc<dyn DeclarativeConfigSource>,
    queue: Arc<dyn JobQueue>,
    images: ImageBuildCoordinator,
    namespaces: NamespaceProvisioner,
}

impl BuildController {
    #[must_use]
    pub fn new(deps: ControllerDeps) -> Self {
        Self {
            images: ImageBuildCoordinator::new(deps.builder, deps.store.clone()),
            namespaces: NamespaceProvisioner::new(deps.cluster.clone(), deps.config.clone()),
            store: deps.store,
            cluster: deps.cluster,
            config: deps.config,
            source: deps.source,
            queue: deps.queue,
        }
    }

    /// Override the wait for cluster-provisioned service accounts.
    #[must_use]
    pub fn with_account_policy(mut self, policy: RetryPolicy) -> Self {
        self.namespaces = self.namespaces.with_account_policy(policy);
        self
    }

    /// Resolve the build's deploys, build their images and, when
    /// `should_deploy`, roll them out to the build namespace.
    #[instrument(skip(self), fields(build_uuid = %build_uuid))]
    pub async fn resolve_and_deploy_build(
        &self,
        build_uuid: &str,
        should_deploy: bool,
    ) -> Result<RunOutcome> {
        let build = self
            .store
            .get_build(build_uuid)
            .await?
            .ok_or_else(|| Error::BuildNotFound(build_uuid.to_string()))?;
        if matches!(build.status, BuildStatus::TearingDown | BuildStatus::TornDown) {
            info!(status = %build.status, "Build is being torn down, skipping run");
            return Ok(RunOutcome::Skipped);
        }
        let run_uuid = self.store.claim_run(build_uuid).await?;
        let config = self.config.fetch_or_default().await;
        info!(run_uuid = %run_uuid, should_deploy, "Starting build run");

        match self.run(build, &run_uuid, &config, should_deploy).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let status = if e.is_config_error() {
                    BuildStatus::ConfigError
                } else {
                    BuildStatus::Error
                };
                error!(run_uuid = %run_uuid, error = %e, %status, "Build run failed");
                let patch = BuildPatch::status(status).with_message(Some(e.to_string()));
                Ok(match self.update_status(build_uuid, &run_uuid, patch, &config).await? {
                    Some(_) => RunOutcome::Completed(status),
                    None => RunOutcome::Superseded,
                })
            }
        }
    }

    async fn run(
        &self,
        build: Build,
        run_uuid: &str,
        config: &LifecycleConfig,
        should_deploy: bool,
    ) -> Result<RunOutcome> {
        let uuid = build.uuid.clone();

        let text = self.source.fetch_yaml(&build).await?;
        let yaml = LifecycleYaml::parse(&text)?;

        let existing = self.store.get_deploys(&uuid).await?;
        let mut deploys = resolve_deploys(&build, &yaml, &existing, &config.images.registry)?;
        let renderer = EnvRenderer::new(&build, &deploys, config);
        for deploy in &mut deploys {
            renderer.render_deploy(deploy)?;
        }
        if !self
            .store
            .replace_deploys(&uuid, run_uuid, deploys.clone())
            .await?
        {
            return Ok(RunOutcome::Superseded);
        }

        let mut patch = BuildPatch::status(BuildStatus::Building).with_message(None);
        match DependencyGraph::build(&deploys).and_then(|graph| graph.to_value()) {
            Ok(graph) => patch = patch.with_dependency_graph(graph),
            Err(e) => warn!(error = %e, "Could not build dependency graph, continuing"),
        }
        let Some(build) = self.update_status(&uuid, run_uuid, patch, config).await? else {
            return Ok(RunOutcome::Superseded);
        };

        let (images, cli) = tokio::join!(
            self.images.build_images(&build, run_uuid, &deploys),
            self.images.deploy_cli_services(&build, run_uuid, &deploys),
        );
        if !(images.success && cli.success) {
            let failed: Vec<&str> = images
                .failed()
                .into_iter()
                .chain(cli.failed())
                .collect();
            return Err(Error::ImageBuildFailed(failed.join(", ")));
        }

        let patch = BuildPatch::status(BuildStatus::Built);
        let Some(build) = self.update_status(&uuid, run_uuid, patch, config).await? else {
            return Ok(RunOutcome::Superseded);
        };
        if !should_deploy {
            return Ok(RunOutcome::Completed(BuildStatus::Built));
        }

        let patch = BuildPatch::status(BuildStatus::Deploying);
        let Some(build) = self.update_status(&uuid, run_uuid, patch, config).await? else {
            return Ok(RunOutcome::Superseded);
        };
        let ttl = yaml.environment.ttl.unwrap_or(build.ttl);
        self.deploy(build, run_uuid, config, ttl).await
    }

    async fn deploy(
        &self,
        build: Build,
        run_uuid: &str,
        config: &LifecycleConfig,
        ttl: bool,
    ) -> Result<RunOutcome> {
        let uuid = build.uuid.as_str();
        let namespace = build.namespace.as_str();

        let outcome = self
            .namespaces
            .create_or_update_namespace(namespace, uuid, build.is_static, ttl)
            .await?;
        debug!(?outcome, "Namespace ready");
        let account = self
            .namespaces
            .create_or_update_service_account(namespace, None)
            .await?;

        let deploys = self.store.get_deploys(uuid).await?;
        let manifests = generate_manifests(&ManifestInput {
            build: &build,
            deploys: &deploys,
            namespace,
            service_account: &account,
            config,
            now: Utc::now(),
        })?;
        let bundle = join_documents(
            manifests
                .iter()
                .flat_map(|m| m.documents.iter().map(String::as_str)),
        );

        for manifest in &manifests {
            let patch = DeployPatch::status(DeployStatus::Deploying).with_manifest(manifest.to_yaml());
            if !self
                .store
                .update_deploy(uuid, run_uuid, &manifest.deploy_uuid, patch)
                .await?
            {
                return Ok(RunOutcome::Superseded);
            }
        }

        if !bundle.is_empty() {
            self.cluster.apply_manifest(namespace, &bundle).await?;
        }

        let unscheduled = self
            .verify_rollout(&build, run_uuid, config, &deploys, &manifests)
            .await?;

        let message = (!unscheduled.is_empty())
            .then(|| format!("No pods observed for: {}", unscheduled.join(", ")));
        let patch = BuildPatch::status(BuildStatus::Deployed)
            .with_message(message)
            .with_manifest(bundle);
        Ok(match self.update_status(uuid, run_uuid, patch, config).await? {
            Some(_) => RunOutcome::Completed(BuildStatus::Deployed),
            None => RunOutcome::Superseded,
        })
    }

    /// Wait for every rendered deploy concurrently. Returns the deploys whose
    /// pods never appeared; a readiness timeout fails the run.
    async fn verify_rollout(
        &self,
        build: &Build,
        run_uuid: &str,
        config: &LifecycleConfig,
        deploys: &[Deploy],
        manifests: &[DeployManifest],
    ) -> Result<Vec<String>> {
        let verifier = RolloutVerifier::new(self.cluster.clone(), &config.rollout);
        let rendered: Vec<&Deploy> = manifests
            .iter()
            .filter_map(|m| deploys.iter().find(|d| d.uuid == m.deploy_uuid))
            .collect();

        let results = join_all(rendered.iter().map(|deploy| {
            let verifier = &verifier;
            async move {
                let result = verifier
                    .wait_for_deploy_pod_ready(&build.namespace, deploy)
                    .await;
                let patch = match &result {
                    Ok(true) => DeployPatch::status(DeployStatus::Ready).with_message(None),
                    Ok(false) => DeployPatch::status(DeployStatus::Deploying)
                        .with_message(Some("no pods observed".to_string())),
                    Err(e) => DeployPatch::status(DeployStatus::DeployFailed)
                        .with_message(Some(e.to_string())),
                };
                if let Err(e) = self
                    .store
                    .update_deploy(&build.uuid, run_uuid, &deploy.uuid, patch)
                    .await
                {
                    warn!(deploy_uuid = %deploy.uuid, error = %e, "Failed to record rollout status");
                }
                (deploy.uuid.clone(), result)
            }
        }))
        .await;

        let mut unscheduled = Vec::new();
        for (deploy_uuid, result) in results {
            if !result? {
                warn!(deploy_uuid = %deploy_uuid, "No pods appeared, treating rollout as complete");
                unscheduled.push(deploy_uuid);
            }
        }
        Ok(unscheduled)
    }

    /// Tear down a build's namespace. Already torn-down builds are skipped
    /// and a namespace that is already gone counts as deleted.
    #[instrument(skip(self), fields(build_uuid = %build_uuid))]
    pub async fn delete_build(&self, build_uuid: &str) -> Result<RunOutcome> {
        let build = self
            .store
            .get_build(build_uuid)
            .await?
            .ok_or_else(|| Error::BuildNotFound(build_uuid.to_string()))?;
        if build.status == BuildStatus::TornDown {
            info!("Build already torn down");
            return Ok(RunOutcome::Skipped);
        }

        let run_uuid = self.store.claim_run(build_uuid).await?;
        let config = self.config.fetch_or_default().await;

        let patch = BuildPatch::status(BuildStatus::TearingDown).with_message(None);
        let Some(build) = self.update_status(build_uuid, &run_uuid, patch, &config).await? else {
            return Ok(RunOutcome::Superseded);
        };

        match self.cluster.delete_namespace(&build.namespace).await {
            Ok(DeleteOutcome::Deleted) => info!(namespace = %build.namespace, "Deleted namespace"),
            Ok(DeleteOutcome::NotFound) => {
                info!(namespace = %build.namespace, "Namespace already gone");
            }
            Err(e) => {
                error!(error = %e, "Teardown failed");
                let patch = BuildPatch::status(BuildStatus::Error)
                    .with_message(Some(format!("Teardown failed: {e}")));
                return Ok(
                    match self.update_status(build_uuid, &run_uuid, patch, &config).await? {
                        Some(_) => RunOutcome::Completed(BuildStatus::Error),
                        None => RunOutcome::Superseded,
                    },
                );
            }
        }

        for deploy in self.store.get_deploys(build_uuid).await? {
            let patch = DeployPatch::status(DeployStatus::TornDown).with_active(false);
            self.store
                .update_deploy(build_uuid, &run_uuid, &deploy.uuid, patch)
                .await?;
        }

        let patch = BuildPatch::status(BuildStatus::TornDown);
        Ok(match self.update_status(build_uuid, &run_uuid, patch, &config).await? {
            Some(_) => RunOutcome::Completed(BuildStatus::TornDown),
            None => RunOutcome::Superseded,
        })
    }

    /// Commit a status transition for `run_uuid`.
    ///
    /// Reloads the build, recomputes its dashboard links, and commits only if
    /// the run still owns the build. Returns `None` for a superseded run. A
    /// notification job is enqueued after each commit; enqueue failures are
    /// logged and do not fail the commit.
    pub async fn update_status(
        &self,
        build_uuid: &str,
        run_uuid: &str,
        patch: BuildPatch,
        config: &LifecycleConfig,
    ) -> Result<Option<Build>> {
        let current = self
            .store
            .get_build(build_uuid)
            .await?
            .ok_or_else(|| Error::BuildNotFound(build_uuid.to_string()))?;
        if !current.is_owned_by(run_uuid) {
            debug!(run_uuid = %run_uuid, "Run superseded, skipping status commit");
            return Ok(None);
        }

        let deploys = self.store.get_deploys(build_uuid).await?;
        let patch = patch.with_dashboard_links(dashboard_links(&current, &deploys, &config.domains));

        match self.store.commit(build_uuid, run_uuid, patch).await? {
            CommitOutcome::Stale => {
                debug!(run_uuid = %run_uuid, "Run superseded during commit");
                Ok(None)
            }
            CommitOutcome::Committed(build) => {
                info!(status = %build.status, "Committed build status");
                self.enqueue_notification(&build).await;
                Ok(Some(build))
            }
        }
    }

    async fn enqueue_notification(&self, build: &Build) {
        let event = if build.status == BuildStatus::TornDown {
            NotifyEvent::BuildTornDown {
                build_uuid: build.uuid.clone(),
                namespace: build.namespace.clone(),
                timestamp: Utc::now(),
            }
        } else {
            NotifyEvent::BuildStatusChanged {
                build_uuid: build.uuid.clone(),
                namespace: build.namespace.clone(),
                status: build.status.to_string(),
                failed: build.status.is_failure(),
                message: build.status_message.clone(),
                pull_request: build.pull_request.clone(),
                links: build.dashboard_links.clone(),
                timestamp: Utc::now(),
            }
        };

        if let Err(e) = self.queue.enqueue(LifecycleJob::notify(event)).await {
            warn!(build_uuid = %build.uuid, error = %e, "Failed to enqueue notification");
        }
    }
}
