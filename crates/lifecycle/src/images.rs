//! Image build coordination.
//!
//! Image builds and CLI deploys fan out one call per deploy and join all of
//! them. A failing deploy never cancels its siblings; the aggregate is the
//! logical AND of every result, and each result stays individually visible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::models::{Build, Deploy, DeployStatus};
use crate::store::{BuildStore, DeployPatch};

/// Builds and pushes images; CLI deploys are provisioned by the same backend.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_image(&self, deploy: &Deploy, enable_full_yaml: bool, index: usize) -> bool;

    async fn deploy_cli(&self, deploy: &Deploy) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub deploy_uuid: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildOutcome {
    pub results: Vec<DeployResult>,
    pub success: bool,
}

impl BuildOutcome {
    fn from_results(results: Vec<DeployResult>) -> Self {
        let success = results.iter().all(|r| r.success);
        Self { results, success }
    }

    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.deploy_uuid.as_str())
            .collect()
    }
}

pub struct ImageBuildCoordinator {
    builder: Arc<dyn ImageBuilder>,
    store: Arc<dyn BuildStore>,
}

impl ImageBuildCoordinator {
    #[must_use]
    pub fn new(builder: Arc<dyn ImageBuilder>, store: Arc<dyn BuildStore>) -> Self {
        Self { builder, store }
    }

    /// Best-effort per-deploy status; a stale or failed mark does not stop the build.
    async fn mark(&self, build: &Build, run_uuid: &str, deploy: &Deploy, status: DeployStatus) {
        match self
            .store
            .update_deploy(&build.uuid, run_uuid, &deploy.uuid, DeployPatch::status(status))
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(deploy_uuid = %deploy.uuid, %status, "Deploy status not recorded (stale run)"),
            Err(e) => warn!(deploy_uuid = %deploy.uuid, error = %e, "Failed to record deploy status"),
        }
    }

    /// Build every active, image-buildable deploy concurrently.
    #[instrument(skip(self, build, deploys), fields(build_uuid = %build.uuid))]
    pub async fn build_images(&self, build: &Build, run_uuid: &str, deploys: &[Deploy]) -> BuildOutcome {
        let buildable: Vec<&Deploy> = deploys
            .iter()
            .filter(|d| d.active && d.deploy_type.is_image_buildable())
            .collect();

        let results = join_all(buildable.into_iter().enumerate().map(|(index, deploy)| async move {
            self.mark(build, run_uuid, deploy, DeployStatus::Building).await;
            let success = self
                .builder
                .build_image(deploy, build.enable_full_yaml, index)
                .await;
            let status = if success {
                DeployStatus::Built
            } else {
                DeployStatus::BuildFailed
            };
            self.mark(build, run_uuid, deploy, status).await;
            DeployResult {
                deploy_uuid: deploy.uuid.clone(),
                success,
            }
        }))
        .await;

        let outcome = BuildOutcome::from_results(results);
        info!(
            deploys = outcome.results.len(),
            success = outcome.success,
            "Image builds finished"
        );
        outcome
    }

    /// Provision every active CLI deploy concurrently.
    #[instrument(skip(self, build, deploys), fields(build_uuid = %build.uuid))]
    pub async fn deploy_cli_services(
        &self,
        build: &Build,
        run_uuid: &str,
        deploys: &[Deploy],
    ) -> BuildOutcome {
        let cli: Vec<&Deploy> = deploys
            .iter()
            .filter(|d| d.active && d.deploy_type.is_cli())
            .collect();

        let results = join_all(cli.into_iter().map(|deploy| async move {
            self.mark(build, run_uuid, deploy, DeployStatus::Deploying).await;
            let success = self.builder.deploy_cli(deploy).await;
            let status = if success {
                DeployStatus::Ready
            } else {
                DeployStatus::DeployFailed
            };
            self.mark(build, run_uuid, deploy, status).await;
            DeployResult {
                deploy_uuid: deploy.uuid.clone(),
                success,
            }
        }))
        .await;

        BuildOutcome::from_results(results)
    }
}

/// Accepts deploys whose image is already known; used when no build
/// service is configured.
pub struct PrebuiltImageBuilder;

#[async_trait]
impl ImageBuilder for PrebuiltImageBuilder {
    async fn build_image(&self, deploy: &Deploy, _enable_full_yaml: bool, _index: usize) -> bool {
        let ready = deploy.docker_image.is_some();
        if !ready {
            warn!(deploy_uuid = %deploy.uuid, "No prebuilt image and no build service configured");
        }
        ready
    }

    async fn deploy_cli(&self, deploy: &Deploy) -> bool {
        warn!(deploy_uuid = %deploy.uuid, "No build service configured for CLI deploys");
        false
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildRequest<'a> {
    deploy_uuid: &'a str,
    build_uuid: &'a str,
    service_name: &'a str,
    sha: Option<&'a str>,
    image: Option<&'a str>,
    enable_full_yaml: bool,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    success: bool,
}

/// Delegates to an external build service over HTTP.
///
/// `POST {endpoint}/builds` and `POST {endpoint}/cli-deploys` answer
/// `{"success": bool}`; transport errors count as failure.
pub struct RemoteImageBuilder {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteImageBuilder {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, request: &BuildRequest<'_>) -> bool {
        let url = format!("{}/{path}", self.endpoint);
        let response = match self.client.post(&url).json(request).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(deploy_uuid = %request.deploy_uuid, error = %e, "Build service unreachable");
                return false;
            }
        };

        if !response.status().is_success() {
            warn!(
                deploy_uuid = %request.deploy_uuid,
                status = %response.status(),
                "Build service rejected request"
            );
            return false;
        }

        match response.json::<BuildResponse>().await {
            Ok(body) => body.success,
            Err(e) => {
                warn!(deploy_uuid = %request.deploy_uuid, error = %e, "Unreadable build service response");
                false
            }
        }
    }
}

#[async_trait]
impl ImageBuilder for RemoteImageBuilder {
    async fn build_image(&self, deploy: &Deploy, enable_full_yaml: bool, index: usize) -> bool {
        let request = BuildRequest {
            deploy_uuid: &deploy.uuid,
            build_uuid: &deploy.build_uuid,
            service_name: &deploy.service_name,
            sha: deploy.sha.as_deref(),
            image: deploy.docker_image.as_deref(),
            enable_full_yaml,
            index,
        };
        self.post("builds", &request).await
    }

    async fn deploy_cli(&self, deploy: &Deploy) -> bool {
        let request = BuildRequest {
            deploy_uuid: &deploy.uuid,
            build_uuid: &deploy.build_uuid,
            service_name: &deploy.service_name,
            sha: deploy.sha.as_deref(),
            image: None,
            enable_full_yaml: true,
            index: 0,
        };
        self.post("cli-deploys", &request).await
    }
}
