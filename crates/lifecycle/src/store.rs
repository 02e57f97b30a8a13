//! Build and deploy persistence.
//!
//! Every mutation made on behalf of a run carries the run token the caller
//! observed. The store applies it only while that token is still current, as
//! one conditional update, so a superseded run can never overwrite a newer
//! run's state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::{Build, BuildStatus, Deploy, DeployStatus};
use crate::types::{Error, Result};

/// Fields a status commit may change on a build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildPatch {
    pub status: Option<BuildStatus>,
    /// `Some(None)` clears the message
    pub status_message: Option<Option<String>>,
    pub manifest: Option<String>,
    pub dependency_graph: Option<serde_json::Value>,
    pub dashboard_links: Option<BTreeMap<String, String>>,
}

impl BuildPatch {
    #[must_use]
    pub fn status(status: BuildStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.status_message = Some(message);
        self
    }

    #[must_use]
    pub fn with_manifest(mut self, manifest: String) -> Self {
        self.manifest = Some(manifest);
        self
    }

    #[must_use]
    pub fn with_dependency_graph(mut self, graph: serde_json::Value) -> Self {
        self.dependency_graph = Some(graph);
        self
    }

    #[must_use]
    pub fn with_dashboard_links(mut self, links: BTreeMap<String, String>) -> Self {
        self.dashboard_links = Some(links);
        self
    }

    fn apply(self, build: &mut Build) {
        if let Some(status) = self.status {
            build.status = status;
        }
        if let Some(message) = self.status_message {
            build.status_message = message;
        }
        if let Some(manifest) = self.manifest {
            build.manifest = Some(manifest);
        }
        if let Some(graph) = self.dependency_graph {
            build.dependency_graph = Some(graph);
        }
        if let Some(links) = self.dashboard_links {
            build.dashboard_links = links;
        }
    }
}

/// Fields a run may change on a deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployPatch {
    pub status: Option<DeployStatus>,
    pub status_message: Option<Option<String>>,
    pub active: Option<bool>,
    pub manifest: Option<String>,
}

impl DeployPatch {
    #[must_use]
    pub fn status(status: DeployStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.status_message = Some(message);
        self
    }

    #[must_use]
    pub fn with_manifest(mut self, manifest: String) -> Self {
        self.manifest = Some(manifest);
        self
    }

    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    fn apply(self, deploy: &mut Deploy) {
        if let Some(status) = self.status {
            deploy.status = status;
        }
        if let Some(message) = self.status_message {
            deploy.status_message = message;
        }
        if let Some(active) = self.active {
            deploy.active = active;
        }
        if let Some(manifest) = self.manifest {
            deploy.manifest = Some(manifest);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(Build),
    /// The caller's run token was superseded; nothing changed
    Stale,
}

impl CommitOutcome {
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Insert a build or replace its declared fields, keeping run state.
    async fn upsert_build(&self, build: Build) -> Result<()>;

    async fn get_build(&self, uuid: &str) -> Result<Option<Build>>;

    /// Mint and persist a fresh run token, superseding every earlier run.
    async fn claim_run(&self, uuid: &str) -> Result<String>;

    /// Apply `patch` only if `expected_run` is still the stored token.
    async fn commit(
        &self,
        uuid: &str,
        expected_run: &str,
        patch: BuildPatch,
    ) -> Result<CommitOutcome>;

    async fn get_deploys(&self, build_uuid: &str) -> Result<Vec<Deploy>>;

    /// Replace the deploy set. Returns `false` when the run is stale.
    async fn replace_deploys(
        &self,
        build_uuid: &str,
        expected_run: &str,
        deploys: Vec<Deploy>,
    ) -> Result<bool>;

    /// Returns `false` when the run is stale or the deploy is unknown.
    async fn update_deploy(
        &self,
        build_uuid: &str,
        expected_run: &str,
        deploy_uuid: &str,
        patch: DeployPatch,
    ) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct BuildRecord {
    build: Build,
    deploys: Vec<Deploy>,
}

/// Process-local store; each record is updated under its shard lock.
#[derive(Default)]
pub struct InMemoryBuildStore {
    records: DashMap<String, BuildRecord>,
}

impl InMemoryBuildStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl BuildStore for InMemoryBuildStore {
    async fn upsert_build(&self, build: Build) -> Result<()> {
        match self.records.get_mut(&build.uuid) {
            Some(mut record) => {
                let run_uuid = record.build.run_uuid.take();
                record.build = Build { run_uuid, ..build };
            }
            None => {
                self.records.insert(
                    build.uuid.clone(),
                    BuildRecord {
                        build,
                        deploys: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_build(&self, uuid: &str) -> Result<Option<Build>> {
        Ok(self.records.get(uuid).map(|r| r.build.clone()))
    }

    async fn claim_run(&self, uuid: &str) -> Result<String> {
        let mut record = self
            .records
            .get_mut(uuid)
            .ok_or_else(|| Error::BuildNotFound(uuid.to_string()))?;
        let run_uuid = Uuid::new_v4().to_string();
        record.build.run_uuid = Some(run_uuid.clone());
        Ok(run_uuid)
    }

    async fn commit(
        &self,
        uuid: &str,
        expected_run: &str,
        patch: BuildPatch,
    ) -> Result<CommitOutcome> {
        let mut record = self
            .records
            .get_mut(uuid)
            .ok_or_else(|| Error::BuildNotFound(uuid.to_string()))?;
        if !record.build.is_owned_by(expected_run) {
            return Ok(CommitOutcome::Stale);
        }
        patch.apply(&mut record.build);
        Ok(CommitOutcome::Committed(record.build.clone()))
    }

    async fn get_deploys(&self, build_uuid: &str) -> Result<Vec<Deploy>> {
        Ok(self
            .records
            .get(build_uuid)
            .map(|r| r.deploys.clone())
            .unwrap_or_default())
    }

    async fn replace_deploys(
        &self,
        build_uuid: &str,
        expected_run: &str,
        deploys: Vec<Deploy>,
    ) -> Result<bool> {
        let mut record = self
            .records
            .get_mut(build_uuid)
            .ok_or_else(|| Error::BuildNotFound(build_uuid.to_string()))?;
        if !record.build.is_owned_by(expected_run) {
            return Ok(false);
        }
        record.deploys = deploys;
        Ok(true)
    }

    async fn update_deploy(
        &self,
        build_uuid: &str,
        expected_run: &str,
        deploy_uuid: &str,
        patch: DeployPatch,
    ) -> Result<bool> {
        let mut record = self
            .records
            .get_mut(build_uuid)
            .ok_or_else(|| Error::BuildNotFound(build_uuid.to_string()))?;
        if !record.build.is_owned_by(expected_run) {
            return Ok(false);
        }
        match record.deploys.iter_mut().find(|d| d.uuid == deploy_uuid) {
            Some(deploy) => {
                patch.apply(deploy);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_build() -> (InMemoryBuildStore, String) {
        let store = InMemoryBuildStore::new();
        store.upsert_build(Build::new("b1")).await.unwrap();
        let run = store.claim_run("b1").await.unwrap();
        (store, run)
    }

    #[tokio::test]
    async fn stale_token_does_not_commit() {
        let (store, r0) = store_with_build().await;
        let r1 = store.claim_run("b1").await.unwrap();
        assert_ne!(r0, r1);

        store
            .commit("b1", &r1, BuildPatch::status(BuildStatus::Building))
            .await
            .unwrap();
        let outcome = store
            .commit("b1", &r0, BuildPatch::status(BuildStatus::Error))
            .await
            .unwrap();

        assert!(outcome.is_stale());
        let build = store.get_build("b1").await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Building);
        assert!(build.is_owned_by(&r1));
    }

    #[tokio::test]
    async fn upsert_preserves_run_token() {
        let (store, run) = store_with_build().await;
        let mut updated = Build::new("b1");
        updated.is_static = true;
        store.upsert_build(updated).await.unwrap();

        let build = store.get_build("b1").await.unwrap().unwrap();
        assert!(build.is_static);
        assert!(build.is_owned_by(&run));
    }

    #[tokio::test]
    async fn deploy_updates_are_gated() {
        let (store, r0) = store_with_build().await;
        let deploy = Deploy::new("b1", "web");
        let deploy_uuid = deploy.uuid.clone();
        assert!(store.replace_deploys("b1", &r0, vec![deploy]).await.unwrap());

        let r1 = store.claim_run("b1").await.unwrap();
        let stale = store
            .update_deploy("b1", &r0, &deploy_uuid, DeployPatch::status(DeployStatus::Ready))
            .await
            .unwrap();
        assert!(!stale);

        let applied = store
            .update_deploy("b1", &r1, &deploy_uuid, DeployPatch::status(DeployStatus::Built))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(
            store.get_deploys("b1").await.unwrap()[0].status,
            DeployStatus::Built
        );
    }

    #[tokio::test]
    async fn unknown_build_is_an_error() {
        let store = InMemoryBuildStore::new();
        assert!(matches!(
            store.claim_run("nope").await,
            Err(Error::BuildNotFound(_))
        ));
    }
}
