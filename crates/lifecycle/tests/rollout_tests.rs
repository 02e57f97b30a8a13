//! Readiness polling budgets and image build aggregation.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeCluster, PodMode, ScriptedBuilder};
use lifecycle::images::ImageBuildCoordinator;
use lifecycle::rollout::{RetryPolicy, RolloutVerifier};
use lifecycle::store::{BuildStore, InMemoryBuildStore};
use lifecycle::{Build, Deploy, DeployStatus, DeployType, Error};

fn verifier(cluster: &Arc<FakeCluster>) -> RolloutVerifier {
    RolloutVerifier::with_policies(
        cluster.clone(),
        RetryPolicy::new(Duration::ZERO, 60),
        RetryPolicy::new(Duration::ZERO, 180),
    )
}

#[tokio::test]
async fn no_pods_gives_up_after_existence_budget() {
    let cluster = Arc::new(FakeCluster::with_pods(PodMode::Absent));
    let ready = verifier(&cluster)
        .wait_for_pod_ready(&Build::new("b1"))
        .await
        .unwrap();

    assert!(!ready);
    assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 60);
    assert!(cluster
        .calls()
        .iter()
        .all(|c| c == "list_pods env-b1 lc_uuid=b1"));
}

#[tokio::test]
async fn unready_pods_time_out_after_readiness_budget() {
    let cluster = Arc::new(FakeCluster::with_pods(PodMode::NeverReady));
    let deploy = Deploy::new("b1", "web");
    let err = verifier(&cluster)
        .wait_for_deploy_pod_ready("env-b1", &deploy)
        .await
        .unwrap_err();

    match err {
        Error::ReadinessTimeout { selector, attempts } => {
            assert_eq!(selector, "deploy_uuid=web-b1");
            assert_eq!(attempts, 180);
        }
        other => panic!("unexpected error: {other}"),
    }
    // one existence probe, then the whole readiness budget
    assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 181);
}

#[tokio::test]
async fn ready_pods_pass_on_first_probe() {
    let cluster = Arc::new(FakeCluster::with_pods(PodMode::Ready));
    let ready = verifier(&cluster)
        .wait_for_pod_ready(&Build::new("b1"))
        .await
        .unwrap();

    assert!(ready);
    assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn one_failed_image_fails_the_build() {
    let store = Arc::new(InMemoryBuildStore::new());
    let build = Build::new("b1");
    store.upsert_build(build.clone()).await.unwrap();
    let run = store.claim_run("b1").await.unwrap();

    let deploys: Vec<Deploy> = ["api", "web", "jobs"]
        .into_iter()
        .map(|name| {
            let mut d = Deploy::new("b1", name);
            d.deploy_type = DeployType::Docker;
            d
        })
        .collect();
    assert!(store.replace_deploys("b1", &run, deploys.clone()).await.unwrap());

    let coordinator = ImageBuildCoordinator::new(
        Arc::new(ScriptedBuilder::failing(&["web"])),
        store.clone(),
    );
    let outcome = coordinator.build_images(&build, &run, &deploys).await;

    assert_eq!(outcome.results.len(), 3);
    assert!(!outcome.success);
    assert_eq!(outcome.failed(), vec!["web-b1"]);

    let stored = store.get_deploys("b1").await.unwrap();
    let status = |uuid: &str| stored.iter().find(|d| d.uuid == uuid).unwrap().status;
    assert_eq!(status("web-b1"), DeployStatus::BuildFailed);
    assert_eq!(status("api-b1"), DeployStatus::Built);
    assert_eq!(status("jobs-b1"), DeployStatus::Built);
}

#[tokio::test]
async fn inactive_and_unbuildable_deploys_are_skipped() {
    let store = Arc::new(InMemoryBuildStore::new());
    let build = Build::new("b1");
    store.upsert_build(build.clone()).await.unwrap();
    let run = store.claim_run("b1").await.unwrap();

    let mut off = Deploy::new("b1", "off");
    off.active = false;
    let mut external = Deploy::new("b1", "docs");
    external.deploy_type = DeployType::ExternalHttp;

    let builder = Arc::new(ScriptedBuilder::default());
    let coordinator = ImageBuildCoordinator::new(builder.clone(), store);
    let outcome = coordinator.build_images(&build, &run, &[off, external]).await;

    assert!(outcome.results.is_empty());
    assert!(outcome.success);
    assert!(builder.built.lock().unwrap().is_empty());
}
