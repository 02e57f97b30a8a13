//! Rollout verification.
//!
//! Readiness is checked in two phases against pods selected by label:
//! first until any pod exists, then until every non-Helm pod reports the
//! `Ready` condition. Both phases are bounded by a [`RetryPolicy`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::config::RolloutConfig;
use crate::models::{Build, Deploy};
use crate::types::{Error, Result};

/// Label marking pods owned by a Helm release.
const HELM_MANAGED_BY: (&str, &str) = ("app.kubernetes.io/managed-by", "Helm");

/// Fixed-interval, fixed-budget retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

/// Result of a single probe, and of a whole polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Ready(T),
    NotYetReady,
    TimedOut { attempts: u32 },
}

/// Call `probe` until it reports [`PollStatus::Ready`] or the budget runs out.
///
/// Sleeps `interval` between attempts, never after the last one, so a loop
/// that never succeeds calls `probe` exactly `max_attempts` times. Probe
/// errors abort the loop.
pub async fn poll_until<T, F, Fut>(policy: RetryPolicy, mut probe: F) -> Result<PollStatus<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>>>,
{
    for attempt in 1..=policy.max_attempts {
        if let PollStatus::Ready(value) = probe(attempt).await? {
            return Ok(PollStatus::Ready(value));
        }
        if attempt < policy.max_attempts && !policy.interval.is_zero() {
            tokio::time::sleep(policy.interval).await;
        }
    }
    Ok(PollStatus::TimedOut {
        attempts: policy.max_attempts,
    })
}

fn is_helm_managed(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(HELM_MANAGED_BY.0))
        .is_some_and(|v| v == HELM_MANAGED_BY.1)
}

/// Whether a pod carries `Ready=True`.
#[must_use]
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Every non-Helm pod is ready. Vacuously true when only Helm pods match.
#[must_use]
pub fn all_ready(pods: &[Pod]) -> bool {
    pods.iter()
        .filter(|pod| !is_helm_managed(pod))
        .all(is_pod_ready)
}

pub struct RolloutVerifier {
    cluster: Arc<dyn ClusterClient>,
    exists: RetryPolicy,
    ready: RetryPolicy,
}

impl RolloutVerifier {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &RolloutConfig) -> Self {
        Self::with_policies(cluster, config.exists_policy(), config.ready_policy())
    }

    #[must_use]
    pub fn with_policies(
        cluster: Arc<dyn ClusterClient>,
        exists: RetryPolicy,
        ready: RetryPolicy,
    ) -> Self {
        Self {
            cluster,
            exists,
            ready,
        }
    }

    /// Wait for every pod of a build.
    pub async fn wait_for_pod_ready(&self, build: &Build) -> Result<bool> {
        let selector = format!("lc_uuid={}", build.uuid);
        self.wait(&build.namespace, &selector).await
    }

    /// Wait for the pods of a single deploy.
    pub async fn wait_for_deploy_pod_ready(&self, namespace: &str, deploy: &Deploy) -> Result<bool> {
        let selector = format!("deploy_uuid={}", deploy.uuid);
        self.wait(namespace, &selector).await
    }

    /// `Ok(false)` when no pod appeared within the existence budget,
    /// `Err(ReadinessTimeout)` when pods never all became ready.
    #[instrument(skip(self), fields(namespace = %namespace, selector = %selector))]
    async fn wait(&self, namespace: &str, selector: &str) -> Result<bool> {
        let exists = poll_until(self.exists, |attempt| async move {
            let pods = self.cluster.list_pods(namespace, selector).await?;
            if pods.is_empty() {
                debug!(attempt, "No pods scheduled yet");
                Ok(PollStatus::NotYetReady)
            } else {
                Ok(PollStatus::Ready(pods.len()))
            }
        })
        .await?;

        match exists {
            PollStatus::Ready(count) => debug!(pods = count, "Pods exist"),
            PollStatus::TimedOut { attempts } => {
                warn!(attempts, "No pods appeared for selector, skipping readiness wait");
                return Ok(false);
            }
            PollStatus::NotYetReady => return Ok(false),
        }

        let ready = poll_until(self.ready, |attempt| async move {
            let pods = self.cluster.list_pods(namespace, selector).await?;
            if all_ready(&pods) {
                Ok(PollStatus::Ready(()))
            } else {
                let pending = pods
                    .iter()
                    .filter(|p| !is_helm_managed(p) && !is_pod_ready(p))
                    .count();
                debug!(attempt, pending, "Pods not ready yet");
                Ok(PollStatus::NotYetReady)
            }
        })
        .await?;

        match ready {
            PollStatus::Ready(()) => {
                info!("All pods ready");
                Ok(true)
            }
            PollStatus::TimedOut { attempts } => Err(Error::ReadinessTimeout {
                selector: selector.to_string(),
                attempts,
            }),
            PollStatus::NotYetReady => Ok(false),
        }
    }
}
