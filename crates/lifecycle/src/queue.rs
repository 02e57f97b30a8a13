//! Work queue and workers.
//!
//! Each stage of the lifecycle is a separate job carrying its own build uuid
//! and correlation id, so a job can be traced across process boundaries.

use std::sync::Arc;

use async_trait::async_trait;
use notify::{Notifier, NotifyEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::controller::BuildController;
use crate::types::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleJob {
    /// Resolve, build and deploy
    ResolveAndDeploy {
        build_uuid: String,
        correlation_id: String,
    },
    /// Resolve and build only
    Build {
        build_uuid: String,
        correlation_id: String,
    },
    Delete {
        build_uuid: String,
        correlation_id: String,
    },
    Notify {
        event: NotifyEvent,
        correlation_id: String,
    },
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

impl LifecycleJob {
    #[must_use]
    pub fn resolve_and_deploy(build_uuid: &str) -> Self {
        Self::ResolveAndDeploy {
            build_uuid: build_uuid.to_string(),
            correlation_id: correlation_id(),
        }
    }

    #[must_use]
    pub fn build(build_uuid: &str) -> Self {
        Self::Build {
            build_uuid: build_uuid.to_string(),
            correlation_id: correlation_id(),
        }
    }

    #[must_use]
    pub fn delete(build_uuid: &str) -> Self {
        Self::Delete {
            build_uuid: build_uuid.to_string(),
            correlation_id: correlation_id(),
        }
    }

    #[must_use]
    pub fn notify(event: NotifyEvent) -> Self {
        Self::Notify {
            event,
            correlation_id: correlation_id(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResolveAndDeploy { .. } => "resolve_and_deploy",
            Self::Build { .. } => "build",
            Self::Delete { .. } => "delete",
            Self::Notify { .. } => "notify",
        }
    }

    #[must_use]
    pub fn build_uuid(&self) -> &str {
        match self {
            Self::ResolveAndDeploy { build_uuid, .. }
            | Self::Build { build_uuid, .. }
            | Self::Delete { build_uuid, .. } => build_uuid,
            Self::Notify { event, .. } => event.build_uuid(),
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::ResolveAndDeploy { correlation_id, .. }
            | Self::Build { correlation_id, .. }
            | Self::Delete { correlation_id, .. }
            | Self::Notify { correlation_id, .. } => correlation_id,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: LifecycleJob) -> Result<()>;
}

/// In-process queue backed by a bounded tokio channel.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<LifecycleJob>,
}

impl ChannelQueue {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LifecycleJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn enqueue(&self, job: LifecycleJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|e| Error::QueueError(format!("queue closed, dropped {} job", e.0.kind())))
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: LifecycleJob) -> Result<()>;
}

/// Routes lifecycle jobs to the controller and notifications to the notifier.
pub struct Dispatcher {
    controller: Arc<BuildController>,
    notifier: Arc<Notifier>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(controller: Arc<BuildController>, notifier: Arc<Notifier>) -> Self {
        Self {
            controller,
            notifier,
        }
    }
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, job: LifecycleJob) -> Result<()> {
        match job {
            LifecycleJob::ResolveAndDeploy { build_uuid, .. } => {
                self.controller
                    .resolve_and_deploy_build(&build_uuid, true)
                    .await?;
            }
            LifecycleJob::Build { build_uuid, .. } => {
                self.controller
                    .resolve_and_deploy_build(&build_uuid, false)
                    .await?;
            }
            LifecycleJob::Delete { build_uuid, .. } => {
                self.controller.delete_build(&build_uuid).await?;
            }
            LifecycleJob::Notify { event, .. } => self.notifier.notify(event),
        }
        Ok(())
    }
}

/// Consume `rx` until it closes, running at most `concurrency` jobs at once.
pub async fn run_workers(
    mut rx: mpsc::Receiver<LifecycleJob>,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
) {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut in_flight = JoinSet::new();

    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let handler = handler.clone();
        let span = info_span!(
            "job",
            kind = job.kind(),
            build_uuid = %job.build_uuid(),
            correlation_id = %job.correlation_id()
        );

        in_flight.spawn(
            async move {
                info!("Job started");
                match handler.handle(job).await {
                    Ok(()) => info!("Job finished"),
                    Err(e) => error!(error = %e, "Job failed"),
                }
                drop(permit);
            }
            .instrument(span),
        );

        // Reap finished tasks so the set does not grow unbounded
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
    info!("Job queue closed, workers stopped");
}
