/*
 * Lifecycle - Ephemeral Pull Request Environments on Kubernetes
 * Copyright (C) 2025 Lifecycle team
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Lifecycle Worker - build/deploy orchestrator for pull request environments
//!
//! - `serve`: runs the job workers and an HTTP API that registers builds and
//!   enqueues deploy/teardown jobs
//! - `render`: prints the manifest bundle for a build without touching a cluster

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use lifecycle::cluster::KubeCluster;
use lifecycle::config::{
    ConfigMapProvider, ConfigProvider, LifecycleConfig, StaticConfigProvider,
};
use lifecycle::declarative::InlineConfigSource;
use lifecycle::images::{ImageBuilder, PrebuiltImageBuilder, RemoteImageBuilder};
use lifecycle::manifest::{generate_manifest, ManifestInput};
use lifecycle::queue::{run_workers, ChannelQueue, Dispatcher, JobQueue, LifecycleJob};
use lifecycle::store::{BuildStore, InMemoryBuildStore};
use lifecycle::{Build, BuildController, CapacityType, ControllerDeps, Deploy};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Parser)]
#[command(name = "lifecycle-worker", version, about = "Pull request environment orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the job workers and HTTP API
    Serve {
        #[arg(long, env = "LIFECYCLE_LISTEN", default_value = "0.0.0.0:8080")]
        listen: String,

        /// Jobs processed concurrently
        #[arg(long, env = "LIFECYCLE_WORKERS", default_value_t = 8)]
        workers: usize,

        /// Read configuration from this ConfigMap on every run instead of the mounted file
        #[arg(long, env = "LIFECYCLE_CONFIGMAP")]
        configmap: Option<String>,

        #[arg(long, env = "LIFECYCLE_NAMESPACE", default_value = "lifecycle")]
        namespace: String,
    },
    /// Print the manifest bundle for a build
    Render {
        /// YAML file holding `build`, `deploys` and optionally `serviceAccount`
        #[arg(long)]
        input: PathBuf,

        /// Fixed clock for reproducible output (RFC 3339)
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderInput {
    build: Build,
    #[serde(default)]
    deploys: Vec<Deploy>,
    #[serde(default)]
    service_account: Option<String>,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn BuildStore>,
    source: Arc<InlineConfigSource>,
    queue: Arc<dyn JobQueue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBuildRequest {
    uuid: String,
    lifecycle_yaml: String,
    #[serde(default = "default_true")]
    deploy: bool,
    #[serde(default)]
    is_static: bool,
    #[serde(default = "default_true")]
    ttl: bool,
    #[serde(default = "default_true")]
    enable_full_yaml: bool,
    #[serde(default)]
    capacity_type: CapacityType,
    #[serde(default)]
    pull_request: Option<String>,
    #[serde(default)]
    sha: Option<String>,
}

fn default_true() -> bool {
    true
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lifecycle=debug".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn load_lifecycle_config() -> LifecycleConfig {
    let override_path = std::env::var("LIFECYCLE_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    match LifecycleConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded lifecycle configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            LifecycleConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    match Cli::parse().command {
        Command::Serve {
            listen,
            workers,
            configmap,
            namespace,
        } => serve(&listen, workers, configmap.as_deref(), &namespace).await,
        Command::Render { input, now } => render(&input, now),
    }
}

fn render(input: &Path, now: Option<DateTime<Utc>>) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let input: RenderInput = serde_yaml::from_str(&text).context("Failed to parse render input")?;
    let config = load_lifecycle_config();

    let bundle = generate_manifest(&ManifestInput {
        build: &input.build,
        deploys: &input.deploys,
        namespace: &input.build.namespace,
        service_account: input
            .service_account
            .as_deref()
            .unwrap_or(&config.service_account.name),
        config: &config,
        now: now.unwrap_or_else(Utc::now),
    })?;
    print!("{bundle}");
    Ok(())
}

async fn serve(
    listen: &str,
    workers: usize,
    configmap: Option<&str>,
    namespace: &str,
) -> anyhow::Result<()> {
    info!(
        "Starting Lifecycle Worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let config_provider: Arc<dyn ConfigProvider> = match configmap {
        Some(name) => {
            info!(configmap = %name, namespace = %namespace, "Reading configuration from ConfigMap");
            Arc::new(ConfigMapProvider::new(client.clone(), namespace, name))
        }
        None => {
            let config = load_lifecycle_config();
            config.validate()?;
            Arc::new(StaticConfigProvider::new(config))
        }
    };

    let startup_config = config_provider.fetch_or_default().await;
    let builder: Arc<dyn ImageBuilder> = match startup_config.images.build_service_url.as_deref() {
        Some(url) => {
            info!(url = %url, "Using remote build service");
            Arc::new(RemoteImageBuilder::new(
                url,
                Duration::from_secs(startup_config.images.build_timeout_seconds),
            )?)
        }
        None => {
            warn!("No build service configured, only prebuilt images will deploy");
            Arc::new(PrebuiltImageBuilder)
        }
    };

    let store: Arc<dyn BuildStore> = Arc::new(InMemoryBuildStore::new());
    let source = Arc::new(InlineConfigSource::new());
    let (queue, jobs) = ChannelQueue::new(1024);
    let queue: Arc<dyn JobQueue> = Arc::new(queue);

    let controller = Arc::new(BuildController::new(ControllerDeps {
        store: store.clone(),
        cluster: Arc::new(KubeCluster::new(client)),
        builder,
        config: config_provider,
        source: source.clone(),
        queue: queue.clone(),
    }));

    let dispatcher = Arc::new(Dispatcher::new(
        controller.clone(),
        Arc::new(notify::Notifier::from_env()),
    ));
    let workers_handle = tokio::spawn(run_workers(jobs, dispatcher, workers));

    let state = AppState {
        store,
        source,
        queue,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/builds", post(create_build))
        .route("/builds/{uuid}", get(get_build))
        .route("/builds/{uuid}/deploy", post(deploy_build))
        .route("/builds/{uuid}/teardown", post(teardown_build))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Lifecycle HTTP server listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    workers_handle.abort();
    info!("Lifecycle worker stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "lifecycle-worker",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "lifecycle-worker",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn enqueue(state: &AppState, job: LifecycleJob) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let body = json!({
        "buildUuid": job.build_uuid(),
        "job": job.kind(),
        "correlationId": job.correlation_id(),
    });
    state.queue.enqueue(job).await.map_err(|e| {
        error!(error = %e, "Failed to enqueue job");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok((StatusCode::ACCEPTED, Json(body)))
}

async fn build_exists(state: &AppState, uuid: &str) -> Result<(), StatusCode> {
    match state.store.get_build(uuid).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(build_uuid = %uuid, error = %e, "Failed to load build");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn create_build(
    State(state): State<AppState>,
    Json(request): Json<CreateBuildRequest>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let mut build = Build::new(request.uuid.as_str());
    build.is_static = request.is_static;
    build.ttl = request.ttl;
    build.enable_full_yaml = request.enable_full_yaml;
    build.capacity_type = request.capacity_type;
    build.pull_request = request.pull_request;
    build.sha = request.sha;

    state.store.upsert_build(build).await.map_err(|e| {
        error!(build_uuid = %request.uuid, error = %e, "Failed to register build");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    state.source.set(&request.uuid, request.lifecycle_yaml);

    let job = if request.deploy {
        LifecycleJob::resolve_and_deploy(&request.uuid)
    } else {
        LifecycleJob::build(&request.uuid)
    };
    enqueue(&state, job).await
}

async fn get_build(
    State(state): State<AppState>,
    UrlPath(uuid): UrlPath<String>,
) -> Result<Json<Value>, StatusCode> {
    let build = state
        .store
        .get_build(&uuid)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let deploys = state
        .store
        .get_deploys(&uuid)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "build": build, "deploys": deploys })))
}

async fn deploy_build(
    State(state): State<AppState>,
    UrlPath(uuid): UrlPath<String>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    build_exists(&state, &uuid).await?;
    enqueue(&state, LifecycleJob::resolve_and_deploy(&uuid)).await
}

async fn teardown_build(
    State(state): State<AppState>,
    UrlPath(uuid): UrlPath<String>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    build_exists(&state, &uuid).await?;
    enqueue(&state, LifecycleJob::delete(&uuid)).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
