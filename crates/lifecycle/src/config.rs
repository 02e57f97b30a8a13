//! Lifecycle Configuration
//!
//! Global configuration for the orchestrator: TTL policy, service account,
//! default resources, node pools, domains and rollout budgets. Loaded from a
//! mounted file or ConfigMap and served to components through
//! [`ConfigProvider`], which degrades to compiled defaults when a fetch fails.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::Api, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::rollout::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleConfig {
    /// Namespace TTL policy
    #[serde(default)]
    pub ttl: TtlConfig,

    /// Service account provisioned into every build namespace
    #[serde(default)]
    pub service_account: ServiceAccountConfig,

    /// Resources applied when a service omits them
    #[serde(default)]
    pub resources: DefaultResources,

    /// Node pool labels used for affinity
    #[serde(default)]
    pub node_pools: NodePoolConfig,

    /// Base domains for public addresses and dashboard links
    #[serde(default)]
    pub domains: DomainConfig,

    /// Readiness polling budgets
    #[serde(default)]
    pub rollout: RolloutConfig,

    /// Datadog unified service tagging
    #[serde(default)]
    pub datadog: DatadogConfig,

    /// Image registry and build service
    #[serde(default)]
    pub images: ImagesConfig,
}

/// TTL configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Days of inactivity before a namespace expires
    #[serde(default = "default_inactivity_days")]
    pub inactivity_days: u32,
}

fn default_true() -> bool {
    true
}

/// Compiled fallback used when the inactivity window cannot be fetched.
pub const DEFAULT_INACTIVITY_DAYS: u32 = 14;

fn default_inactivity_days() -> u32 {
    DEFAULT_INACTIVITY_DAYS
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inactivity_days: DEFAULT_INACTIVITY_DAYS,
        }
    }
}

/// Service account configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountConfig {
    #[serde(default = "default_service_account_name")]
    pub name: String,

    /// Cloud IAM role ARN annotated onto the account
    #[serde(default)]
    pub role_arn: Option<String>,

    /// How long to wait for the cluster-provisioned `default` account
    #[serde(default = "default_sa_ready_timeout")]
    pub ready_timeout_seconds: u64,

    #[serde(default = "default_sa_poll_interval")]
    pub poll_interval_seconds: u64,
}

pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

fn default_service_account_name() -> String {
    DEFAULT_SERVICE_ACCOUNT.to_string()
}

fn default_sa_ready_timeout() -> u64 {
    60
}

fn default_sa_poll_interval() -> u64 {
    2
}

impl Default for ServiceAccountConfig {
    fn default() -> Self {
        Self {
            name: default_service_account_name(),
            role_arn: None,
            ready_timeout_seconds: default_sa_ready_timeout(),
            poll_interval_seconds: default_sa_poll_interval(),
        }
    }
}

impl ServiceAccountConfig {
    #[must_use]
    pub fn is_default_account(&self) -> bool {
        self.name == DEFAULT_SERVICE_ACCOUNT
    }

    /// Polling budget while waiting for the default account to appear.
    #[must_use]
    pub fn ready_policy(&self) -> RetryPolicy {
        let interval = self.poll_interval_seconds.max(1);
        let attempts = (self.ready_timeout_seconds / interval).max(1);
        RetryPolicy::new(
            Duration::from_secs(interval),
            u32::try_from(attempts).unwrap_or(u32::MAX),
        )
    }
}

/// Default container resources
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultResources {
    pub cpu_request: String,
    pub cpu_limit: Option<String>,
    pub memory_request: String,
    pub memory_limit: Option<String>,
}

impl Default for DefaultResources {
    fn default() -> Self {
        Self {
            cpu_request: "10m".to_string(),
            cpu_limit: None,
            memory_request: "100Mi".to_string(),
            memory_limit: Some("2Gi".to_string()),
        }
    }
}

/// Node pool labels
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolConfig {
    /// Node label carrying the capacity type (`SPOT` / `ON_DEMAND`)
    #[serde(default = "default_capacity_label")]
    pub capacity_type_label: String,

    /// Node label key/value pinning static environments to their pool
    #[serde(default = "default_static_label_key")]
    pub static_env_label_key: String,

    #[serde(default = "default_static_label_value")]
    pub static_env_label_value: String,
}

fn default_capacity_label() -> String {
    "eks.amazonaws.com/capacityType".to_string()
}

fn default_static_label_key() -> String {
    "app-long".to_string()
}

fn default_static_label_value() -> String {
    "deployments-m7".to_string()
}

impl Default for NodePoolConfig {
    fn default() -> Self {
        Self {
            capacity_type_label: default_capacity_label(),
            static_env_label_key: default_static_label_key(),
            static_env_label_value: default_static_label_value(),
        }
    }
}

/// Domains
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    pub http: String,
    pub grpc: String,
    pub dashboard_url: String,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            http: "lifecycle.example.com".to_string(),
            grpc: "grpc.lifecycle.example.com".to_string(),
            dashboard_url: "https://lifecycle.example.com".to_string(),
        }
    }
}

/// Rollout polling budgets
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutConfig {
    #[serde(default = "default_rollout_interval")]
    pub interval_seconds: u64,

    /// Attempts waiting for any pod to exist (60 × 5s = 5 minutes)
    #[serde(default = "default_exists_attempts")]
    pub exists_attempts: u32,

    /// Attempts waiting for all pods to be ready (180 × 5s = 15 minutes)
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
}

fn default_rollout_interval() -> u64 {
    5
}

fn default_exists_attempts() -> u32 {
    60
}

fn default_ready_attempts() -> u32 {
    180
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_rollout_interval(),
            exists_attempts: default_exists_attempts(),
            ready_attempts: default_ready_attempts(),
        }
    }
}

impl RolloutConfig {
    #[must_use]
    pub fn exists_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.interval_seconds), self.exists_attempts)
    }

    #[must_use]
    pub fn ready_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.interval_seconds), self.ready_attempts)
    }
}

/// Datadog tagging
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatadogConfig {
    /// Value injected as `DD_ENV`
    #[serde(default = "default_dd_env")]
    pub env: String,
}

fn default_dd_env() -> String {
    "lifecycle".to_string()
}

impl Default for DatadogConfig {
    fn default() -> Self {
        Self {
            env: default_dd_env(),
        }
    }
}

/// Image registry and build service
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesConfig {
    /// Registry that built images are pushed to
    #[serde(default = "default_registry")]
    pub registry: String,

    /// External build service; without one only prebuilt images deploy
    #[serde(default)]
    pub build_service_url: Option<String>,

    #[serde(default = "default_build_timeout")]
    pub build_timeout_seconds: u64,
}

fn default_registry() -> String {
    "registry.lifecycle.local".to_string()
}

fn default_build_timeout() -> u64 {
    1800
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            build_service_url: None,
            build_timeout_seconds: default_build_timeout(),
        }
    }
}

impl LifecycleConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.service_account.name.trim().is_empty() {
            return Err(anyhow::anyhow!("serviceAccount.name must not be empty"));
        }

        if self.ttl.enabled && self.ttl.inactivity_days == 0 {
            return Err(anyhow::anyhow!(
                "ttl.inactivityDays must be at least 1 when TTL is enabled"
            ));
        }

        for (field, domain) in [
            ("domains.http", &self.domains.http),
            ("domains.grpc", &self.domains.grpc),
        ] {
            if domain.is_empty() || domain.contains("://") || domain.contains('/') {
                return Err(anyhow::anyhow!(
                    "{field} must be a bare host name, got '{domain}'"
                ));
            }
        }

        if self.images.registry.trim().is_empty() {
            return Err(anyhow::anyhow!("images.registry must not be empty"));
        }

        if self.rollout.exists_attempts == 0 || self.rollout.ready_attempts == 0 {
            return Err(anyhow::anyhow!("rollout attempt budgets must be positive"));
        }

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Load configuration from a `ConfigMap`
    pub async fn from_configmap(
        client: &Client,
        namespace: &str,
        name: &str,
    ) -> Result<Self, anyhow::Error> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = api.get(name).await?;
        Self::from_configmap_data(&cm)
    }

    /// Parse and validate the `config.yaml` key of a fetched `ConfigMap`
    pub fn from_configmap_data(cm: &ConfigMap) -> Result<Self, anyhow::Error> {
        let config_str = cm
            .data
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("ConfigMap has no data"))?
            .get("config.yaml")
            .ok_or_else(|| anyhow::anyhow!("ConfigMap missing config.yaml"))?;

        let config: Self = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }
}

/// Source of the global configuration.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn fetch(&self) -> Result<LifecycleConfig, anyhow::Error>;

    /// Fetch, falling back to compiled defaults on failure.
    async fn fetch_or_default(&self) -> LifecycleConfig {
        match self.fetch().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Failed to fetch global config, using defaults");
                LifecycleConfig::default()
            }
        }
    }
}

/// Fixed configuration, loaded once at startup.
pub struct StaticConfigProvider {
    config: LifecycleConfig,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn fetch(&self) -> Result<LifecycleConfig, anyhow::Error> {
        Ok(self.config.clone())
    }
}

/// Re-reads a `ConfigMap` on every fetch so edits apply without restarts.
pub struct ConfigMapProvider {
    client: Client,
    namespace: String,
    name: String,
}

impl ConfigMapProvider {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ConfigProvider for ConfigMapProvider {
    async fn fetch(&self) -> Result<LifecycleConfig, anyhow::Error> {
        LifecycleConfig::from_configmap(&self.client, &self.namespace, &self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FailingProvider;

    #[async_trait]
    impl ConfigProvider for FailingProvider {
        async fn fetch(&self) -> Result<LifecycleConfig, anyhow::Error> {
            Err(anyhow::anyhow!("config service unavailable"))
        }
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
ttl:
  enabled: true
  inactivityDays: 7

serviceAccount:
  name: "lifecycle-app"
  roleArn: "arn:aws:iam::123456789012:role/lifecycle"

nodePools:
  capacityTypeLabel: "karpenter.sh/capacity-type"

domains:
  http: "lfc.dev"
  grpc: "grpc.lfc.dev"
  dashboardUrl: "https://ui.lfc.dev"

rollout:
  intervalSeconds: 2
"#;

        let config: LifecycleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ttl.inactivity_days, 7);
        assert_eq!(config.service_account.name, "lifecycle-app");
        assert!(!config.service_account.is_default_account());
        assert_eq!(
            config.node_pools.capacity_type_label,
            "karpenter.sh/capacity-type"
        );
        assert_eq!(config.node_pools.static_env_label_key, "app-long");
        assert_eq!(config.rollout.interval_seconds, 2);
        assert_eq!(config.rollout.exists_attempts, 60);
        assert_eq!(config.rollout.ready_attempts, 180);
        assert_eq!(config.resources, DefaultResources::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = LifecycleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ttl.inactivity_days, DEFAULT_INACTIVITY_DAYS);
        assert!(config.service_account.is_default_account());
        assert_eq!(config.rollout.exists_policy().max_attempts, 60);
        assert_eq!(
            config.rollout.ready_policy().interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn validate_rejects_scheme_in_domain() {
        let mut config = LifecycleConfig::default();
        config.domains.http = "https://lfc.dev".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_ttl_window() {
        let mut config = LifecycleConfig::default();
        config.ttl.inactivity_days = 0;
        assert!(config.validate().is_err());
        config.ttl.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn service_account_policy_covers_timeout() {
        let sa = ServiceAccountConfig {
            ready_timeout_seconds: 30,
            poll_interval_seconds: 3,
            ..ServiceAccountConfig::default()
        };
        let policy = sa.ready_policy();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.interval, Duration::from_secs(3));
    }

    #[test]
    fn loads_from_mounted_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ttl:\n  inactivityDays: 3").unwrap();
        let config = LifecycleConfig::from_mounted_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.ttl.inactivity_days, 3);
        assert!(LifecycleConfig::from_mounted_file("/nonexistent/config.yaml").is_err());
    }

    fn configmap(yaml: &str) -> ConfigMap {
        ConfigMap {
            data: Some([("config.yaml".to_string(), yaml.to_string())].into()),
            ..ConfigMap::default()
        }
    }

    /// Serves a fixed `ConfigMap` the way `ConfigMapProvider` serves a fetched one.
    struct FixedConfigMap(ConfigMap);

    #[async_trait]
    impl ConfigProvider for FixedConfigMap {
        async fn fetch(&self) -> Result<LifecycleConfig, anyhow::Error> {
            LifecycleConfig::from_configmap_data(&self.0)
        }
    }

    #[tokio::test]
    async fn invalid_configmap_falls_back_to_defaults() {
        let cm = configmap("rollout:\n  existsAttempts: 0\n  readyAttempts: 0");
        assert!(LifecycleConfig::from_configmap_data(&cm).is_err());

        let config = FixedConfigMap(cm).fetch_or_default().await;
        assert_eq!(config, LifecycleConfig::default());
        assert_eq!(config.rollout.exists_attempts, 60);
    }

    #[tokio::test]
    async fn valid_configmap_is_used() {
        let provider = FixedConfigMap(configmap("ttl:\n  inactivityDays: 3"));
        assert_eq!(provider.fetch_or_default().await.ttl.inactivity_days, 3);
        assert!(LifecycleConfig::from_configmap_data(&ConfigMap::default()).is_err());
    }

    #[tokio::test]
    async fn fetch_or_default_degrades_on_failure() {
        let config = FailingProvider.fetch_or_default().await;
        assert_eq!(config, LifecycleConfig::default());
    }
}
