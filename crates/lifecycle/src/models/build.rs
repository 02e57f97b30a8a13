//! Build: one pull request × environment instantiation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a build.
///
/// `Queued → Building → Built → Deploying → Deployed | Error | ConfigError`,
/// and independently `TearingDown → TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Queued,
    Building,
    Built,
    Deploying,
    Deployed,
    Error,
    ConfigError,
    TearingDown,
    TornDown,
}

impl BuildStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Built => "built",
            Self::Deploying => "deploying",
            Self::Deployed => "deployed",
            Self::Error => "error",
            Self::ConfigError => "config_error",
            Self::TearingDown => "tearing_down",
            Self::TornDown => "torn_down",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Deployed | Self::Error | Self::ConfigError | Self::TornDown
        )
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::ConfigError)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node capacity type requested for a build's workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityType {
    #[default]
    OnDemand,
    Spot,
}

impl CapacityType {
    /// Value used on node labels (`eks.amazonaws.com/capacityType`).
    #[must_use]
    pub const fn label_value(&self) -> &'static str {
        match self {
            Self::OnDemand => "ON_DEMAND",
            Self::Spot => "SPOT",
        }
    }
}

fn default_ttl() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub uuid: String,

    #[serde(default)]
    pub status: BuildStatus,

    /// Failure detail or progress note for the current status
    #[serde(default)]
    pub status_message: Option<String>,

    /// Always `env-<uuid>`
    pub namespace: String,

    /// Last generated manifest bundle
    #[serde(default)]
    pub manifest: Option<String>,

    /// Ownership token of the run currently allowed to commit
    #[serde(default)]
    pub run_uuid: Option<String>,

    /// Read service specs from `deploy.deployable` instead of `deploy.service`
    #[serde(default)]
    pub enable_full_yaml: bool,

    /// Static environments are exempt from TTL and never patched in place
    #[serde(default)]
    pub is_static: bool,

    #[serde(default = "default_ttl")]
    pub ttl: bool,

    #[serde(default)]
    pub capacity_type: CapacityType,

    #[serde(default)]
    pub dependency_graph: Option<serde_json::Value>,

    #[serde(default)]
    pub dashboard_links: BTreeMap<String, String>,

    /// `owner/repo#number`
    #[serde(default)]
    pub pull_request: Option<String>,

    #[serde(default)]
    pub sha: Option<String>,
}

impl Build {
    #[must_use]
    pub fn new(uuid: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self {
            namespace: namespace_for(&uuid),
            uuid,
            status: BuildStatus::Queued,
            status_message: None,
            manifest: None,
            run_uuid: None,
            enable_full_yaml: true,
            is_static: false,
            ttl: true,
            capacity_type: CapacityType::OnDemand,
            dependency_graph: None,
            dashboard_links: BTreeMap::new(),
            pull_request: None,
            sha: None,
        }
    }

    /// Whether `run_uuid` is the token currently stored on this build.
    #[must_use]
    pub fn is_owned_by(&self, run_uuid: &str) -> bool {
        self.run_uuid.as_deref() == Some(run_uuid)
    }
}

/// Namespace owned by a build.
#[must_use]
pub fn namespace_for(build_uuid: &str) -> String {
    format!("env-{build_uuid}")
}
