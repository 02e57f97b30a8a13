//! Notification event types for environment build lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Severity levels for alerts and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
}

impl Severity {
    /// Get the attachment color for this severity.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",     // Blue
            Self::Warning => "#f39c12", // Orange
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
        }
    }
}

/// Events that can trigger notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// A build committed a status transition
    BuildStatusChanged {
        build_uuid: String,
        namespace: String,
        status: String,
        /// Whether the new status is a failure (`error` / `config_error`)
        failed: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        pull_request: Option<String>,
        #[serde(default)]
        links: BTreeMap<String, String>,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },

    /// A build's namespace was removed
    BuildTornDown {
        build_uuid: String,
        namespace: String,
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Get a short title for this event type.
    #[must_use]
    pub fn title(&self) -> String {
        match self {
            Self::BuildStatusChanged {
                build_uuid, status, ..
            } => format!("Build {build_uuid}: {status}"),
            Self::BuildTornDown { build_uuid, .. } => format!("Build {build_uuid} torn down"),
        }
    }

    /// Get the severity/color for this event.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::BuildStatusChanged { failed, .. } => {
                if *failed {
                    Severity::Warning
                } else {
                    Severity::Info
                }
            }
            Self::BuildTornDown { .. } => Severity::Info,
        }
    }

    /// Get the build this event belongs to.
    #[must_use]
    pub fn build_uuid(&self) -> &str {
        match self {
            Self::BuildStatusChanged { build_uuid, .. } | Self::BuildTornDown { build_uuid, .. } => {
                build_uuid
            }
        }
    }

    /// Get the timestamp for this event.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::BuildStatusChanged { timestamp, .. } | Self::BuildTornDown { timestamp, .. } => {
                *timestamp
            }
        }
    }
}
