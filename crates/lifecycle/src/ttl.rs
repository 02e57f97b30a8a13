//! TTL labels for build namespaces.
//!
//! Non-static namespaces carry creation and expiry stamps which the cleanup
//! sweeper reads; static namespaces are marked `lfc/ttl-enable=false` and
//! carry no stamps at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ConfigProvider;
use crate::types::Result;

pub const LABEL_UUID: &str = "lfc/uuid";
pub const LABEL_TTL_ENABLE: &str = "lfc/ttl-enable";
pub const LABEL_CREATED_AT_MILLIS: &str = "lfc/ttl-createdAtUnixMillis";
pub const LABEL_EXPIRE_AT_MILLIS: &str = "lfc/ttl-expireAtUnixMillis";
pub const LABEL_CREATED_AT: &str = "lfc/ttl-createdAt";
pub const LABEL_EXPIRE_AT: &str = "lfc/ttl-expireAt";

const MILLIS_PER_DAY: i64 = 86_400_000;

const STAMP_LABELS: [&str; 4] = [
    LABEL_CREATED_AT_MILLIS,
    LABEL_EXPIRE_AT_MILLIS,
    LABEL_CREATED_AT,
    LABEL_EXPIRE_AT,
];

#[derive(Debug, Clone)]
pub struct TtlRequest<'a> {
    pub namespace: &'a str,
    pub build_uuid: &'a str,
    pub static_env: bool,
    pub ttl: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlLabels {
    pub labels: BTreeMap<String, String>,
    pub log_message: String,
}

impl TtlLabels {
    #[must_use]
    pub fn is_expiring(&self) -> bool {
        self.labels.get(LABEL_TTL_ENABLE).is_some_and(|v| v == "true")
    }
}

/// Labels with an explicit inactivity window; `None` disables expiry.
#[must_use]
pub fn ttl_labels_at(
    request: &TtlRequest<'_>,
    inactivity_days: Option<u32>,
    now: DateTime<Utc>,
) -> TtlLabels {
    let mut labels = BTreeMap::from([(LABEL_UUID.to_string(), request.build_uuid.to_string())]);

    let days = match inactivity_days {
        Some(days) if !request.static_env && request.ttl => days,
        _ => {
            labels.insert(LABEL_TTL_ENABLE.to_string(), "false".to_string());
            let reason = if request.static_env { "static" } else { "ttl disabled" };
            return TtlLabels {
                labels,
                log_message: format!("Namespace {} exempt from TTL ({reason})", request.namespace),
            };
        }
    };

    let created_ms = now.timestamp_millis();
    let expire_ms = created_ms + i64::from(days) * MILLIS_PER_DAY;
    let expire_at = now + Duration::milliseconds(i64::from(days) * MILLIS_PER_DAY);

    labels.insert(LABEL_TTL_ENABLE.to_string(), "true".to_string());
    labels.insert(LABEL_CREATED_AT_MILLIS.to_string(), created_ms.to_string());
    labels.insert(LABEL_EXPIRE_AT_MILLIS.to_string(), expire_ms.to_string());
    labels.insert(
        LABEL_CREATED_AT.to_string(),
        now.format("%Y-%m-%d").to_string(),
    );
    labels.insert(
        LABEL_EXPIRE_AT.to_string(),
        expire_at.format("%Y-%m-%d").to_string(),
    );

    TtlLabels {
        labels,
        log_message: format!(
            "Namespace {} expires after {days} days of inactivity ({})",
            request.namespace,
            expire_at.format("%Y-%m-%d")
        ),
    }
}

/// JSON Patch setting every label of `labels` on an object that currently
/// carries `current`. Expiry stamps absent from `labels` are removed.
pub fn ttl_patch_from_labels(
    labels: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Result<json_patch::Patch> {
    let removals = STAMP_LABELS
        .iter()
        .filter(|key| current.contains_key(**key) && !labels.contains_key(**key))
        .map(|key| {
            json!({
                "op": "remove",
                "path": format!("/metadata/labels/{}", escape_pointer(key)),
            })
        });
    let ops: Vec<Value> = labels
        .iter()
        .map(|(key, value)| {
            json!({
                "op": "add",
                "path": format!("/metadata/labels/{}", escape_pointer(key)),
                "value": value,
            })
        })
        .chain(removals)
        .collect();
    Ok(serde_json::from_value(Value::Array(ops))?)
}

/// RFC 6901 escaping of a single reference token.
fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

pub struct TtlLabeler {
    config: Arc<dyn ConfigProvider>,
}

impl TtlLabeler {
    #[must_use]
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        Self { config }
    }

    /// Fetches the inactivity window only when the namespace expires.
    pub async fn generate_ttl_labels(
        &self,
        request: &TtlRequest<'_>,
        now: DateTime<Utc>,
    ) -> TtlLabels {
        let days = if request.static_env || !request.ttl {
            None
        } else {
            let config = self.config.fetch_or_default().await;
            config.ttl.enabled.then_some(config.ttl.inactivity_days)
        };
        let result = ttl_labels_at(request, days, now);
        debug!(namespace = %request.namespace, "{}", result.log_message);
        result
    }

    /// Patch refreshing the labels of a namespace currently labelled `current`.
    pub async fn generate_ttl_patch(
        &self,
        request: &TtlRequest<'_>,
        current: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<json_patch::Patch> {
        let labels = self.generate_ttl_labels(request, now).await;
        ttl_patch_from_labels(&labels.labels, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(static_env: bool, ttl: bool) -> TtlRequest<'static> {
        TtlRequest {
            namespace: "env-b1",
            build_uuid: "b1",
            static_env,
            ttl,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn static_env_never_expires() {
        for ttl in [true, false] {
            let labels = ttl_labels_at(&request(true, ttl), Some(14), now());
            assert_eq!(labels.labels[LABEL_TTL_ENABLE], "false");
            assert_eq!(labels.labels[LABEL_UUID], "b1");
            assert!(!labels.labels.contains_key(LABEL_EXPIRE_AT_MILLIS));
            assert!(!labels.labels.contains_key(LABEL_EXPIRE_AT));
            assert!(!labels.is_expiring());
        }
    }

    #[test]
    fn expiring_namespace_gets_all_stamps() {
        let labels = ttl_labels_at(&request(false, true), Some(14), now());
        let created = now().timestamp_millis();

        assert_eq!(labels.labels[LABEL_TTL_ENABLE], "true");
        assert_eq!(labels.labels[LABEL_CREATED_AT_MILLIS], created.to_string());
        assert_eq!(
            labels.labels[LABEL_EXPIRE_AT_MILLIS],
            (created + 14 * MILLIS_PER_DAY).to_string()
        );
        assert_eq!(labels.labels[LABEL_CREATED_AT], "2025-03-01");
        assert_eq!(labels.labels[LABEL_EXPIRE_AT], "2025-03-15");
        assert!(labels.labels.values().all(|v| !v.is_empty()));
    }

    #[test]
    fn patch_escapes_label_keys() {
        let labels = ttl_labels_at(&request(true, true), None, now());
        let patch = ttl_patch_from_labels(&labels.labels, &BTreeMap::new()).unwrap();
        let value = serde_json::to_value(&patch).unwrap();
        let paths: Vec<&str> = value
            .as_array()
            .unwrap()
            .iter()
            .map(|op| op["path"].as_str().unwrap())
            .collect();
        assert_eq!(
            paths,
            vec!["/metadata/labels/lfc~1ttl-enable", "/metadata/labels/lfc~1uuid"]
        );
    }

    #[test]
    fn disabling_ttl_removes_stale_stamps() {
        let current = ttl_labels_at(&request(false, true), Some(14), now()).labels;
        let disabled = ttl_labels_at(&request(false, false), Some(14), now());
        let patch = ttl_patch_from_labels(&disabled.labels, &current).unwrap();
        let value = serde_json::to_value(&patch).unwrap();
        let removed: Vec<&str> = value
            .as_array()
            .unwrap()
            .iter()
            .filter(|op| op["op"] == "remove")
            .map(|op| op["path"].as_str().unwrap())
            .collect();
        assert_eq!(removed.len(), 4);
        assert!(removed.contains(&"/metadata/labels/lfc~1ttl-expireAt"));
        assert!(removed.contains(&"/metadata/labels/lfc~1ttl-expireAtUnixMillis"));
    }
}
