//! Secret placeholders in environment maps.
//!
//! A value of the form `{{provider:path}}` or `{{provider:path:key}}` is a
//! reference to an externally managed secret. The external-secrets operator
//! materializes one Kubernetes Secret per service and provider, keyed by the
//! env var name, so the generator emits a `secretKeyRef` instead of a value.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// Kubernetes object names are DNS labels.
const MAX_NAME_LEN: usize = 63;

static SECRET_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{\{\s*([a-zA-Z][a-zA-Z0-9_-]*):([^:{}\s]+)(?::([^:{}\s]+))?\s*\}\}$")
        .expect("valid secret placeholder regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub env_key: String,
    pub provider: String,
    pub path: String,
    pub key: Option<String>,
}

/// Parse a single placeholder value.
#[must_use]
fn parse_secret_placeholder(env_key: &str, value: &str) -> Option<SecretRef> {
    let caps = SECRET_PLACEHOLDER.captures(value.trim())?;
    Some(SecretRef {
        env_key: env_key.to_string(),
        provider: caps[1].to_lowercase(),
        path: caps[2].to_string(),
        key: caps.get(3).map(|m| m.as_str().to_string()),
    })
}

#[must_use]
pub fn is_secret_placeholder(value: &str) -> bool {
    SECRET_PLACEHOLDER.is_match(value.trim())
}

/// Every secret reference in `env`, in key order.
#[must_use]
pub fn parse_secret_refs_from_env(env: &BTreeMap<String, String>) -> Vec<SecretRef> {
    env.iter()
        .filter_map(|(key, value)| parse_secret_placeholder(key, value))
        .collect()
}

/// `<service>-<provider>-secrets`, with the service part shortened so the
/// whole name fits in a DNS label.
#[must_use]
pub fn generate_secret_name(service_name: &str, provider: &str) -> String {
    let suffix = format!("-{provider}-secrets");
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len());
    let base: String = service_name.chars().take(budget).collect();
    let base = base.trim_end_matches('-');
    format!("{base}{suffix}")
}
