//! Externally visible links for a build.

use std::collections::BTreeMap;

use crate::config::DomainConfig;
use crate::models::{Build, Deploy};

/// Build page, namespace, and the public URL of every active deploy that
/// serves traffic.
#[must_use]
pub fn dashboard_links(
    build: &Build,
    deploys: &[Deploy],
    domains: &DomainConfig,
) -> BTreeMap<String, String> {
    let mut links = BTreeMap::from([
        (
            "build".to_string(),
            format!(
                "{}/builds/{}",
                domains.dashboard_url.trim_end_matches('/'),
                build.uuid
            ),
        ),
        ("namespace".to_string(), build.namespace.clone()),
    ]);

    for deploy in deploys
        .iter()
        .filter(|d| d.active && d.deploy_type.generates_manifest())
    {
        let serves_traffic = deploy
            .deployable
            .as_ref()
            .is_some_and(|d| !d.ports.is_empty());
        if serves_traffic {
            links.insert(
                format!("service/{}", deploy.service_name),
                format!("https://{}.{}", deploy.uuid, domains.http),
            );
        }
    }

    links
}
