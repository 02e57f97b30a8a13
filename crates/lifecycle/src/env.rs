//! Environment variable templating.
//!
//! Env values may reference other deploys of the same build, e.g.
//! `API_URL: "http://{{api_internalHostname}}:8080"`. Secret placeholders use
//! the same braces but are resolved by the cluster, so they pass through
//! untouched.

use std::collections::BTreeMap;

use handlebars::Handlebars;
use serde_json::{Map, Value};

use crate::config::LifecycleConfig;
use crate::manifest::secrets::is_secret_placeholder;
use crate::models::{Build, Deploy};
use crate::types::{Error, Result};

pub struct EnvRenderer {
    handlebars: Handlebars<'static>,
    context: Value,
}

impl EnvRenderer {
    /// Context for `build`, covering every active deploy.
    #[must_use]
    pub fn new(build: &Build, deploys: &[Deploy], config: &LifecycleConfig) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(false);

        Self {
            handlebars,
            context: render_context(build, deploys, config),
        }
    }

    pub fn render_value(&self, key: &str, value: &str) -> Result<String> {
        if !value.contains("{{") || is_secret_placeholder(value) {
            return Ok(value.to_string());
        }
        self.handlebars
            .render_template(value, &self.context)
            .map_err(|e| Error::TemplateError(format!("{key}: {e}")))
    }

    pub fn render_map(&self, env: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        env.iter()
            .map(|(key, value)| Ok((key.clone(), self.render_value(key, value)?)))
            .collect()
    }

    /// Render every env map of `deploy` in place.
    pub fn render_deploy(&self, deploy: &mut Deploy) -> Result<()> {
        deploy.env = self.render_map(&deploy.env)?;
        deploy.init_env = self.render_map(&deploy.init_env)?;
        deploy.comment_env = self.render_map(&deploy.comment_env)?;
        deploy.comment_init_env = self.render_map(&deploy.comment_init_env)?;
        Ok(())
    }
}

fn render_context(build: &Build, deploys: &[Deploy], config: &LifecycleConfig) -> Value {
    let mut context = Map::new();
    context.insert("buildUUID".to_string(), Value::from(build.uuid.clone()));
    context.insert("namespace".to_string(), Value::from(build.namespace.clone()));

    for deploy in deploys.iter().filter(|d| d.active) {
        let name = &deploy.service_name;
        context.insert(
            format!("{name}_internalHostname"),
            Value::from(deploy.uuid.clone()),
        );
        context.insert(
            format!("{name}_publicUrl"),
            Value::from(format!("{}.{}", deploy.uuid, config.domains.http)),
        );
        context.insert(format!("{name}_UUID"), Value::from(deploy.uuid.clone()));
    }

    Value::Object(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn renderer() -> EnvRenderer {
        let build = Build::new("b1");
        let deploys = vec![Deploy::new("b1", "api"), Deploy::new("b1", "web")];
        EnvRenderer::new(&build, &deploys, &LifecycleConfig::default())
    }

    #[test]
    fn references_resolve_to_deploy_addresses() {
        let r = renderer();
        assert_eq!(
            r.render_value("API", "http://{{api_internalHostname}}:8080").unwrap(),
            "http://api-b1:8080"
        );
        assert_eq!(
            r.render_value("PUBLIC", "https://{{web_publicUrl}}").unwrap(),
            "https://web-b1.lifecycle.example.com"
        );
        assert_eq!(r.render_value("NS", "{{namespace}}").unwrap(), "env-b1");
    }

    #[test]
    fn secret_placeholders_pass_through() {
        let r = renderer();
        let env = BTreeMap::from([
            ("DB_PASS".to_string(), "{{aws:myapp/db:password}}".to_string()),
            ("PLAIN".to_string(), "a&b".to_string()),
        ]);
        let rendered = r.render_map(&env).unwrap();
        assert_eq!(rendered, env);
    }

    #[test]
    fn unknown_references_render_empty() {
        let r = renderer();
        assert_eq!(r.render_value("X", "[{{missing_UUID}}]").unwrap(), "[]");
    }

    #[test]
    fn syntax_errors_are_template_errors() {
        let r = renderer();
        let err = r.render_value("BROKEN", "{{#if}}").unwrap_err();
        assert!(matches!(err, Error::TemplateError(ref msg) if msg.starts_with("BROKEN")));
    }
}
