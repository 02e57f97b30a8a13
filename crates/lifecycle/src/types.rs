use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Declarative (`lifecycle.yaml`) parse or validation failure
    #[error("Invalid lifecycle config: {0}")]
    ConfigParseError(String),

    #[error("Malformed field `{field}`: {reason}")]
    MalformedField { field: String, reason: String },

    #[error("Missing required field `{field}` on {object}")]
    MissingField { object: String, field: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Pods matching `{selector}` not ready after {attempts} attempts")]
    ReadinessTimeout { selector: String, attempts: u32 },

    #[error("Service account `{name}` did not appear in `{namespace}` after {attempts} attempts")]
    ServiceAccountTimeout {
        namespace: String,
        name: String,
        attempts: u32,
    },

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Dependency graph error: {0}")]
    GraphError(String),

    #[error("Image build failed for: {0}")]
    ImageBuildFailed(String),

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Build store error: {0}")]
    StoreError(String),

    #[error("Queue error: {0}")]
    QueueError(String),
}

impl Error {
    /// Errors caused by the user's declarative config rather than the platform.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::ConfigParseError(_))
    }

    pub(crate) fn malformed(field: impl Into<String>, reason: impl ToString) -> Self {
        Error::MalformedField {
            field: field.into(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of a create call where "already exists" is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Outcome of a delete call where "not found" is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_declarative_errors_are_config_errors() {
        assert!(Error::ConfigParseError("bad".into()).is_config_error());
        assert!(!Error::ConfigError("bad".into()).is_config_error());
        assert!(!Error::ReadinessTimeout {
            selector: "lc_uuid=x".into(),
            attempts: 180
        }
        .is_config_error());
    }

    #[test]
    fn malformed_field_message_names_field() {
        let err = Error::malformed("nodeAffinity", "expected value at line 1");
        assert_eq!(
            err.to_string(),
            "Malformed field `nodeAffinity`: expected value at line 1"
        );
    }
}
