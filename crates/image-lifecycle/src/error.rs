//! Error taxonomy for the image lifecycle.

use cloud_registry::CloudError;

/// Lifecycle errors. Every variant here is fatal for the stage that
/// raised it; non-fatal conditions (probe failures, cleanup failures)
/// are recorded in stage reports instead.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("preflight failed: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("build tool `{verb}` failed with exit code {exit_code}: {stderr}")]
    ToolFailed {
        verb: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("build tool `{verb}` timed out after {secs}s")]
    ToolTimeout { verb: String, secs: u64 },

    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("no image artifact found with label {label}")]
    NoArtifactFound { label: String },

    #[error("image {0} does not exist")]
    UnknownImage(cloud_registry::ImageId),

    #[error("test instance could not be provisioned: {0}")]
    InstanceCreation(String),

    #[error("cloud API error: {0}")]
    Cloud(#[from] CloudError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    /// Configuration problems are reported before any remote side effect.
    pub fn is_config(&self) -> bool {
        matches!(self, LifecycleError::Config(_))
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_lists_every_problem() {
        let err = LifecycleError::Config(vec![
            "HCLOUD_TOKEN is not set".to_string(),
            "packer not found on PATH".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("HCLOUD_TOKEN is not set"));
        assert!(msg.contains("packer not found on PATH"));
        assert!(err.is_config());
    }

    #[test]
    fn test_tool_failed_display() {
        let err = LifecycleError::ToolFailed {
            verb: "build".to_string(),
            exit_code: 1,
            stderr: "Error: template invalid".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("`build`"));
        assert!(msg.contains("template invalid"));
    }

    #[test]
    fn test_no_artifact_display() {
        let err = LifecycleError::NoArtifactFound {
            label: "created_by=imagectl".to_string(),
        };
        assert!(err.to_string().contains("no image artifact found"));
    }
}
