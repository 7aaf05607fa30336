//! External image build tool: verbs, invocation and execution.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use crate::error::{LifecycleError, Result};

/// Build tool verbs, in the order a build runs them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildVerb {
    /// Install template plugins.
    Init,
    /// Check the template with the image name bound.
    Validate,
    /// Produce the image.
    Build,
}

impl BuildVerb {
    pub const SEQUENCE: [BuildVerb; 3] = [BuildVerb::Init, BuildVerb::Validate, BuildVerb::Build];

    pub fn name(&self) -> &'static str {
        match self {
            BuildVerb::Init => "init",
            BuildVerb::Validate => "validate",
            BuildVerb::Build => "build",
        }
    }

    /// Arguments after the binary name. The template is the working directory.
    pub fn args(&self, image_name: &str) -> Vec<String> {
        let var = format!("image_name={image_name}");
        match self {
            BuildVerb::Init => vec!["init".to_string(), ".".to_string()],
            BuildVerb::Validate => vec![
                "validate".to_string(),
                "-var".to_string(),
                var,
                ".".to_string(),
            ],
            BuildVerb::Build => vec![
                "build".to_string(),
                "-var".to_string(),
                var,
                ".".to_string(),
            ],
        }
    }

    /// Long-running verbs stream to the operator's terminal.
    pub fn streams_output(&self) -> bool {
        matches!(self, BuildVerb::Build)
    }
}

/// One build tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub verb: BuildVerb,
    pub args: Vec<String>,
    pub stream_output: bool,
    /// Zero disables the timeout.
    pub timeout_secs: u64,
}

impl ToolInvocation {
    pub fn new(verb: BuildVerb, image_name: &str, timeout_secs: u64) -> Self {
        Self {
            verb,
            args: verb.args(image_name),
            stream_output: verb.streams_output(),
            timeout_secs,
        }
    }
}

/// Result of one build tool call.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub verb: BuildVerb,

    /// Exit code (0 = success, -1 = killed by signal).
    pub exit_code: i32,

    /// Captured stdout (empty when streamed).
    pub stdout: String,

    /// Captured stderr (empty when streamed).
    pub stderr: String,

    pub duration_ms: u64,
}

impl ToolOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can run build tool verbs.
#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Run one verb to completion. A non-zero exit is reported in the
    /// output, not as an error; errors mean the tool could not be run.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Packer, run as a child process inside the template directory.
#[derive(Debug, Clone)]
pub struct PackerCli {
    binary: PathBuf,
    working_dir: PathBuf,
}

impl PackerCli {
    pub fn new(binary: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl BuildTool for PackerCli {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let start = Instant::now();
        let program = self.binary.display().to_string();
        debug!(program = %program, args = ?invocation.args, "spawning build tool");

        let (stdout, stderr) = if invocation.stream_output {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::piped(), Stdio::piped())
        };

        let child = Command::new(&self.binary)
            .args(&invocation.args)
            .current_dir(&self.working_dir)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LifecycleError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        let output = if invocation.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(invocation.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| LifecycleError::ToolTimeout {
                verb: invocation.verb.name().to_string(),
                secs: invocation.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(ToolOutput {
            verb: invocation.verb,
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_args_bind_image_name() {
        let args = BuildVerb::Build.args("nixos-20240101-000000");
        assert_eq!(
            args,
            vec!["build", "-var", "image_name=nixos-20240101-000000", "."]
        );
        assert_eq!(BuildVerb::Init.args("x"), vec!["init", "."]);
        assert!(BuildVerb::Validate
            .args("x")
            .contains(&"image_name=x".to_string()));
    }

    #[test]
    fn test_only_build_streams() {
        assert!(BuildVerb::Build.streams_output());
        assert!(!BuildVerb::Init.streams_output());
        assert!(!BuildVerb::Validate.streams_output());
    }

    #[tokio::test]
    async fn test_runs_binary_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let tool = PackerCli::new("pwd", dir.path());
        let invocation = ToolInvocation {
            verb: BuildVerb::Init,
            args: vec![],
            stream_output: false,
            timeout_secs: 30,
        };

        let output = tool.run(&invocation).await.expect("run pwd");
        assert!(output.passed());
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(
            PathBuf::from(output.stdout.trim()).canonicalize().unwrap(),
            canonical
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_output_not_error() {
        let tool = PackerCli::new("false", ".");
        let invocation = ToolInvocation {
            verb: BuildVerb::Validate,
            args: vec![],
            stream_output: false,
            timeout_secs: 30,
        };

        let output = tool.run(&invocation).await.expect("run false");
        assert!(!output.passed());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let tool = PackerCli::new("/definitely/not/packer", ".");
        let invocation = ToolInvocation::new(BuildVerb::Init, "x", 5);

        let err = tool.run(&invocation).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let tool = PackerCli::new("sleep", ".");
        let invocation = ToolInvocation {
            verb: BuildVerb::Build,
            args: vec!["5".to_string()],
            stream_output: false,
            timeout_secs: 1,
        };

        let err = tool.run(&invocation).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ToolTimeout { secs: 1, .. }));
    }
}
