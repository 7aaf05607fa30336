//! Builder stage: run the image build tool's verbs in order.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::BuildSettings;
use crate::error::{LifecycleError, Result};
use crate::tool::{BuildTool, BuildVerb, ToolInvocation, ToolOutput};

/// Unique image name from a prefix and the build start time.
pub fn derive_image_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, now.format("%Y%m%d-%H%M%S"))
}

/// What a successful build ran.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub image_name: String,
    pub steps: Vec<ToolOutput>,
}

impl BuildOutcome {
    pub fn duration_ms(&self) -> u64 {
        self.steps.iter().map(|s| s.duration_ms).sum()
    }
}

/// Run `init`, `validate`, `build`. The first failing verb aborts the
/// build; the tool owns cleanup of its own transient resources.
pub async fn run_build(
    tool: &dyn BuildTool,
    settings: &BuildSettings,
    image_name: &str,
) -> Result<BuildOutcome> {
    let mut steps = Vec::with_capacity(BuildVerb::SEQUENCE.len());

    for verb in BuildVerb::SEQUENCE {
        info!(verb = verb.name(), image_name = %image_name, "running build tool");
        let invocation = ToolInvocation::new(verb, image_name, settings.timeout_secs);
        let output = tool.run(&invocation).await?;

        if !output.passed() {
            warn!(
                verb = verb.name(),
                exit_code = output.exit_code,
                "build tool failed"
            );
            return Err(LifecycleError::ToolFailed {
                verb: verb.name().to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        if !output.stdout.is_empty() {
            info!(verb = verb.name(), output = %output.stdout.trim(), "build tool output");
        }
        steps.push(output);
    }

    Ok(BuildOutcome {
        image_name: image_name.to_string(),
        steps,
    })
}
