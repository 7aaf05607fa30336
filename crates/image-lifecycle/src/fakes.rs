//! In-memory fakes for the build tool and remote shell (testing only)
//!
//! Provides `FakeBuildTool` and `ScriptedShell`, which satisfy the
//! `BuildTool` and `RemoteShell` contracts without spawning processes.
//! Pair them with `cloud_registry::fakes::MemoryCloud` to drive a whole
//! pipeline in memory.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use cloud_registry::fakes::MemoryCloud;
use cloud_registry::Label;

use crate::error::Result;
use crate::shell::{RemoteOutput, RemoteShell, ShellError};
use crate::tool::{BuildTool, BuildVerb, ToolInvocation, ToolOutput};
use crate::verifier::SSH_PROBE;

// ---------------------------------------------------------------------------
// FakeBuildTool
// ---------------------------------------------------------------------------

/// Build tool that records the verbs it was asked to run.
#[derive(Debug, Default)]
pub struct FakeBuildTool {
    fail_at: Option<(BuildVerb, String)>,
    registry: Option<(Arc<MemoryCloud>, Label)>,
    runs: Mutex<Vec<ToolInvocation>>,
}

impl FakeBuildTool {
    /// Every verb exits 0; nothing is registered anywhere.
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// `verb` exits 1 with `stderr`; earlier verbs succeed.
    pub fn failing_at(verb: BuildVerb, stderr: &str) -> Self {
        Self {
            fail_at: Some((verb, stderr.to_string())),
            ..Self::default()
        }
    }

    /// A successful `build` registers a snapshot in `cloud` carrying
    /// `label`, described by the bound image name.
    pub fn registering_into(cloud: Arc<MemoryCloud>, label: Label) -> Self {
        Self {
            registry: Some((cloud, label)),
            ..Self::default()
        }
    }

    pub fn verbs_run(&self) -> Vec<BuildVerb> {
        self.runs.lock().unwrap().iter().map(|i| i.verb).collect()
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.runs.lock().unwrap().clone()
    }
}

fn bound_image_name(invocation: &ToolInvocation) -> String {
    invocation
        .args
        .iter()
        .find_map(|a| a.strip_prefix("image_name="))
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl BuildTool for FakeBuildTool {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        self.runs.lock().unwrap().push(invocation.clone());

        if let Some((verb, stderr)) = &self.fail_at {
            if *verb == invocation.verb {
                return Ok(ToolOutput {
                    verb: invocation.verb,
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: stderr.clone(),
                    duration_ms: 1,
                });
            }
        }

        if invocation.verb == BuildVerb::Build {
            if let Some((cloud, label)) = &self.registry {
                cloud.register_snapshot(
                    &bound_image_name(invocation),
                    Utc::now(),
                    std::slice::from_ref(label),
                );
            }
        }

        Ok(ToolOutput {
            verb: invocation.verb,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedShell
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Script {
    refuse_all: bool,
    /// Connectivity probes refused before the host starts answering.
    refusals_left: usize,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    outputs: HashMap<String, String>,
}

/// Remote shell whose answers are scripted per command.
#[derive(Debug, Default)]
pub struct ScriptedShell {
    script: Mutex<Script>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedShell {
    /// Every command succeeds.
    pub fn reachable() -> Self {
        Self::default()
    }

    /// Every connection is refused.
    pub fn refusing() -> Self {
        let shell = Self::default();
        shell.script.lock().unwrap().refuse_all = true;
        shell
    }

    /// The first `refusals` connectivity probes are refused, then the
    /// host answers everything.
    pub fn reachable_after(refusals: usize) -> Self {
        let shell = Self::default();
        shell.script.lock().unwrap().refusals_left = refusals;
        shell
    }

    /// `command` exits non-zero.
    pub fn with_failing(self, command: &str) -> Self {
        self.script.lock().unwrap().failing.insert(command.to_string());
        self
    }

    /// `command` panics inside the shell implementation.
    pub fn with_panic(self, command: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .panicking
            .insert(command.to_string());
        self
    }

    /// `command` prints `stdout`.
    pub fn with_output(self, command: &str, stdout: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .outputs
            .insert(command.to_string(), stdout.to_string());
        self
    }

    /// `(host, command)` pairs, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, c)| c).collect()
    }

    pub fn ssh_probe_attempts(&self) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.as_str() == SSH_PROBE.command)
            .count()
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn exec(&self, host: &str, command: &str) -> std::result::Result<RemoteOutput, ShellError> {
        self.calls
            .lock()
            .unwrap()
            .push((host.to_string(), command.to_string()));

        let outcome = {
            let mut script = self.script.lock().unwrap();
            if script.panicking.contains(command) {
                None
            } else if script.refuse_all {
                Some(Err(refused(host)))
            } else if command == SSH_PROBE.command && script.refusals_left > 0 {
                script.refusals_left -= 1;
                Some(Err(refused(host)))
            } else if script.failing.contains(command) {
                Some(Err(ShellError::CommandFailed {
                    exit_code: 1,
                    stderr: format!("{command}: failed"),
                }))
            } else {
                Some(Ok(RemoteOutput {
                    stdout: script
                        .outputs
                        .get(command)
                        .cloned()
                        .unwrap_or_else(|| "ok\n".to_string()),
                    stderr: String::new(),
                }))
            }
        };

        match outcome {
            Some(result) => result,
            None => panic!("scripted panic running `{command}`"),
        }
    }
}

fn refused(host: &str) -> ShellError {
    ShellError::ConnectionFailed {
        host: host.to_string(),
        stderr: "Connection refused".to_string(),
    }
}
