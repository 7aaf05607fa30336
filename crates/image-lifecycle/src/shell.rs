//! Remote shell access to test instances.
//!
//! Used only for read-only smoke checks. Every error here is downgraded
//! to a warning by the verifier.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::SshSettings;

/// OpenSSH exits with this status when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Output of a remote command that exited 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Remote shell failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShellError {
    #[error("could not start remote shell client: {0}")]
    Spawn(String),

    #[error("remote command timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("connection to {host} failed: {stderr}")]
    ConnectionFailed { host: String, stderr: String },

    #[error("remote command exited with {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },
}

/// Something that can run a command on a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, host: &str, command: &str) -> Result<RemoteOutput, ShellError>;
}

/// The system OpenSSH client, non-interactive.
#[derive(Debug, Clone)]
pub struct SshShell {
    settings: SshSettings,
}

impl SshShell {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    /// Client arguments for running `command` on `host`.
    ///
    /// Host keys are neither checked nor recorded: every test instance is
    /// brand new and its key is unknown by construction.
    pub fn args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        if let Some(identity) = &self.settings.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.settings.user, host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, host: &str, command: &str) -> Result<RemoteOutput, ShellError> {
        debug!(host = %host, command = %command, "remote exec");

        let child = Command::new(&self.settings.binary)
            .args(self.args(host, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShellError::Spawn(e.to_string()))?;

        let secs = self.settings.command_timeout_secs;
        let output = tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
            .await
            .map_err(|_| ShellError::Timeout { secs })?
            .map_err(|e| ShellError::Spawn(e.to_string()))?;

        classify(
            host,
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        )
    }
}

/// Map the client's exit status onto the error taxonomy.
fn classify(
    host: &str,
    code: Option<i32>,
    stdout: String,
    stderr: String,
) -> Result<RemoteOutput, ShellError> {
    match code {
        Some(0) => Ok(RemoteOutput { stdout, stderr }),
        Some(SSH_CONNECTION_FAILURE) => Err(ShellError::ConnectionFailed {
            host: host.to_string(),
            stderr,
        }),
        code => Err(ShellError::CommandFailed {
            exit_code: code.unwrap_or(-1),
            stderr,
        }),
    }
}
