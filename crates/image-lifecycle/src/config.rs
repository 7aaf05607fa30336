//! Pipeline configuration.
//!
//! A single immutable [`PipelineConfig`] is assembled once at startup
//! (the CLI folds flags and environment variables into it) and passed by
//! reference into every stage. Stages never read the environment.

use cloud_registry::{HcloudConfig, Label, DEFAULT_ENDPOINT};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of tagged images retained by the reconciler.
pub const DEFAULT_KEEP: usize = 3;

/// Default provenance label value.
pub const DEFAULT_PROVENANCE: &str = "imagectl";

/// Cloud API access.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSettings {
    /// Bearer token. `None` is only caught by preflight.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            token: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSettings")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ApiSettings {
    /// The token, if present and non-blank.
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Client configuration, or `None` without a usable token.
    pub fn client_config(&self) -> Option<HcloudConfig> {
        self.token().map(|token| {
            HcloudConfig::new(token)
                .with_endpoint(&self.endpoint)
                .with_timeout(Duration::from_secs(self.timeout_secs))
        })
    }
}

/// Image build tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildSettings {
    /// Build tool binary, bare name or path.
    pub tool: PathBuf,
    /// Directory holding the build template.
    pub template_dir: PathBuf,
    /// Prefix for timestamp-derived image names.
    pub image_prefix: String,
    /// Per-verb timeout; 0 disables it.
    pub timeout_secs: u64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            tool: PathBuf::from("packer"),
            template_dir: PathBuf::from("packer"),
            image_prefix: "nixos".to_string(),
            timeout_secs: 3600,
        }
    }
}

/// How the verifier waits for a fresh instance to come up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BootWait {
    /// Sleep for a fixed period, then probe once.
    Fixed { secs: u64 },
    /// Probe every `interval_secs` until it answers or `timeout_secs` elapse.
    Poll { interval_secs: u64, timeout_secs: u64 },
}

impl Default for BootWait {
    fn default() -> Self {
        BootWait::Fixed { secs: 60 }
    }
}

/// Remote shell client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshSettings {
    pub binary: PathBuf,
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Whole-command ceiling, including the connect phase.
    pub command_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ssh"),
            user: "root".to_string(),
            identity_file: None,
            connect_timeout_secs: 10,
            command_timeout_secs: 60,
        }
    }
}

/// Throwaway instance settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifySettings {
    pub server_type: String,
    pub location: Option<String>,
    pub name_prefix: String,
    /// Project SSH key names injected into the test instance.
    pub ssh_key_names: Vec<String>,
    pub boot: BootWait,
    pub ssh: SshSettings,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            server_type: "cx22".to_string(),
            location: Some("nbg1".to_string()),
            name_prefix: "nixos-test".to_string(),
            ssh_key_names: Vec::new(),
            boot: BootWait::default(),
            ssh: SshSettings::default(),
        }
    }
}

/// Complete, immutable pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub api: ApiSettings,
    /// Value of the `created_by` label on everything this tool creates.
    pub provenance: String,
    /// Tagged images retained by the reconciler.
    pub keep: usize,
    pub build: BuildSettings,
    pub verify: VerifySettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            provenance: DEFAULT_PROVENANCE.to_string(),
            keep: DEFAULT_KEEP,
            build: BuildSettings::default(),
            verify: VerifySettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_token(mut self, token: &str) -> Self {
        self.api.token = Some(token.to_string());
        self
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep;
        self
    }

    pub fn with_boot_wait(mut self, boot: BootWait) -> Self {
        self.verify.boot = boot;
        self
    }

    /// The provenance tag `created_by=<provenance>`.
    pub fn provenance_label(&self) -> Label {
        Label::provenance(&self.provenance)
    }
}
