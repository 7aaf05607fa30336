//! Preflight: prove every local prerequisite exists before touching
//! anything remote.
//!
//! HTTP and JSON handling are compiled in, so the checks that remain are
//! the API token, the external binaries, and the build template.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::error::{LifecycleError, Result};

/// A prerequisite a command depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Need {
    Token,
    BuildTool,
    Template,
    RemoteShell,
}

impl Need {
    /// Everything the full pipeline touches.
    pub const FULL: &'static [Need] = &[
        Need::Token,
        Need::BuildTool,
        Need::Template,
        Need::RemoteShell,
    ];
    pub const BUILD: &'static [Need] = &[Need::Token, Need::BuildTool, Need::Template];
    pub const VERIFY: &'static [Need] = &[Need::Token, Need::RemoteShell];
    pub const REGISTRY: &'static [Need] = &[Need::Token];
}

/// Check `needs` against `config`, reporting every problem at once.
pub fn check(config: &PipelineConfig, needs: &[Need]) -> Result<()> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let problems = collect_problems(config, needs, &path_var);

    if problems.is_empty() {
        debug!(?needs, "preflight passed");
        Ok(())
    } else {
        Err(LifecycleError::Config(problems))
    }
}

fn collect_problems(config: &PipelineConfig, needs: &[Need], path_var: &OsStr) -> Vec<String> {
    let mut problems = Vec::new();

    for need in needs {
        match need {
            Need::Token => {
                if config.api.token().is_none() {
                    problems.push("API token is missing or empty (set HCLOUD_TOKEN)".to_string());
                }
            }
            Need::BuildTool => {
                if resolve_binary(&config.build.tool, path_var).is_none() {
                    problems.push(format!(
                        "image build tool `{}` not found on PATH",
                        config.build.tool.display()
                    ));
                }
            }
            Need::Template => {
                if !config.build.template_dir.is_dir() {
                    problems.push(format!(
                        "build template directory {} does not exist",
                        config.build.template_dir.display()
                    ));
                }
            }
            Need::RemoteShell => {
                if resolve_binary(&config.verify.ssh.binary, path_var).is_none() {
                    problems.push(format!(
                        "remote shell client `{}` not found on PATH",
                        config.verify.ssh.binary.display()
                    ));
                }
            }
        }
    }

    problems
}

/// Resolve a binary the way a shell would: explicit paths are checked
/// directly, bare names are searched in `path_var`.
pub fn resolve_binary(name: &Path, path_var: &OsStr) -> Option<PathBuf> {
    if name.components().count() > 1 || name.is_absolute() {
        return name.is_file().then(|| name.to_path_buf());
    }

    std::env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
