//! Verifier stage: boot a freshly built image on a throwaway server,
//! smoke-test it over SSH, and delete the server whatever happened.
//!
//! ```text
//! CREATING → BOOTING → SSH_PROBE → (INSTALLATION_PROBE)? → CLEANUP → DONE
//! ```
//!
//! Once the API has handed back a server id, the server is owned by an
//! [`InstanceGuard`]. The probes run inside an inner future whose outcome
//! (including a panic) is held while the guard's delete is awaited, so
//! the delete is issued exactly once on every path that produced an id.
//! Probe failures are warnings, never errors.

use chrono::{DateTime, Utc};
use cloud_registry::{
    CloudApi, CreateServer, ImageArtifact, ImageId, Instance, ServerId, AUTO_CLEANUP_KEY,
};
use futures::FutureExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{BootWait, PipelineConfig};
use crate::error::{LifecycleError, Result};
use crate::obs;
use crate::shell::{RemoteShell, ShellError};

/// Verifier state machine positions, recorded in order of entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierState {
    Creating,
    Booting,
    SshProbe,
    InstallationProbe,
    Cleanup,
    Done,
    Failed,
}

/// A named read-only remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub name: &'static str,
    pub command: &'static str,
}

/// Upper bound on how long a poll-mode boot wait may run.
const MAX_SSH_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Connectivity check.
pub const SSH_PROBE: Probe = Probe {
    name: "ssh",
    command: "true",
};

/// Introspection battery run once SSH answers.
pub const INSTALLATION_PROBES: &[Probe] = &[
    Probe {
        name: "version",
        command: "nixos-version",
    },
    Probe {
        name: "disk",
        command: "df -h /",
    },
    Probe {
        name: "swap",
        command: "swapon --show",
    },
    Probe {
        name: "channels",
        command: "nix-channel --list",
    },
    Probe {
        name: "provisioning",
        command: "cloud-init status",
    },
];

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub name: String,
    pub passed: bool,
    /// Command stdout on success, the error text otherwise.
    pub output: String,
}

/// Result of deleting the test instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Deleted,
    Failed { error: String },
}

/// Everything a verification run observed.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub image_id: ImageId,
    pub instance_id: ServerId,
    pub instance_name: String,
    pub ssh_reachable: bool,
    pub probes: Vec<ProbeOutcome>,
    pub cleanup: CleanupOutcome,
    pub states: Vec<VerifierState>,
}

impl VerificationReport {
    pub fn failed_probes(&self) -> usize {
        self.probes.iter().filter(|p| !p.passed).count()
    }

    pub fn cleaned_up(&self) -> bool {
        self.cleanup == CleanupOutcome::Deleted
    }
}

/// Owns a live test instance until its delete has been attempted.
///
/// Dropping an unreleased guard cannot delete anything (there is no async
/// drop), so it logs the server id instead. That only happens when the
/// verifier future itself is cancelled, e.g. by an operator interrupt.
#[must_use = "an unreleased guard leaks the test instance"]
#[derive(Debug)]
pub struct InstanceGuard {
    id: ServerId,
    name: String,
    released: bool,
}

impl InstanceGuard {
    pub fn new(instance: &Instance) -> Self {
        Self {
            id: instance.id,
            name: instance.name.clone(),
            released: false,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Issue the delete. Failures are logged and returned, never raised.
    pub async fn release(mut self, api: &dyn CloudApi) -> CleanupOutcome {
        let result = api.delete_server(self.id).await;
        self.released = true;

        match result {
            Ok(()) => {
                info!(server_id = self.id, name = %self.name, "test instance deleted");
                CleanupOutcome::Deleted
            }
            Err(e) => {
                error!(
                    server_id = self.id,
                    name = %self.name,
                    error = %e,
                    "failed to delete test instance"
                );
                CleanupOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if !self.released {
            obs::emit_instance_leaked(self.id, &self.name);
        }
    }
}

/// Unique, time-ordered test instance name.
pub fn instance_name(prefix: &str, now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

struct ProbeSummary {
    ssh_reachable: bool,
    probes: Vec<ProbeOutcome>,
}

/// Runs one verification against a single image.
pub struct Verifier<'a> {
    api: &'a dyn CloudApi,
    shell: &'a dyn RemoteShell,
    config: &'a PipelineConfig,
}

impl<'a> Verifier<'a> {
    pub fn new(api: &'a dyn CloudApi, shell: &'a dyn RemoteShell, config: &'a PipelineConfig) -> Self {
        Self { api, shell, config }
    }

    /// Server creation request for `image`.
    pub fn create_request(&self, image: &ImageArtifact, now: DateTime<Utc>) -> CreateServer {
        let settings = &self.config.verify;
        let provenance = self.config.provenance_label();

        let mut labels = BTreeMap::new();
        labels.insert(provenance.key, provenance.value);
        labels.insert(AUTO_CLEANUP_KEY.to_string(), "true".to_string());

        CreateServer {
            name: instance_name(&settings.name_prefix, now),
            server_type: settings.server_type.clone(),
            location: settings.location.clone(),
            image: image.id.to_string(),
            labels,
            start_after_create: true,
            ssh_keys: settings.ssh_key_names.clone(),
        }
    }

    /// Verify `image`. Errors are fatal for this attempt; probe failures
    /// are reported in the returned report instead.
    pub async fn verify(&self, image: &ImageArtifact) -> Result<VerificationReport> {
        let mut states = Vec::new();
        enter(&mut states, VerifierState::Creating);

        let request = self.create_request(image, Utc::now());
        let instance = match self.api.create_server(&request).await {
            Ok(instance) => instance,
            Err(e) => {
                // No id came back, so there is nothing to clean up.
                enter(&mut states, VerifierState::Failed);
                error!(image_id = image.id, error = %e, "test instance creation failed");
                return Err(LifecycleError::InstanceCreation(e.to_string()));
            }
        };
        let guard = InstanceGuard::new(&instance);

        let probed = AssertUnwindSafe(self.boot_and_probe(&instance, &mut states))
            .catch_unwind()
            .await;

        enter(&mut states, VerifierState::Cleanup);
        let cleanup = guard.release(self.api).await;

        let summary = match probed {
            Ok(Ok(summary)) => summary,
            Ok(Err(e)) => {
                enter(&mut states, VerifierState::Failed);
                return Err(e);
            }
            Err(panic) => std::panic::resume_unwind(panic),
        };

        enter(&mut states, VerifierState::Done);
        Ok(VerificationReport {
            image_id: image.id,
            instance_id: instance.id,
            instance_name: instance.name,
            ssh_reachable: summary.ssh_reachable,
            probes: summary.probes,
            cleanup,
            states,
        })
    }

    async fn boot_and_probe(
        &self,
        instance: &Instance,
        states: &mut Vec<VerifierState>,
    ) -> Result<ProbeSummary> {
        let host = instance.public_ipv4.as_deref().ok_or_else(|| {
            LifecycleError::InstanceCreation(format!(
                "server {} has no public IPv4 address",
                instance.id
            ))
        })?;

        enter(states, VerifierState::Booting);
        if let BootWait::Fixed { secs } = self.config.verify.boot {
            info!(server_id = instance.id, secs, "waiting for instance to boot");
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }

        enter(states, VerifierState::SshProbe);
        let mut probes = Vec::new();
        match self.wait_for_ssh(host).await {
            Ok(()) => {
                info!(host = %host, "ssh probe succeeded");
                probes.push(ProbeOutcome {
                    name: SSH_PROBE.name.to_string(),
                    passed: true,
                    output: String::new(),
                });
            }
            Err(e) => {
                warn!(
                    host = %host,
                    error = %e,
                    "ssh probe failed; skipping installation checks (key access may not be configured)"
                );
                probes.push(ProbeOutcome {
                    name: SSH_PROBE.name.to_string(),
                    passed: false,
                    output: e.to_string(),
                });
                return Ok(ProbeSummary {
                    ssh_reachable: false,
                    probes,
                });
            }
        }

        enter(states, VerifierState::InstallationProbe);
        for probe in INSTALLATION_PROBES {
            probes.push(self.run_probe(host, probe).await);
        }

        Ok(ProbeSummary {
            ssh_reachable: true,
            probes,
        })
    }

    async fn wait_for_ssh(&self, host: &str) -> std::result::Result<(), ShellError> {
        let (interval, timeout) = match self.config.verify.boot {
            BootWait::Fixed { .. } => {
                return self.shell.exec(host, SSH_PROBE.command).await.map(|_| ())
            }
            BootWait::Poll {
                interval_secs,
                timeout_secs,
            } => (
                Duration::from_secs(interval_secs.max(1)),
                Duration::from_secs(timeout_secs),
            ),
        };

        let started = Instant::now();
        let deadline = started
            .checked_add(timeout.min(MAX_SSH_WAIT))
            .unwrap_or(started);
        loop {
            match self.shell.exec(host, SSH_PROBE.command).await {
                Ok(_) => return Ok(()),
                Err(e)
                    if Instant::now()
                        .checked_add(interval)
                        .is_some_and(|next| next < deadline) =>
                {
                    debug!(host = %host, error = %e, "instance not reachable yet");
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_probe(&self, host: &str, probe: &Probe) -> ProbeOutcome {
        match self.shell.exec(host, probe.command).await {
            Ok(output) => {
                info!(probe = probe.name, output = %output.stdout.trim(), "probe passed");
                ProbeOutcome {
                    name: probe.name.to_string(),
                    passed: true,
                    output: output.stdout,
                }
            }
            Err(e) => {
                warn!(probe = probe.name, error = %e, "probe failed");
                ProbeOutcome {
                    name: probe.name.to_string(),
                    passed: false,
                    output: e.to_string(),
                }
            }
        }
    }
}

fn enter(states: &mut Vec<VerifierState>, state: VerifierState) {
    obs::emit_verifier_state(state);
    states.push(state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedShell;
    use chrono::TimeZone;
    use cloud_registry::fakes::MemoryCloud;
    use cloud_registry::Label;

    fn fast_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_token("t")
            .with_boot_wait(BootWait::Fixed { secs: 0 })
    }

    fn seeded() -> (MemoryCloud, ImageArtifact) {
        let cloud = MemoryCloud::new();
        let at = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        let id = cloud.register_snapshot("nixos", at, &[Label::provenance("imagectl")]);
        let image = cloud.images().into_iter().find(|i| i.id == id).unwrap();
        (cloud, image)
    }

    #[test]
    fn test_instance_name_is_time_derived_and_unique() {
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();
        let a = instance_name("nixos-test", now);
        let b = instance_name("nixos-test", now);
        assert!(a.starts_with("nixos-test-20240201-120000-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_create_request_labels() {
        let (cloud, image) = seeded();
        let config = fast_config();
        let shell = ScriptedShell::reachable();
        let verifier = Verifier::new(&cloud, &shell, &config);

        let request = verifier.create_request(&image, Utc::now());
        assert_eq!(request.image, image.id.to_string());
        assert_eq!(request.labels.get("created_by").map(String::as_str), Some("imagectl"));
        assert_eq!(request.labels.get("auto-cleanup").map(String::as_str), Some("true"));
        assert_eq!(request.server_type, "cx22");
        assert!(request.start_after_create);
    }

    #[tokio::test]
    async fn test_happy_path_runs_every_probe_and_cleans_up() {
        let (cloud, image) = seeded();
        let config = fast_config();
        let shell = ScriptedShell::reachable();

        let report = Verifier::new(&cloud, &shell, &config)
            .verify(&image)
            .await
            .expect("verify");

        assert!(report.ssh_reachable);
        assert_eq!(report.probes.len(), 1 + INSTALLATION_PROBES.len());
        assert_eq!(report.failed_probes(), 0);
        assert!(report.cleaned_up());
        assert_eq!(cloud.server_delete_calls(), vec![report.instance_id]);
        assert!(cloud.servers().is_empty());
        assert_eq!(
            report.states,
            vec![
                VerifierState::Creating,
                VerifierState::Booting,
                VerifierState::SshProbe,
                VerifierState::InstallationProbe,
                VerifierState::Cleanup,
                VerifierState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_skips_installation_probe() {
        let (cloud, image) = seeded();
        let config = fast_config();
        let shell = ScriptedShell::refusing();

        let report = Verifier::new(&cloud, &shell, &config)
            .verify(&image)
            .await
            .expect("probe failure is not fatal");

        assert!(!report.ssh_reachable);
        assert_eq!(report.probes.len(), 1);
        assert!(!report.states.contains(&VerifierState::InstallationProbe));
        assert_eq!(cloud.server_delete_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_is_reported_not_raised() {
        let (cloud, image) = seeded();
        cloud.fail_server_delete();
        let config = fast_config();
        let shell = ScriptedShell::reachable();

        let report = Verifier::new(&cloud, &shell, &config)
            .verify(&image)
            .await
            .expect("cleanup failure is not fatal");

        assert!(matches!(report.cleanup, CleanupOutcome::Failed { .. }));
        assert_eq!(cloud.server_delete_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_boot_wait_sleeps_before_probing() {
        let (cloud, image) = seeded();
        let config = PipelineConfig::default()
            .with_token("t")
            .with_boot_wait(BootWait::Fixed { secs: 60 });
        let shell = ScriptedShell::reachable();

        let started = Instant::now();
        Verifier::new(&cloud, &shell, &config)
            .verify(&image)
            .await
            .expect("verify");
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_boot_wait_retries_until_reachable() {
        let (cloud, image) = seeded();
        let config = PipelineConfig::default()
            .with_token("t")
            .with_boot_wait(BootWait::Poll {
                interval_secs: 5,
                timeout_secs: 120,
            });
        let shell = ScriptedShell::reachable_after(3);

        let report = Verifier::new(&cloud, &shell, &config)
            .verify(&image)
            .await
            .expect("verify");

        assert!(report.ssh_reachable);
        assert_eq!(shell.ssh_probe_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_boot_wait_gives_up_at_deadline() {
        let (cloud, image) = seeded();
        let config = PipelineConfig::default()
            .with_token("t")
            .with_boot_wait(BootWait::Poll {
                interval_secs: 5,
                timeout_secs: 20,
            });
        let shell = ScriptedShell::refusing();

        let started = Instant::now();
        let report = Verifier::new(&cloud, &shell, &config)
            .verify(&image)
            .await
            .expect("verify");

        assert!(!report.ssh_reachable);
        assert!(started.elapsed() <= Duration::from_secs(20));
        assert_eq!(cloud.server_delete_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_with_maximal_durations_does_not_overflow() {
        let (cloud, image) = seeded();
        let config = PipelineConfig::default()
            .with_token("t")
            .with_boot_wait(BootWait::Poll {
                interval_secs: u64::MAX,
                timeout_secs: u64::MAX,
            });
        let shell = ScriptedShell::refusing();

        let report = Verifier::new(&cloud, &shell, &config)
            .verify(&image)
            .await
            .expect("verify");

        assert!(!report.ssh_reachable);
        assert_eq!(shell.ssh_probe_attempts(), 1);
        assert_eq!(cloud.server_delete_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_poll_timeout_is_capped() {
        let (cloud, image) = seeded();
        let config = PipelineConfig::default()
            .with_token("t")
            .with_boot_wait(BootWait::Poll {
                interval_secs: 3600,
                timeout_secs: u64::MAX,
            });
        let shell = ScriptedShell::refusing();

        let started = Instant::now();
        let report = Verifier::new(&cloud, &shell, &config)
            .verify(&image)
            .await
            .expect("verify");

        assert!(!report.ssh_reachable);
        assert!(started.elapsed() < MAX_SSH_WAIT);
        assert_eq!(shell.ssh_probe_attempts(), 24);
    }
}
