//! Image Lifecycle Core Library
//!
//! Builds a bootable disk image with an external build tool, proves it
//! boots on a throwaway server, and prunes old images by a keep-N
//! retention policy. Every remote side effect goes through the
//! `cloud_registry::CloudApi` seam.
//!
//! ## Layer 1 - Orchestration
//!
//! `Preflight → Builder → Discovery → Verifier → Reconciler`, run by
//! [`Pipeline`] one stage at a time.

pub mod builder;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fakes;
pub mod obs;
pub mod pipeline;
pub mod preflight;
pub mod reconciler;
pub mod shell;
pub mod telemetry;
pub mod tool;
pub mod verifier;

pub use builder::{derive_image_name, run_build, BuildOutcome};
pub use config::{
    ApiSettings, BootWait, BuildSettings, PipelineConfig, SshSettings, VerifySettings,
    DEFAULT_KEEP, DEFAULT_PROVENANCE,
};
pub use discovery::{latest_artifact, tagged_artifacts};
pub use error::{LifecycleError, Result};
pub use pipeline::{Pipeline, PipelineReport, Stage, StageRecord};
pub use preflight::Need;
pub use reconciler::{
    plan_retention, purge, reconcile, DeleteFailure, PurgeOutcome, ReconcileReport, RetentionPlan,
};
pub use shell::{RemoteOutput, RemoteShell, ShellError, SshShell};
pub use telemetry::init_tracing;
pub use tool::{BuildTool, BuildVerb, PackerCli, ToolInvocation, ToolOutput};
pub use verifier::{
    instance_name, CleanupOutcome, InstanceGuard, Probe, ProbeOutcome, VerificationReport,
    Verifier, VerifierState, INSTALLATION_PROBES, SSH_PROBE,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
