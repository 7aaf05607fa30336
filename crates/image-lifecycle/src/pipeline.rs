//! Stage orchestration for each operator command.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use cloud_registry::{CloudApi, ImageArtifact, ImageId, ImageQuery};
use serde::Serialize;
use tracing::{info, Instrument};

use crate::builder::{derive_image_name, run_build};
use crate::config::PipelineConfig;
use crate::discovery::{latest_artifact, tagged_artifacts};
use crate::error::{LifecycleError, Result};
use crate::obs;
use crate::preflight::{self, Need};
use crate::reconciler::{self, PurgeOutcome, ReconcileReport};
use crate::shell::RemoteShell;
use crate::tool::BuildTool;
use crate::verifier::{VerificationReport, Verifier};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    Build,
    Discover,
    Verify,
    Reconcile,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Build => "build",
            Stage::Discover => "discover",
            Stage::Verify => "verify",
            Stage::Reconcile => "reconcile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub duration_ms: u64,
    pub success: bool,
}

/// What a command run did. Sections for stages that did not run are `None`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub image_name: Option<String>,
    pub artifact: Option<ImageArtifact>,
    pub verification: Option<VerificationReport>,
    pub reconcile: Option<ReconcileReport>,
    pub stages: Vec<StageRecord>,
}

impl PipelineReport {
    pub fn ran(&self, stage: Stage) -> bool {
        self.stages.iter().any(|s| s.stage == stage)
    }

    pub fn duration_ms(&self) -> u64 {
        self.stages.iter().map(|s| s.duration_ms).sum()
    }
}

/// The image lifecycle, wired to concrete (or fake) collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    api: Arc<dyn CloudApi>,
    tool: Arc<dyn BuildTool>,
    shell: Arc<dyn RemoteShell>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        api: Arc<dyn CloudApi>,
        tool: Arc<dyn BuildTool>,
        shell: Arc<dyn RemoteShell>,
    ) -> Self {
        Self {
            config,
            api,
            tool,
            shell,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Preflight → Build → Discover → Verify → Reconcile.
    ///
    /// Any stage error aborts the run. Probe failures inside the verifier
    /// are not errors, so the reconciler still runs after them.
    pub async fn run_all(&self) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        self.preflight(&mut report, Need::FULL)?;

        let artifact = self.build_and_discover(&mut report).await?;
        let verification = self.verify_stage(&mut report, &artifact).await?;
        report.verification = Some(verification);

        let reconciled = self.reconcile_stage(&mut report, false).await?;
        report.reconcile = Some(reconciled);
        Ok(report)
    }

    /// Preflight → Build → Discover.
    pub async fn build(&self) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        self.preflight(&mut report, Need::BUILD)?;
        self.build_and_discover(&mut report).await?;
        Ok(report)
    }

    /// Verify `image`, or the latest tagged artifact when `None`.
    pub async fn test(&self, image: Option<ImageId>) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        self.preflight(&mut report, Need::VERIFY)?;

        let artifact = match image {
            Some(id) => {
                self.stage(&mut report, Stage::Discover, self.find_image(id))
                    .await?
            }
            None => {
                let label = self.config.provenance_label();
                self.stage(
                    &mut report,
                    Stage::Discover,
                    latest_artifact(self.api.as_ref(), &label),
                )
                .await?
            }
        };
        report.artifact = Some(artifact.clone());

        let verification = self.verify_stage(&mut report, &artifact).await?;
        report.verification = Some(verification);
        Ok(report)
    }

    /// Run the reconciler alone.
    pub async fn clean(&self, dry_run: bool) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        self.preflight(&mut report, Need::REGISTRY)?;
        let reconciled = self.reconcile_stage(&mut report, dry_run).await?;
        report.reconcile = Some(reconciled);
        Ok(report)
    }

    /// Tagged artifacts, newest first.
    pub async fn list(&self) -> Result<Vec<ImageArtifact>> {
        preflight::check(&self.config, Need::REGISTRY)?;
        tagged_artifacts(self.api.as_ref(), &self.config.provenance_label()).await
    }

    /// Delete every tagged artifact once `confirm` approves the list.
    pub async fn purge<F>(&self, confirm: F) -> Result<PurgeOutcome>
    where
        F: FnOnce(&[ImageArtifact]) -> bool,
    {
        preflight::check(&self.config, Need::REGISTRY)?;
        let label = self.config.provenance_label();
        reconciler::purge(self.api.as_ref(), &label, confirm)
            .instrument(obs::stage_span("purge"))
            .await
    }

    fn preflight(&self, report: &mut PipelineReport, needs: &[Need]) -> Result<()> {
        let start = Instant::now();
        let result = preflight::check(&self.config, needs);
        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_stage_finished(Stage::Preflight.name(), duration_ms, result.is_ok());
        report.stages.push(StageRecord {
            stage: Stage::Preflight,
            duration_ms,
            success: result.is_ok(),
        });
        result
    }

    async fn build_and_discover(&self, report: &mut PipelineReport) -> Result<ImageArtifact> {
        let image_name = derive_image_name(&self.config.build.image_prefix, chrono::Utc::now());
        report.image_name = Some(image_name.clone());

        let outcome = self
            .stage(
                report,
                Stage::Build,
                run_build(self.tool.as_ref(), &self.config.build, &image_name),
            )
            .await?;
        info!(image_name = %outcome.image_name, duration_ms = outcome.duration_ms(), "image built");

        let label = self.config.provenance_label();
        let artifact = self
            .stage(
                report,
                Stage::Discover,
                latest_artifact(self.api.as_ref(), &label),
            )
            .await?;
        report.artifact = Some(artifact.clone());
        Ok(artifact)
    }

    async fn verify_stage(
        &self,
        report: &mut PipelineReport,
        artifact: &ImageArtifact,
    ) -> Result<VerificationReport> {
        let verifier = Verifier::new(self.api.as_ref(), self.shell.as_ref(), &self.config);
        self.stage(report, Stage::Verify, verifier.verify(artifact))
            .await
    }

    async fn reconcile_stage(
        &self,
        report: &mut PipelineReport,
        dry_run: bool,
    ) -> Result<ReconcileReport> {
        let label = self.config.provenance_label();
        self.stage(
            report,
            Stage::Reconcile,
            reconciler::reconcile(self.api.as_ref(), &label, self.config.keep, dry_run),
        )
        .await
    }

    async fn find_image(&self, id: ImageId) -> Result<ImageArtifact> {
        self.api
            .list_images(&ImageQuery::snapshots())
            .await?
            .into_iter()
            .find(|a| a.id == id)
            .ok_or(LifecycleError::UnknownImage(id))
    }

    async fn stage<T, F>(&self, report: &mut PipelineReport, stage: Stage, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        obs::emit_stage_started(stage.name());
        let start = Instant::now();
        let result = fut.instrument(obs::stage_span(stage.name())).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        obs::emit_stage_finished(stage.name(), duration_ms, result.is_ok());
        report.stages.push(StageRecord {
            stage,
            duration_ms,
            success: result.is_ok(),
        });
        result
    }
}
