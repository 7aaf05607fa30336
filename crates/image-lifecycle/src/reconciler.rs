//! Retention for tool-created images.
//!
//! Only artifacts carrying the provenance label are ever considered, so
//! hand-made or foreign images are invisible here. Deletes are attempted
//! one by one and a failing delete never stops the next.

use cloud_registry::{CloudApi, ImageArtifact, ImageId, Label};
use serde::Serialize;
use tracing::{info, warn};

use crate::discovery::tagged_artifacts;
use crate::error::Result;

/// Partition of the tagged set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionPlan {
    /// Newest first.
    pub keep: Vec<ImageArtifact>,
    /// Newest first.
    pub delete: Vec<ImageArtifact>,
}

/// Split artifacts into the `keep` newest and everything older.
///
/// Artifacts without `label` are dropped from both sides. Equal
/// timestamps are ordered by id so the split is deterministic.
pub fn plan_retention(mut artifacts: Vec<ImageArtifact>, label: &Label, keep: usize) -> RetentionPlan {
    artifacts.retain(|a| a.has_label(label));
    crate::discovery::sort_newest_first(&mut artifacts);

    let delete = if artifacts.len() > keep {
        artifacts.split_off(keep)
    } else {
        Vec::new()
    };
    RetentionPlan {
        keep: artifacts,
        delete,
    }
}

/// A delete that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteFailure {
    pub id: ImageId,
    pub error: String,
}

/// What a reconcile (or purge) pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub kept: Vec<ImageId>,
    /// Deleted ids, or the ids that would be deleted on a dry run.
    pub deleted: Vec<ImageId>,
    pub failed: Vec<DeleteFailure>,
    pub dry_run: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Keep the `keep` newest tagged snapshots and delete the rest.
///
/// Listing failures are errors. Individual delete failures are recorded
/// in the report. An image that is already gone counts as deleted, which
/// keeps concurrent or repeated runs convergent.
pub async fn reconcile(
    api: &dyn CloudApi,
    label: &Label,
    keep: usize,
    dry_run: bool,
) -> Result<ReconcileReport> {
    let plan = plan_retention(tagged_artifacts(api, label).await?, label, keep);
    info!(
        keep = plan.keep.len(),
        delete = plan.delete.len(),
        dry_run,
        "retention plan"
    );

    let mut report = ReconcileReport {
        kept: plan.keep.iter().map(|a| a.id).collect(),
        dry_run,
        ..ReconcileReport::default()
    };

    if dry_run {
        report.deleted = plan.delete.iter().map(|a| a.id).collect();
        return Ok(report);
    }

    delete_each(api, &plan.delete, &mut report).await;
    Ok(report)
}

/// Outcome of a purge request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PurgeOutcome {
    /// No tagged artifacts exist; the operator was not asked.
    NothingToPurge,
    /// The operator said no; nothing was deleted.
    Declined { candidates: usize },
    Purged(ReconcileReport),
}

/// Delete every tagged snapshot once `confirm` approves the full list.
pub async fn purge<F>(api: &dyn CloudApi, label: &Label, confirm: F) -> Result<PurgeOutcome>
where
    F: FnOnce(&[ImageArtifact]) -> bool,
{
    let candidates = tagged_artifacts(api, label).await?;
    if candidates.is_empty() {
        info!(label = %label, "no tagged images to purge");
        return Ok(PurgeOutcome::NothingToPurge);
    }

    if !confirm(&candidates) {
        info!(candidates = candidates.len(), "purge declined");
        return Ok(PurgeOutcome::Declined {
            candidates: candidates.len(),
        });
    }

    let mut report = ReconcileReport::default();
    delete_each(api, &candidates, &mut report).await;
    Ok(PurgeOutcome::Purged(report))
}

async fn delete_each(api: &dyn CloudApi, targets: &[ImageArtifact], report: &mut ReconcileReport) {
    for artifact in targets {
        match api.delete_image(artifact.id).await {
            Ok(()) => {
                info!(image_id = artifact.id, description = %artifact.description, "image deleted");
                report.deleted.push(artifact.id);
            }
            Err(e) if e.is_not_found() => {
                info!(image_id = artifact.id, "image already gone");
                report.deleted.push(artifact.id);
            }
            Err(e) => {
                warn!(image_id = artifact.id, error = %e, "image delete failed");
                report.failed.push(DeleteFailure {
                    id: artifact.id,
                    error: e.to_string(),
                });
            }
        }
    }
}
