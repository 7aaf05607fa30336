//! Artifact discovery against the image registry.

use cloud_registry::{CloudApi, ImageArtifact, ImageQuery, Label};
use tracing::{debug, info};

use crate::error::{LifecycleError, Result};

/// All snapshots carrying `label`, newest first.
///
/// The label is re-checked locally and the order re-established locally,
/// so a registry that ignores the selector or the sort cannot widen the
/// set of artifacts this tool considers its own.
pub async fn tagged_artifacts(api: &dyn CloudApi, label: &Label) -> Result<Vec<ImageArtifact>> {
    let query = ImageQuery::snapshots().with_label(label.clone());
    let mut artifacts: Vec<ImageArtifact> = api
        .list_images(&query)
        .await?
        .into_iter()
        .filter(|a| a.has_label(label))
        .collect();

    sort_newest_first(&mut artifacts);
    debug!(label = %label, count = artifacts.len(), "tagged artifacts");
    Ok(artifacts)
}

/// Newest `created` first; ties broken by the larger id.
pub fn sort_newest_first(artifacts: &mut [ImageArtifact]) {
    artifacts.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
}

/// The most recently created tagged snapshot.
pub async fn latest_artifact(api: &dyn CloudApi, label: &Label) -> Result<ImageArtifact> {
    let latest = tagged_artifacts(api, label)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| LifecycleError::NoArtifactFound {
            label: label.to_string(),
        })?;

    info!(image_id = latest.id, description = %latest.description, "latest artifact");
    Ok(latest)
}
