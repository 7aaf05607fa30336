//! End-to-end pipeline runs against in-memory collaborators.
//!
//! The build tool and ssh client paths point at empty files in a temp
//! directory so preflight passes without either being installed.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use cloud_registry::fakes::{CloudCall, MemoryCloud};
use cloud_registry::Label;
use image_lifecycle::fakes::{FakeBuildTool, ScriptedShell};
use image_lifecycle::{BootWait, LifecycleError, Pipeline, PipelineConfig, Stage};
use tempfile::TempDir;

fn offline_config(dir: &TempDir) -> PipelineConfig {
    let tool = dir.path().join("packer");
    let ssh = dir.path().join("ssh");
    std::fs::write(&tool, b"").unwrap();
    std::fs::write(&ssh, b"").unwrap();

    let mut config = PipelineConfig::default()
        .with_token("test-token")
        .with_boot_wait(BootWait::Fixed { secs: 0 });
    config.build.tool = tool;
    config.build.template_dir = dir.path().to_path_buf();
    config.verify.ssh.binary = ssh;
    config
}

fn ours() -> Label {
    Label::provenance("imagectl")
}

#[tokio::test]
async fn test_build_without_registered_artifact_aborts_before_verify() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MemoryCloud::new());
    // Build "succeeds" but registers nothing.
    let pipeline = Pipeline::new(
        offline_config(&dir),
        cloud.clone(),
        Arc::new(FakeBuildTool::succeeding()),
        Arc::new(ScriptedShell::reachable()),
    );

    let err = pipeline.run_all().await.unwrap_err();
    assert!(matches!(err, LifecycleError::NoArtifactFound { .. }));

    let calls = cloud.calls();
    assert!(!calls
        .iter()
        .any(|c| matches!(c, CloudCall::CreateServer(_) | CloudCall::DeleteImage(_))));
}

#[tokio::test]
async fn test_full_run_with_unreachable_instance_still_reconciles() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MemoryCloud::new());
    let old = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
    let mut seeded = Vec::new();
    for i in 0..4 {
        seeded.push(cloud.register_snapshot("old", old + Duration::days(i), &[ours()]));
    }

    let shell = Arc::new(ScriptedShell::refusing());
    let pipeline = Pipeline::new(
        offline_config(&dir),
        cloud.clone(),
        Arc::new(FakeBuildTool::registering_into(cloud.clone(), ours())),
        shell.clone(),
    );

    let report = pipeline.run_all().await.expect("probe failures are not fatal");

    let verification = report.verification.as_ref().unwrap();
    assert!(!verification.ssh_reachable);
    assert!(verification.cleaned_up());
    assert_eq!(cloud.server_delete_calls().len(), 1);
    assert!(cloud.servers().is_empty());

    // Fresh build plus the two newest seeded images survive.
    let reconciled = report.reconcile.as_ref().unwrap();
    assert_eq!(reconciled.kept.len(), 3);
    assert_eq!(reconciled.deleted, vec![seeded[1], seeded[0]]);
    assert!(reconciled.kept.contains(&report.artifact.as_ref().unwrap().id));

    for stage in [
        Stage::Preflight,
        Stage::Build,
        Stage::Discover,
        Stage::Verify,
        Stage::Reconcile,
    ] {
        assert!(report.ran(stage), "{stage:?} did not run");
    }
}

#[tokio::test]
async fn test_retention_keeps_three_newest_of_five() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MemoryCloud::new());
    let t = |d| Utc.with_ymd_and_hms(2024, 6, d, 12, 0, 0).unwrap();
    let ids: Vec<_> = (1..=5)
        .map(|d| cloud.register_snapshot(&format!("T{d}"), t(d), &[ours()]))
        .collect();
    let manual = cloud.register_snapshot("hand-made", t(1), &[]);

    let pipeline = Pipeline::new(
        offline_config(&dir),
        cloud.clone(),
        Arc::new(FakeBuildTool::succeeding()),
        Arc::new(ScriptedShell::reachable()),
    );

    let report = pipeline.clean(false).await.unwrap();
    let reconciled = report.reconcile.unwrap();
    assert_eq!(reconciled.kept, vec![ids[4], ids[3], ids[2]]);
    assert_eq!(reconciled.deleted, vec![ids[1], ids[0]]);

    let remaining: Vec<_> = cloud.images().iter().map(|i| i.id).collect();
    assert!(remaining.contains(&manual));
    assert_eq!(remaining.len(), 4);
}

#[tokio::test]
async fn test_build_failure_stops_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MemoryCloud::new());
    let pipeline = Pipeline::new(
        offline_config(&dir),
        cloud.clone(),
        Arc::new(FakeBuildTool::failing_at(
            image_lifecycle::BuildVerb::Build,
            "builder crashed",
        )),
        Arc::new(ScriptedShell::reachable()),
    );

    let err = pipeline.run_all().await.unwrap_err();
    assert!(matches!(err, LifecycleError::ToolFailed { .. }));
    assert!(cloud.calls().is_empty());
}

#[tokio::test]
async fn test_build_command_reports_new_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let cloud = Arc::new(MemoryCloud::new());
    let pipeline = Pipeline::new(
        offline_config(&dir),
        cloud.clone(),
        Arc::new(FakeBuildTool::registering_into(cloud.clone(), ours())),
        Arc::new(ScriptedShell::reachable()),
    );

    let report = pipeline.build().await.unwrap();
    let artifact = report.artifact.clone().unwrap();
    assert_eq!(Some(artifact.description), report.image_name);
    assert!(!report.ran(Stage::Verify));
    assert!(cloud.servers().is_empty());
}

#[tokio::test]
async fn test_missing_prerequisites_touch_nothing() {
    let cloud = Arc::new(MemoryCloud::new());
    let mut config = PipelineConfig::default();
    config.build.template_dir = "/nonexistent/template".into();

    let pipeline = Pipeline::new(
        config,
        cloud.clone(),
        Arc::new(FakeBuildTool::succeeding()),
        Arc::new(ScriptedShell::reachable()),
    );

    let err = pipeline.run_all().await.unwrap_err();
    match err {
        LifecycleError::Config(problems) => assert!(problems.len() >= 2),
        other => panic!("expected Config, got {other:?}"),
    }
    assert!(cloud.calls().is_empty());
}
