use chrono::{DateTime, TimeZone, Utc};
use cloud_registry::fakes::MemoryCloud;
use cloud_registry::Label;
use image_lifecycle::{purge, reconcile, PurgeOutcome};

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

fn ours() -> Label {
    Label::provenance("imagectl")
}

#[tokio::test]
async fn test_untagged_images_survive_any_keep() {
    let cloud = MemoryCloud::new();
    for d in 1..=6 {
        cloud.register_snapshot("tagged", day(d), &[ours()]);
    }
    let foreign: Vec<_> = (1..=4)
        .map(|d| cloud.register_snapshot("manual", day(d), &[Label::provenance("operator")]))
        .collect();
    let bare = cloud.register_snapshot("bare", day(1), &[]);

    let report = reconcile(&cloud, &ours(), 2, false).await.unwrap();
    assert_eq!(report.deleted.len(), 4);
    assert_eq!(report.kept.len(), 2);

    let remaining: Vec<_> = cloud.images().iter().map(|i| i.id).collect();
    for id in foreign.iter().chain(std::iter::once(&bare)) {
        assert!(remaining.contains(id));
    }
}

#[tokio::test]
async fn test_second_run_deletes_nothing() {
    let cloud = MemoryCloud::new();
    for d in 1..=5 {
        cloud.register_snapshot("tagged", day(d), &[ours()]);
    }

    let first = reconcile(&cloud, &ours(), 3, false).await.unwrap();
    assert_eq!(first.deleted.len(), 2);

    let second = reconcile(&cloud, &ours(), 3, false).await.unwrap();
    assert!(second.deleted.is_empty());
    assert_eq!(second.kept, first.kept);
}

#[tokio::test]
async fn test_keep_zero_deletes_every_tagged_image() {
    let cloud = MemoryCloud::new();
    for d in 1..=3 {
        cloud.register_snapshot("tagged", day(d), &[ours()]);
    }
    let report = reconcile(&cloud, &ours(), 0, false).await.unwrap();
    assert_eq!(report.deleted.len(), 3);
    assert!(cloud.images().is_empty());
}

#[tokio::test]
async fn test_failed_delete_does_not_stop_the_rest() {
    let cloud = MemoryCloud::new();
    let ids: Vec<_> = (1..=5)
        .map(|d| cloud.register_snapshot("tagged", day(d), &[ours()]))
        .collect();
    // ids[1] is the newer of the two doomed images and is attempted first.
    cloud.fail_image_delete(ids[1]);

    let report = reconcile(&cloud, &ours(), 3, false).await.unwrap();
    assert_eq!(report.deleted, vec![ids[0]]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, ids[1]);
    assert!(!report.is_clean());
    assert_eq!(cloud.image_delete_calls(), vec![ids[1], ids[0]]);
}

#[tokio::test]
async fn test_dry_run_issues_no_deletes() {
    let cloud = MemoryCloud::new();
    for d in 1..=5 {
        cloud.register_snapshot("tagged", day(d), &[ours()]);
    }

    let report = reconcile(&cloud, &ours(), 3, true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.deleted.len(), 2);
    assert!(cloud.image_delete_calls().is_empty());
    assert_eq!(cloud.images().len(), 5);
}

#[tokio::test]
async fn test_listing_failure_is_an_error() {
    let cloud = MemoryCloud::new();
    cloud.fail_listing();
    assert!(reconcile(&cloud, &ours(), 3, false).await.is_err());
}

#[tokio::test]
async fn test_declined_purge_deletes_nothing() {
    let cloud = MemoryCloud::new();
    for d in 1..=2 {
        cloud.register_snapshot("tagged", day(d), &[ours()]);
    }

    let mut shown = 0;
    let outcome = purge(&cloud, &ours(), |candidates| {
        shown = candidates.len();
        false
    })
    .await
    .unwrap();

    assert_eq!(outcome, PurgeOutcome::Declined { candidates: 2 });
    assert_eq!(shown, 2);
    assert!(cloud.image_delete_calls().is_empty());
}

#[tokio::test]
async fn test_confirmed_purge_deletes_only_tagged() {
    let cloud = MemoryCloud::new();
    for d in 1..=3 {
        cloud.register_snapshot("tagged", day(d), &[ours()]);
    }
    let manual = cloud.register_snapshot("manual", day(4), &[]);

    let outcome = purge(&cloud, &ours(), |_| true).await.unwrap();
    match outcome {
        PurgeOutcome::Purged(report) => assert_eq!(report.deleted.len(), 3),
        other => panic!("expected Purged, got {other:?}"),
    }
    let remaining: Vec<_> = cloud.images().iter().map(|i| i.id).collect();
    assert_eq!(remaining, vec![manual]);
}

#[tokio::test]
async fn test_purge_of_empty_set_never_prompts() {
    let cloud = MemoryCloud::new();
    let outcome = purge(&cloud, &ours(), |_| panic!("should not prompt"))
        .await
        .unwrap();
    assert_eq!(outcome, PurgeOutcome::NothingToPurge);
}
