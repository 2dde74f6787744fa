use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use rand::{rngs::StdRng, SeedableRng};
use uuid::Uuid;

use super::*;
use crate::{
    catalog::{Catalog, SyncedPhoto},
    notify::Notifier,
    source::MediaType,
    test_utils::{
        dest::MemoryDestination,
        log,
        photos::{creation_date, FakeAsset, FakePhotoSource},
        temp,
    },
};

fn seeded_catalog(count: usize) -> (Arc<Catalog>, MemoryDestination, Uuid) {
    log::init();

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());
    let dest = MemoryDestination::new();
    let destination_id = Uuid::new_v4();

    let rows: Vec<SyncedPhoto> = (0..count)
        .map(|n| {
            let remote_path = format!("2024/01/01/IMG-{n:04}.jpg");
            let bytes = vec![0u8; 100 + n];
            dest.seed_object(&remote_path, bytes);
            SyncedPhoto {
                id: Uuid::new_v4(),
                local_id: format!("asset-{n:04}"),
                destination_id,
                remote_path,
                checksum: "cd".repeat(32),
                sync_date: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                file_size: (100 + n) as u64,
                last_verified_date: None,
                file_metadata: None,
            }
        })
        .collect();
    catalog.upsert_synced_batch(&rows).unwrap();

    (catalog, dest, destination_id)
}

fn verifier(catalog: &Arc<Catalog>) -> VerificationEngine {
    VerificationEngine::new(Arc::clone(catalog), Notifier::default())
}

// A full scan sorts every row into exactly one bucket and stamps the healthy
// ones
#[tokio::test]
async fn full_scan_counts_and_stamps() {
    let (catalog, dest, destination_id) = seeded_catalog(20);

    // One gone, one lying about its size
    dest.remove_object("2024/01/01/IMG-0003.jpg");
    dest.corrupt_reported_size("2024/01/01/IMG-0007.jpg", 1);

    let report = verifier(&catalog)
        .verify_backup(&dest, destination_id, true)
        .await
        .unwrap();

    assert_eq!(report.job.total_photos, 20);
    assert_eq!(report.job.verified_count, 18);
    assert_eq!(report.job.missing_count, 1);
    assert_eq!(report.job.mismatch_count, 1);
    assert_eq!(report.job.error_count, 0);
    assert!(report.job.end_time.is_some());
    assert_eq!(report.failed_results().len(), 2);

    // Healthy rows got their verification date, the two bad ones did not
    let rows = catalog.get_synced_for_destination(destination_id).unwrap();
    let stamped = rows.iter().filter(|r| r.last_verified_date.is_some()).count();
    assert_eq!(stamped, 18);

    // The verification job row is durable
    let recent = catalog.recent_verification_jobs(5).unwrap();
    assert_eq!(recent[0].id, report.job.id);
    assert_eq!(recent[0].verified_count, 18);
}

#[tokio::test]
async fn full_scan_can_skip_stamping() {
    let (catalog, dest, destination_id) = seeded_catalog(5);

    verifier(&catalog)
        .verify_backup(&dest, destination_id, false)
        .await
        .unwrap();

    let rows = catalog.get_synced_for_destination(destination_id).unwrap();
    assert!(rows.iter().all(|r| r.last_verified_date.is_none()));
}

// S6: 100 rows, one corrupted remote object, sample of 10 with a fixed seed.
// The mismatch either lands in the sample or it doesn't; the counts must add
// up either way.
#[tokio::test]
async fn quick_verification_samples_uniformly() {
    let (catalog, dest, destination_id) = seeded_catalog(100);
    dest.corrupt_reported_size("2024/01/01/IMG-0042.jpg", 1);

    let mut rng = StdRng::seed_from_u64(0xBAC);
    let report = verifier(&catalog)
        .quick_verification(&dest, destination_id, 10, &mut rng)
        .await
        .unwrap();

    assert_eq!(report.job.total_photos, 10);
    assert_eq!(report.results.len(), 10);
    assert!(report.job.mismatch_count <= 1);
    assert!((9..=10).contains(&report.job.verified_count));
    assert_eq!(report.job.verified_count + report.job.mismatch_count, 10);

    // Sampling is without replacement
    let mut sampled: Vec<&str> = report
        .results
        .iter()
        .map(|r| r.photo.local_id.as_str())
        .collect();
    sampled.sort_unstable();
    sampled.dedup();
    assert_eq!(sampled.len(), 10);
}

#[tokio::test]
async fn quick_verification_handles_small_catalogs() {
    let (catalog, dest, destination_id) = seeded_catalog(3);

    let mut rng = StdRng::seed_from_u64(7);
    let report = verifier(&catalog)
        .quick_verification(&dest, destination_id, 10, &mut rng)
        .await
        .unwrap();

    assert_eq!(report.job.total_photos, 3);
    assert_eq!(report.job.verified_count, 3);
}

#[tokio::test]
async fn unverified_rows_are_null_or_stale() {
    let (catalog, _, destination_id) = seeded_catalog(3);

    let rows = catalog.get_synced_for_destination(destination_id).unwrap();
    // One freshly verified, one verified long ago, one never
    catalog
        .update_last_verified_batch(&[rows[0].id], Utc::now())
        .unwrap();
    catalog
        .update_last_verified_batch(&[rows[1].id], Utc::now() - Duration::days(60))
        .unwrap();

    let engine = verifier(&catalog);
    let unverified = engine
        .unverified_photos(destination_id, DEFAULT_REVERIFY_DAYS)
        .unwrap();
    let mut ids: Vec<Uuid> = unverified.iter().map(|r| r.id).collect();
    ids.sort_unstable();
    let mut expected = vec![rows[1].id, rows[2].id];
    expected.sort_unstable();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn gaps_split_into_unsynced_and_modified() {
    let (catalog, _, destination_id) = seeded_catalog(0);
    let (_guard, scratch) = temp::dir();

    let assets = vec![
        FakeAsset::sized("asset-a", "A.jpg", 512, creation_date(2024, 1, 1)),
        FakeAsset::sized("asset-b", "B.jpg", 512, creation_date(2024, 1, 2)),
        FakeAsset::sized("asset-c", "C.jpg", 512, creation_date(2024, 1, 3)),
    ];
    let source = FakePhotoSource::new(scratch, assets);

    // b is recorded and current, c is recorded but has been modified since
    let row = |local_id: &str, synced_at| SyncedPhoto {
        id: Uuid::new_v4(),
        local_id: local_id.to_owned(),
        destination_id,
        remote_path: format!("2024/01/01/{local_id}.jpg"),
        checksum: "ef".repeat(32),
        sync_date: synced_at,
        file_size: 512,
        last_verified_date: None,
        file_metadata: None,
    };
    catalog
        .upsert_synced_batch(&[
            row("asset-b", Utc::now()),
            row("asset-c", Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()),
        ])
        .unwrap();

    let report = verifier(&catalog)
        .detect_gaps(&source, destination_id, crate::source::DateRangeFilter::FullLibrary)
        .await
        .unwrap();

    assert_eq!(report.library_total, 3);
    assert_eq!(report.synced_total, 2);
    let unsynced: Vec<&str> = report.unsynced.iter().map(|p| p.local_id.as_str()).collect();
    assert_eq!(unsynced, vec!["asset-a"]);
    let modified: Vec<&str> = report.modified.iter().map(|p| p.local_id.as_str()).collect();
    assert_eq!(modified, vec!["asset-c"]);
    assert_eq!(report.unsynced[0].media_type, MediaType::Image);
}

// Repair clears the remote object (when it's still there) and the catalog
// row; the next backup run sees the photo as new again
#[tokio::test]
async fn reupload_planning_clears_bad_rows() {
    let (catalog, dest, destination_id) = seeded_catalog(10);
    dest.remove_object("2024/01/01/IMG-0001.jpg");
    dest.corrupt_reported_size("2024/01/01/IMG-0004.jpg", 1);

    let engine = verifier(&catalog);
    let report = engine
        .verify_backup(&dest, destination_id, false)
        .await
        .unwrap();
    let failed = report.failed_results();
    assert_eq!(failed.len(), 2);

    let cleared = engine.reupload_failed_photos(&failed, &dest).await.unwrap();
    assert_eq!(cleared, 2);

    // The corrupted object is deleted remotely, rows for both are gone
    assert!(dest.object("2024/01/01/IMG-0004.jpg").is_none());
    let remaining = catalog.get_synced_for_destination(destination_id).unwrap();
    assert_eq!(remaining.len(), 8);
    assert!(remaining
        .iter()
        .all(|r| r.local_id != "asset-0001" && r.local_id != "asset-0004"));
}

// Cancellation is observed between photos: a cancelled scan keeps whatever
// counters accrued and skips the rest
#[tokio::test(flavor = "multi_thread")]
async fn cancel_stops_mid_scan() {
    let (catalog, dest, destination_id) = seeded_catalog(50);
    dest.set_stat_delay(std::time::Duration::from_millis(20));

    let engine = Arc::new(VerificationEngine::new(
        Arc::clone(&catalog),
        Notifier::default(),
    ));

    let runner = tokio::spawn({
        let engine = Arc::clone(&engine);
        let dest = dest.clone();
        async move { engine.verify_backup(&dest, destination_id, false).await }
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    engine.cancel();

    let report = runner.await.unwrap().unwrap();
    let counted = report.job.verified_count
        + report.job.mismatch_count
        + report.job.missing_count
        + report.job.error_count;
    assert!(counted < 50, "cancel should cut the scan short: {counted}");
    assert_eq!(counted, report.results.len() as u64);
    assert!(report.job.end_time.is_some());
}
