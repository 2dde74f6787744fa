use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use uuid::Uuid;

use super::*;
use crate::{
    catalog::Catalog,
    dest::TransferTuning,
    encryption::Encryptor,
    notify::Notifier,
    source::{DateRangeFilter, MediaType, PhotoMetadata},
    test_utils::{
        dest::MemoryDestination,
        log,
        photos::{creation_date, FakeAsset, FakePhotoSource},
        store::MemorySecureStore,
        temp,
    },
};

const KIB: usize = 1_024;

/// The spec scenario sizes scaled down 1024x so tests stay quick: the
/// threshold sits at 50 KiB with 10 KiB parts, and "B" weighs 60 KiB
fn scaled_tuning() -> TransferTuning {
    TransferTuning {
        multipart_threshold: 50 * KIB as u64,
        part_size: 10 * KIB as u64,
        max_part_retries: 3,
    }
}

fn scenario_assets() -> Vec<FakeAsset> {
    vec![
        FakeAsset::sized("asset-a", "A.jpg", KIB, creation_date(2024, 1, 1)),
        FakeAsset::sized("asset-b", "B.mov", 60 * KIB, creation_date(2024, 1, 2)),
        FakeAsset::sized("asset-c", "C.jpg", 2 * KIB, creation_date(2024, 1, 3)),
    ]
}

struct Harness {
    _scratch: TempDir,
    catalog: Arc<Catalog>,
    engine: Arc<SyncEngine>,
    dest: MemoryDestination,
    source: FakePhotoSource,
    destination_id: Uuid,
    scratch_path: std::path::PathBuf,
}

impl Harness {
    fn new(assets: Vec<FakeAsset>) -> Self {
        log::init();

        let (scratch, scratch_path) = temp::dir();
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let encryptor = Encryptor::new(Arc::new(MemorySecureStore::default()));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&catalog),
            encryptor,
            Notifier::default(),
        ));

        Self {
            _scratch: scratch,
            catalog,
            engine,
            dest: MemoryDestination::with_tuning(scaled_tuning()),
            source: FakePhotoSource::new(scratch_path.clone(), assets),
            destination_id: Uuid::new_v4(),
            scratch_path,
        }
    }

    async fn run(&self, options: SyncOptions) -> Result<crate::catalog::SyncJob, SyncError> {
        let mut backend = self.dest.clone();
        self.engine
            .run_backup(&self.source, &mut backend, self.destination_id, options)
            .await
    }

    fn rows(&self) -> Vec<crate::catalog::SyncedPhoto> {
        self.catalog
            .get_synced_for_destination(self.destination_id)
            .unwrap()
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(&self.scratch_path)
            .map(|entries| entries.count() == 0)
            .unwrap_or(true)
    }
}

// S1: three fresh photos land with dated remote paths and the big one takes
// the multipart path
#[tokio::test]
async fn fresh_backup_uploads_everything() {
    let harness = Harness::new(scenario_assets());

    let job = harness.run(SyncOptions::default()).await.unwrap();

    assert_eq!(job.photos_scanned, 3);
    assert_eq!(job.photos_synced, 3);
    assert_eq!(job.photos_failed, 0);
    assert_eq!(job.status, crate::catalog::JobStatus::Completed);
    assert_eq!(job.bytes_transferred, 63 * KIB as u64);
    assert!(job.end_time.is_some());

    assert_eq!(
        harness.dest.object_paths(),
        vec![
            "2024/01/01/A.jpg".to_owned(),
            "2024/01/02/B.mov".to_owned(),
            "2024/01/03/C.jpg".to_owned(),
        ],
    );
    assert_eq!(harness.dest.was_multipart("2024/01/02/B.mov"), Some(true));
    assert_eq!(harness.dest.was_multipart("2024/01/01/A.jpg"), Some(false));

    let rows = harness.rows();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.destination_id, harness.destination_id);
        assert!(row.last_verified_date.is_none());
        assert!(row.file_metadata.is_some());
    }

    assert!(harness.scratch_is_empty(), "export temps must be cleaned up");
}

// S2: an unchanged library costs no uploads on the next run
#[tokio::test]
async fn rerun_with_no_changes_skips_everything() {
    let harness = Harness::new(scenario_assets());

    harness.run(SyncOptions::default()).await.unwrap();
    let exports_after_first = harness.source.export_count();
    let uploads_after_first = harness.dest.upload_count();

    let job = harness.run(SyncOptions::default()).await.unwrap();

    assert_eq!(job.photos_scanned, 3);
    assert_eq!(job.photos_synced, 0);
    assert_eq!(job.status, crate::catalog::JobStatus::Completed);
    assert_eq!(harness.source.export_count(), exports_after_first);
    assert_eq!(harness.dest.upload_count(), uploads_after_first);
}

// S3: deleting a remote object out of band gets caught by dedup's remote
// verification and only that photo is re-uploaded
#[tokio::test]
async fn out_of_band_deletion_triggers_reupload() {
    let harness = Harness::new(scenario_assets());
    harness.run(SyncOptions::default()).await.unwrap();

    assert!(harness.dest.remove_object("2024/01/02/B.mov"));

    let job = harness.run(SyncOptions::default()).await.unwrap();
    assert_eq!(job.photos_synced, 1);
    assert!(harness.dest.object("2024/01/02/B.mov").is_some());
}

// S4: bumping a photo's modification date past its sync date re-uploads just
// that photo
#[tokio::test]
async fn modified_photo_is_resynced() {
    let harness = Harness::new(scenario_assets());
    harness.run(SyncOptions::default()).await.unwrap();

    harness
        .source
        .touch("asset-a", Utc::now() + chrono::Duration::hours(1));

    let job = harness.run(SyncOptions::default()).await.unwrap();
    assert_eq!(job.photos_synced, 1);
    assert_eq!(job.photos_scanned, 3);
}

// S5: a crashed session leaves a stale running job and a partial catalog; the
// next session fails the job and a new run picks up the remaining photos
#[tokio::test]
async fn crash_recovery_resumes_where_it_left_off() {
    let harness = Harness::new(vec![scenario_assets().into_iter().next().unwrap()]);

    // First "session" backs up only photo A, then "crashes" with a job row
    // still marked running
    harness.run(SyncOptions::default()).await.unwrap();
    let stale = crate::catalog::SyncJob::started(harness.destination_id, Utc::now());
    harness.catalog.create_job(&stale).unwrap();

    // Next session startup
    assert_eq!(harness.catalog.cleanup_stale_jobs().unwrap(), 1);
    let recovered = harness.catalog.get_job(stale.id).unwrap().unwrap();
    assert_eq!(recovered.status, crate::catalog::JobStatus::Failed);
    assert!(recovered.end_time.is_some());

    // The library now has all three photos; only the missing two move
    let full = Harness {
        source: FakePhotoSource::new(harness.scratch_path.clone(), scenario_assets()),
        ..harness
    };
    let job = full.run(SyncOptions::default()).await.unwrap();
    assert_eq!(job.photos_scanned, 3);
    assert_eq!(job.photos_synced, 2);
    assert_eq!(full.rows().len(), 3);
}

// Invariant: the dedup plan partitions the library into disjoint sets and
// only skips photos whose remote object checks out
#[tokio::test]
async fn plan_partitions_disjointly() {
    log::init();

    let dest = MemoryDestination::new();
    let (_guard, dir) = temp::dir();
    let probe = dir.join("probe.bin");
    std::fs::write(&probe, vec![0u8; 512]).unwrap();

    let mut backend = dest.clone();
    use crate::dest::{noop_progress, DestinationBackend};
    backend.connect().await.unwrap();
    backend
        .upload(&probe, "2024/01/01/verified.jpg", noop_progress())
        .await
        .unwrap();
    backend
        .upload(&probe, "2024/01/01/corrupted.jpg", noop_progress())
        .await
        .unwrap();
    dest.corrupt_reported_size("2024/01/01/corrupted.jpg", 9);

    let meta = |local_id: &str| PhotoMetadata {
        local_id: local_id.to_owned(),
        creation_date: Some(creation_date(2024, 1, 1)),
        modification_date: Some(creation_date(2024, 1, 1)),
        media_type: MediaType::Image,
        pixel_width: 100,
        pixel_height: 100,
        original_filename: Some(format!("{local_id}.jpg")),
        file_size: Some(512),
    };
    let row = |local_id: &str, remote_path: &str| crate::catalog::SyncedPhoto {
        id: Uuid::new_v4(),
        local_id: local_id.to_owned(),
        destination_id: Uuid::new_v4(),
        remote_path: remote_path.to_owned(),
        checksum: "ab".repeat(32),
        sync_date: creation_date(2024, 1, 2),
        file_size: 512,
        last_verified_date: None,
        file_metadata: None,
    };

    let photos = vec![meta("new"), meta("modified"), meta("verified"), meta("corrupted"), meta("missing")];
    let mut synced = HashMap::new();
    let mut modified_row = row("modified", "2024/01/01/modified.jpg");
    modified_row.sync_date = creation_date(2023, 12, 1);
    synced.insert("modified".to_owned(), modified_row);
    synced.insert("verified".to_owned(), row("verified", "2024/01/01/verified.jpg"));
    synced.insert("corrupted".to_owned(), row("corrupted", "2024/01/01/corrupted.jpg"));
    synced.insert("missing".to_owned(), row("missing", "2024/01/01/missing.jpg"));

    let plan = plan(photos, &synced, &backend).await;

    let of = |reason: PlanReason| {
        let mut ids: Vec<&str> = plan
            .queue
            .iter()
            .filter(|p| p.reason == reason)
            .map(|p| p.photo.local_id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    };
    assert_eq!(of(PlanReason::New), vec!["new"]);
    assert_eq!(of(PlanReason::Modified), vec!["modified"]);
    assert_eq!(of(PlanReason::RemoteVerifyFailed), vec!["corrupted", "missing"]);
    let skipped: Vec<&str> = plan.skipped.iter().map(|p| p.local_id.as_str()).collect();
    assert_eq!(skipped, vec!["verified"]);
    assert_eq!(plan.queue.len() + plan.skipped.len(), 5);
}

// Invariant: whatever the interleaving of control calls, at most one job is
// ever running or paused
#[tokio::test(flavor = "multi_thread")]
async fn only_one_job_at_a_time() {
    let assets: Vec<FakeAsset> = (0..30)
        .map(|n| {
            FakeAsset::sized(
                &format!("asset-{n:02}"),
                &format!("IMG-{n:02}.jpg"),
                KIB,
                creation_date(2024, 1, 1),
            )
        })
        .collect();
    let harness = Harness::new(assets);
    harness.dest.set_upload_delay(Duration::from_millis(50));

    let engine = Arc::clone(&harness.engine);
    let source = harness.source.clone();
    let mut backend = harness.dest.clone();
    let destination_id = harness.destination_id;
    let runner = tokio::spawn(async move {
        engine
            .run_backup(&source, &mut backend, destination_id, SyncOptions::default())
            .await
    });

    // Wait for the run to get going, then freeze it at the photo boundary
    let mut waited = Duration::ZERO;
    while harness.engine.state() != EngineState::Syncing && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += Duration::from_millis(5);
    }
    harness.engine.pause().unwrap();
    assert_eq!(harness.engine.state(), EngineState::Paused);
    // Pausing twice is a no-op, not an error
    harness.engine.pause().unwrap();

    let second = harness.run(SyncOptions::default()).await;
    assert!(matches!(second, Err(SyncError::AlreadyRunning)));

    harness.engine.resume().unwrap();
    let job = runner.await.unwrap().unwrap();
    assert_eq!(job.photos_synced, 30);

    // With the slot free, control calls have nothing to act on
    assert!(matches!(harness.engine.pause(), Err(SyncError::NotRunning)));
    assert!(matches!(harness.engine.resume(), Err(SyncError::NotRunning)));
    assert!(matches!(harness.engine.cancel(), Err(SyncError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_stops_at_a_photo_boundary() {
    let assets: Vec<FakeAsset> = (0..20)
        .map(|n| {
            FakeAsset::sized(
                &format!("asset-{n:02}"),
                &format!("IMG-{n:02}.jpg"),
                KIB,
                creation_date(2024, 1, 1),
            )
        })
        .collect();
    let harness = Harness::new(assets);
    harness.dest.set_upload_delay(Duration::from_millis(50));

    let engine = Arc::clone(&harness.engine);
    let source = harness.source.clone();
    let mut backend = harness.dest.clone();
    let destination_id = harness.destination_id;
    let runner = tokio::spawn(async move {
        engine
            .run_backup(&source, &mut backend, destination_id, SyncOptions::default())
            .await
    });

    let mut waited = Duration::ZERO;
    while harness.engine.state() != EngineState::Syncing && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += Duration::from_millis(5);
    }
    harness.engine.cancel().unwrap();

    let job = runner.await.unwrap().unwrap();
    assert_eq!(job.status, crate::catalog::JobStatus::Cancelled);
    assert!(job.photos_synced <= 20);
    // Catalog rows exist exactly for the photos that finished
    assert_eq!(harness.rows().len() as u64, job.photos_synced);
    assert!(harness.scratch_is_empty(), "cancel must not orphan temp files");
}

// A photo that fails mid-pipeline becomes a SyncError row and a failure count,
// not a dead job
#[tokio::test]
async fn per_photo_failures_do_not_abort_the_job() {
    let harness = Harness::new(scenario_assets());
    harness.dest.poison("B.mov");

    let job = harness.run(SyncOptions::default()).await.unwrap();

    assert_eq!(job.status, crate::catalog::JobStatus::Completed);
    assert_eq!(job.photos_synced, 2);
    assert_eq!(job.photos_failed, 1);

    let errors = harness.catalog.errors_for_job(job.id).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].photo_id, "asset-b");
    assert_eq!(errors[0].error_category, "network");
    assert!(harness.scratch_is_empty());
}

#[tokio::test]
async fn encrypted_uploads_carry_the_suffix_and_round_trip() {
    let harness = Harness::new(vec![FakeAsset::sized(
        "asset-a",
        "A.jpg",
        4 * KIB,
        creation_date(2024, 1, 1),
    )]);

    // Wire an encryptor that the test can also decrypt with
    let store = Arc::new(MemorySecureStore::default());
    let encryptor = Encryptor::new(store.clone());
    encryptor.setup("correct horse battery").unwrap();
    let engine = SyncEngine::new(
        Arc::clone(&harness.catalog),
        encryptor.clone(),
        Notifier::default(),
    );

    let mut backend = harness.dest.clone();
    let options = SyncOptions {
        encrypt: true,
        ..Default::default()
    };
    let job = engine
        .run_backup(&harness.source, &mut backend, harness.destination_id, options)
        .await
        .unwrap();
    assert_eq!(job.photos_synced, 1);

    let remote_path = "2024/01/01/A.jpg.encrypted";
    let rows = harness.rows();
    assert_eq!(rows[0].remote_path, remote_path);

    let sealed = harness.dest.object(remote_path).unwrap();
    // nonce + body + tag
    assert_eq!(sealed.len(), 12 + 4 * KIB + 16);
    assert_eq!(rows[0].file_size, sealed.len() as u64);

    let plaintext = encryptor.decrypt_bytes(&sealed).unwrap();
    assert_eq!(plaintext.len(), 4 * KIB);
    assert!(harness.scratch_is_empty());
}

// An empty library is a refusal, not a vacuous success
#[tokio::test]
async fn empty_library_refuses_to_run() {
    let harness = Harness::new(Vec::new());

    let result = harness.run(SyncOptions::default()).await;
    assert!(matches!(result, Err(SyncError::NoPhotosToSync)));

    let recent = harness.catalog.recent_jobs(5).unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, crate::catalog::JobStatus::Failed);
}

// Invariant: buffered logs are durable after 50 entries or 5 seconds,
// whichever comes first
#[tokio::test(start_paused = true)]
async fn log_flush_liveness() {
    log::init();

    let catalog = Arc::new(Catalog::open_in_memory().unwrap());

    // Threshold path: the 50th entry flushes synchronously
    let buffer = LogBuffer::new(Arc::clone(&catalog), crate::catalog::LogStream::Sync);
    for n in 0..FLUSH_THRESHOLD {
        buffer.push(crate::catalog::LogEntry::new(
            None,
            crate::catalog::LogLevel::Info,
            "test",
            format!("entry {n}"),
        ));
    }
    assert_eq!(
        catalog
            .recent_logs(crate::catalog::LogStream::Sync, 100)
            .unwrap()
            .len(),
        FLUSH_THRESHOLD,
    );

    // Timer path: one lonely entry becomes durable once the flusher fires
    let buffer = LogBuffer::new(Arc::clone(&catalog), crate::catalog::LogStream::Verification);
    let _flusher = buffer.spawn_flusher();
    buffer.push(crate::catalog::LogEntry::new(
        None,
        crate::catalog::LogLevel::Info,
        "test",
        "lonely entry".to_owned(),
    ));
    tokio::time::advance(FLUSH_INTERVAL + Duration::from_millis(100)).await;
    // Let the flusher task actually run
    tokio::task::yield_now().await;
    assert_eq!(
        catalog
            .recent_logs(crate::catalog::LogStream::Verification, 100)
            .unwrap()
            .len(),
        1,
    );
    _flusher.abort();
}

// The remote path scheme: dated folders, original or obfuscated or
// synthesized filenames, `.encrypted` suffix
#[test]
fn remote_paths_follow_the_scheme() {
    let mut photo = PhotoMetadata {
        local_id: "ABC123/L0/001".to_owned(),
        creation_date: Some(creation_date(2024, 3, 9)),
        modification_date: None,
        media_type: MediaType::Image,
        pixel_width: 100,
        pixel_height: 100,
        original_filename: Some("IMG_0042.HEIC".to_owned()),
        file_size: None,
    };

    assert_eq!(remote_path_for(&photo, false, false), "2024/03/09/IMG_0042.HEIC");
    assert_eq!(
        remote_path_for(&photo, false, true),
        "2024/03/09/IMG_0042.HEIC.encrypted"
    );

    // Obfuscation swaps the name for a fresh uuid but keeps the extension
    let obfuscated = remote_path_for(&photo, true, false);
    assert!(obfuscated.starts_with("2024/03/09/"));
    assert!(obfuscated.ends_with(".heic"));
    assert!(!obfuscated.contains("IMG_0042"));

    // No filename: sanitize the local id and synthesize an extension
    photo.original_filename = None;
    assert_eq!(remote_path_for(&photo, false, false), "2024/03/09/ABC123-L0-001.jpg");

    // No creation date: the literal `unknown` folder
    photo.creation_date = None;
    assert_eq!(remote_path_for(&photo, false, false), "unknown/ABC123-L0-001.jpg");
}
