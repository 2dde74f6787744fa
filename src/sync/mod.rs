//! The sync engine: one backup job at a time, many photos in flight
//!
//! A job walks `preparing -> syncing -> (paused <-> syncing) -> terminal`.
//! Preparation connects the destination, enumerates the library, and plans
//! the dedup; the transfer phase runs export -> (encrypt) -> upload workers
//! with bounded concurrency. Control events (pause/resume/cancel) are plain
//! flags observed at photo boundaries, so an in-flight photo always finishes
//! cleanly and temp files never outlive their photo.

mod logbuf;
mod plan;
mod progress;
#[cfg(test)]
mod tests;

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    catalog::{
        Catalog, CatalogError, JobStatus, LogEntry, LogLevel, LogStream, SyncErrorRecord, SyncJob,
        SyncedPhoto,
    },
    dest::{noop_progress, DestError, DestinationBackend},
    encryption::{EncryptionError, Encryptor},
    metrics::{counter, histogram, HistTag},
    notify::{NotificationEvent, Notifier},
    source::{DateRangeFilter, PhotoSource, SourceError},
    utils,
};

pub use self::logbuf::{LogBuffer, FLUSH_INTERVAL, FLUSH_THRESHOLD};
pub use self::plan::{is_modified, plan, remote_path_for, PlanReason, PlannedPhoto, SyncPlan};
pub use self::progress::{EngineState, ProgressSnapshot, ProgressTracker};

/// Paused workers re-check the flag this often
const PAUSE_POLL: Duration = Duration::from_millis(500);

const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a sync job is already running")]
    AlreadyRunning,
    #[error("no sync job is running")]
    NotRunning,
    #[error("the library has no photos matching the filter")]
    NoPhotosToSync,
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Destination(#[from] DestError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncOptions {
    pub filter: DateRangeFilter,
    /// Transfer workers in flight at once, clamped to 1..=10
    pub concurrency: usize,
    pub encrypt: bool,
    pub obfuscate_filenames: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            filter: DateRangeFilter::FullLibrary,
            concurrency: 3,
            encrypt: false,
            obfuscate_filenames: false,
        }
    }
}

/// Everything that can sink a single photo without sinking the job
#[derive(Debug, thiserror::Error)]
enum PhotoFailure {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Destination(#[from] DestError),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error("temp file handling failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl PhotoFailure {
    /// Total classifier used for aggregate error reporting
    fn category(&self) -> &'static str {
        match self {
            Self::Source(_) => "source",
            Self::Destination(DestError::AuthFailed) => "auth",
            Self::Destination(DestError::InvalidConfig(_) | DestError::FileNotFound(_)) => "io",
            Self::Destination(_) => "network",
            Self::Encryption(_) => "encryption",
            Self::Io(_) | Self::Catalog(_) => "io",
        }
    }
}

enum Outcome {
    Synced { local_id: String, bytes: u64 },
    Failed { local_id: String, failure: PhotoFailure },
    Cancelled,
}

/// Deletes the export/encrypt temp files on every exit path
#[derive(Default)]
struct TempGuard(Vec<PathBuf>);

impl TempGuard {
    fn add(&mut self, path: PathBuf) {
        self.0.push(path);
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[derive(Default)]
struct Controls {
    pause: AtomicBool,
    cancel: AtomicBool,
}

pub struct SyncEngine {
    catalog: Arc<Catalog>,
    encryptor: Encryptor,
    notifier: Notifier,
    progress: ProgressTracker,
    controls: Controls,
    /// Id of the job currently `running | paused`; enforces at-most-one
    active: Mutex<Option<Uuid>>,
}

/// Releases the active-job slot and resets control flags on every exit path
struct ActiveGuard<'a>(&'a SyncEngine);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.0.active.lock() = None;
        self.0.controls.pause.store(false, Ordering::Relaxed);
        self.0.controls.cancel.store(false, Ordering::Relaxed);
    }
}

/// Kills the periodic log flusher when the job winds down
struct FlusherGuard(JoinHandle<()>);

impl Drop for FlusherGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl SyncEngine {
    pub fn new(catalog: Arc<Catalog>, encryptor: Encryptor, notifier: Notifier) -> Self {
        Self {
            catalog,
            encryptor,
            notifier,
            progress: ProgressTracker::default(),
            controls: Controls::default(),
            active: Mutex::new(None),
        }
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.progress.state()
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Takes effect at the next photo boundary; in-flight uploads finish
    pub fn pause(&self) -> Result<(), SyncError> {
        match self.progress.state() {
            EngineState::Syncing => {
                self.controls.pause.store(true, Ordering::Relaxed);
                self.progress.update(|snapshot| snapshot.state = EngineState::Paused);
                self.notifier.send(NotificationEvent::BackupPaused);
                Ok(())
            }
            EngineState::Paused => Ok(()),
            _ => Err(SyncError::NotRunning),
        }
    }

    pub fn resume(&self) -> Result<(), SyncError> {
        match self.progress.state() {
            EngineState::Paused => {
                self.controls.pause.store(false, Ordering::Relaxed);
                self.progress.update(|snapshot| snapshot.state = EngineState::Syncing);
                Ok(())
            }
            EngineState::Syncing => Ok(()),
            _ => Err(SyncError::NotRunning),
        }
    }

    /// Workers notice at photo boundaries; the job lands as `cancelled`
    pub fn cancel(&self) -> Result<(), SyncError> {
        match self.progress.state() {
            EngineState::Syncing | EngineState::Paused => {
                self.controls.cancel.store(true, Ordering::Relaxed);
                // Unblock anyone sleeping in the pause loop
                self.controls.pause.store(false, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(SyncError::NotRunning),
        }
    }

    pub async fn run_backup<B: DestinationBackend>(
        &self,
        source: &dyn PhotoSource,
        backend: &mut B,
        destination_id: Uuid,
        options: SyncOptions,
    ) -> Result<SyncJob, SyncError> {
        let mut job = SyncJob::started(destination_id, Utc::now());

        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(SyncError::AlreadyRunning);
            }
            *active = Some(job.id);
        }
        let _slot = ActiveGuard(self);

        // A catalog that can't even record the job is fatal to the run
        self.catalog.create_job(&job)?;

        self.progress.update(|snapshot| {
            *snapshot = ProgressSnapshot {
                state: EngineState::Preparing,
                ..Default::default()
            }
        });
        self.notifier
            .send(NotificationEvent::BackupStarted { destination_id });

        let logs = LogBuffer::new(Arc::clone(&self.catalog), LogStream::Sync);
        let _flusher = FlusherGuard(logs.spawn_flusher());

        logs.push(LogEntry::new(
            Some(job.id),
            LogLevel::Info,
            "connection",
            "Connecting to destination".to_owned(),
        ));
        if let Err(err) = backend.connect().await {
            self.fail_job(&mut job, &logs, &format!("Destination connection failed: {err:#}"));
            return Err(err.into());
        }
        logs.push(LogEntry::new(
            Some(job.id),
            LogLevel::Info,
            "connection",
            "Connected to destination".to_owned(),
        ));

        let photos = match source.fetch_photos(options.filter).await {
            Ok(photos) => photos,
            Err(err) => {
                self.fail_job(&mut job, &logs, &format!("Library enumeration failed: {err:#}"));
                let _ = backend.disconnect().await;
                return Err(err.into());
            }
        };
        if photos.is_empty() {
            self.fail_job(&mut job, &logs, "The library has no photos matching the filter");
            let _ = backend.disconnect().await;
            return Err(SyncError::NoPhotosToSync);
        }
        job.photos_scanned = photos.len() as u64;

        // Dedup against the catalog, then against the destination itself
        let local_ids: Vec<String> = photos.iter().map(|p| p.local_id.clone()).collect();
        let synced_map = match self.catalog.batch_get_synced(&local_ids, destination_id) {
            Ok(map) => map,
            Err(err) => {
                // Degraded but survivable: everything will look new and the
                // upserts will straighten the rows back out
                warn!("Catalog lookup failed during dedup, treating all photos as new: {err:#}");
                Default::default()
            }
        };
        let sync_plan = plan::plan(photos, &synced_map, &*backend).await;
        info!(
            "Planned backup: {} new, {} modified, {} failed remote verification, {} skipped",
            sync_plan.count(PlanReason::New),
            sync_plan.count(PlanReason::Modified),
            sync_plan.count(PlanReason::RemoteVerifyFailed),
            sync_plan.skipped.len(),
        );
        logs.push(LogEntry::new(
            Some(job.id),
            LogLevel::Info,
            "plan",
            format!(
                "{} of {} photos need backup",
                sync_plan.queue.len(),
                job.photos_scanned,
            ),
        ));
        self.progress.update(|snapshot| {
            snapshot.total_photos = sync_plan.queue.len() as u64;
            snapshot.skipped_photos = sync_plan.skipped.len() as u64;
        });

        if sync_plan.queue.is_empty() {
            self.finish_job(&mut job, &logs, JobStatus::Completed);
            let _ = backend.disconnect().await;
            return Ok(job);
        }

        self.progress
            .update(|snapshot| snapshot.state = EngineState::Syncing);

        let width = options.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        let started = Instant::now();
        let job_id = job.id;
        let backend_ref: &B = backend;
        let mut outcomes = futures::stream::iter(sync_plan.queue)
            .map(|planned| {
                self.process_photo(planned, source, backend_ref, destination_id, &options, &logs, job_id)
            })
            .buffer_unordered(width);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Outcome::Synced { local_id, bytes } => {
                    job.photos_synced += 1;
                    job.bytes_transferred += bytes;
                    logs.push(
                        LogEntry::new(
                            Some(job.id),
                            LogLevel::Success,
                            "upload",
                            "Photo backed up".to_owned(),
                        )
                        .with_photo(local_id),
                    );
                }
                Outcome::Failed { local_id, failure } => {
                    job.photos_failed += 1;
                    let category = failure.category();
                    let rendered = format!("{failure:#}");
                    if let Err(err) = self.catalog.record_sync_error(&SyncErrorRecord {
                        id: Uuid::new_v4(),
                        job_id: job.id,
                        photo_id: local_id.clone(),
                        error_message: rendered.clone(),
                        error_category: category.to_owned(),
                        timestamp: Utc::now(),
                        retry_count: 0,
                    }) {
                        warn!("Failed recording sync error: {err:#}");
                    }
                    logs.push(
                        LogEntry::new(
                            Some(job.id),
                            LogLevel::Error,
                            category,
                            rendered,
                        )
                        .with_photo(local_id),
                    );
                }
                Outcome::Cancelled => {}
            }

            let elapsed = started.elapsed();
            if !elapsed.is_zero() && job.bytes_transferred > 0 {
                job.average_speed =
                    Some(utils::u64_in_mib(job.bytes_transferred) / elapsed.as_secs_f64());
            }
            let job_view = job.clone();
            let eta = estimate_remaining(elapsed, &job_view, self.progress.snapshot().total_photos);
            self.progress.update(|snapshot| {
                snapshot.completed_photos = job_view.photos_synced;
                snapshot.failed_photos = job_view.photos_failed;
                snapshot.bytes_transferred = job_view.bytes_transferred;
                snapshot.average_speed_mib_s = job_view.average_speed;
                snapshot.estimated_remaining = eta;
            });
        }
        drop(outcomes);

        let status = if self.controls.cancel.load(Ordering::Relaxed) {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        self.finish_job(&mut job, &logs, status);
        let _ = backend.disconnect().await;
        Ok(job)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_photo<B: DestinationBackend>(
        &self,
        planned: PlannedPhoto,
        source: &dyn PhotoSource,
        backend: &B,
        destination_id: Uuid,
        options: &SyncOptions,
        logs: &Arc<LogBuffer>,
        job_id: Uuid,
    ) -> Outcome {
        // Photo boundary: sleep through a pause, bail on a cancel
        while self.controls.pause.load(Ordering::Relaxed)
            && !self.controls.cancel.load(Ordering::Relaxed)
        {
            tokio::time::sleep(PAUSE_POLL).await;
        }
        if self.controls.cancel.load(Ordering::Relaxed) {
            return Outcome::Cancelled;
        }

        let local_id = planned.photo.local_id.clone();
        logs.push(
            LogEntry::new(
                Some(job_id),
                LogLevel::Debug,
                "transfer",
                format!("Starting transfer ({})", planned.reason.as_str()),
            )
            .with_photo(local_id.clone()),
        );

        match self
            .transfer_one(planned, source, backend, destination_id, options)
            .await
        {
            Ok(bytes) => Outcome::Synced { local_id, bytes },
            Err(failure) => Outcome::Failed { local_id, failure },
        }
    }

    async fn transfer_one<B: DestinationBackend>(
        &self,
        planned: PlannedPhoto,
        source: &dyn PhotoSource,
        backend: &B,
        destination_id: Uuid,
        options: &SyncOptions,
    ) -> Result<u64, PhotoFailure> {
        let photo = planned.photo;
        let display_name = photo
            .original_filename
            .clone()
            .unwrap_or_else(|| photo.local_id.clone());
        self.progress
            .update(|snapshot| snapshot.current_photo = Some(display_name));

        let mut temps = TempGuard::default();

        let export_start = Instant::now();
        let exported = source.export_photo(&photo, noop_progress()).await?;
        temps.add(exported.path.clone());
        histogram!(HistTag::Export).record(export_start.elapsed());

        let (upload_src, remote_path) = if options.encrypt {
            let encrypt_start = Instant::now();
            let sealed = exported.path.with_extension("sealed");
            let encryptor = self.encryptor.clone();
            let (src, dst) = (exported.path.clone(), sealed.clone());
            // CPU bound; keep it off the I/O workers
            tokio::task::spawn_blocking(move || encryptor.encrypt_file(&src, &dst))
                .await
                .map_err(|err| std::io::Error::other(err))??;
            temps.add(sealed.clone());
            histogram!(HistTag::Encrypt).record(encrypt_start.elapsed());
            (
                sealed,
                remote_path_for(&photo, options.obfuscate_filenames, true),
            )
        } else {
            (
                exported.path.clone(),
                remote_path_for(&photo, options.obfuscate_filenames, false),
            )
        };

        let upload_start = Instant::now();
        let uploaded = backend
            .upload(&upload_src, &remote_path, noop_progress())
            .await?;
        histogram!(HistTag::Upload).record(upload_start.elapsed());
        counter!("sync.bytes_transferred").increment(uploaded.size);

        let row = SyncedPhoto {
            id: Uuid::new_v4(),
            local_id: photo.local_id.clone(),
            destination_id,
            remote_path: uploaded.remote_path.clone(),
            checksum: uploaded.checksum.clone(),
            sync_date: Utc::now(),
            file_size: uploaded.size,
            last_verified_date: None,
            file_metadata: Some(
                serde_json::json!({
                    "media_type": photo.media_type.as_str(),
                    "pixel_width": photo.pixel_width,
                    "pixel_height": photo.pixel_height,
                    "original_filename": photo.original_filename,
                    "source_sha256": exported.sha256,
                })
                .to_string(),
            ),
        };
        self.catalog.upsert_synced(&row)?;

        Ok(uploaded.size)
        // `temps` drops here, removing the exported and sealed files whether
        // we succeeded or not
    }

    fn fail_job(&self, job: &mut SyncJob, logs: &Arc<LogBuffer>, reason: &str) {
        logs.push(LogEntry::new(
            Some(job.id),
            LogLevel::Error,
            "job",
            reason.to_owned(),
        ));
        self.finish_job(job, logs, JobStatus::Failed);
        self.notifier.send(NotificationEvent::BackupFailed {
            destination_id: job.destination_id,
            reason: reason.to_owned(),
        });
    }

    /// Terminal bookkeeping: final job row, summary log, unconditional flush
    fn finish_job(&self, job: &mut SyncJob, logs: &Arc<LogBuffer>, status: JobStatus) {
        job.status = status;
        job.end_time = Some(Utc::now());
        if let Err(err) = self.catalog.update_job(job) {
            warn!("Failed writing final job row: {err:#}");
        }

        let (level, message) = match status {
            JobStatus::Completed => (LogLevel::Success, "Backup completed"),
            JobStatus::Cancelled => (LogLevel::Warning, "Backup cancelled"),
            _ => (LogLevel::Error, "Backup failed"),
        };
        logs.push(
            LogEntry::new(Some(job.id), level, "job", message.to_owned()).with_details(
                serde_json::json!({
                    "scanned": job.photos_scanned,
                    "synced": job.photos_synced,
                    "failed": job.photos_failed,
                    "bytes": job.bytes_transferred,
                    "average_speed_mib_s": job.average_speed,
                }),
            ),
        );
        logs.flush();

        let state = match status {
            JobStatus::Completed => EngineState::Completed,
            JobStatus::Cancelled => EngineState::Cancelled,
            _ => EngineState::Failed,
        };
        self.progress.update(|snapshot| {
            snapshot.state = state;
            snapshot.current_photo = None;
        });

        match status {
            JobStatus::Completed => self.notifier.send(NotificationEvent::BackupCompleted {
                destination_id: job.destination_id,
                synced: job.photos_synced,
                failed: job.photos_failed,
                bytes: job.bytes_transferred,
            }),
            JobStatus::Cancelled => self.notifier.send(NotificationEvent::BackupCancelled),
            _ => {}
        }
    }
}

/// Naive but honest: average pace of completed photos times what's left
fn estimate_remaining(elapsed: Duration, job: &SyncJob, total: u64) -> Option<Duration> {
    let done = job.photos_synced + job.photos_failed;
    if done == 0 {
        return None;
    }
    let remaining = total.checked_sub(done)?;
    Some(elapsed.mul_f64(remaining as f64 / done as f64))
}
