//! Integrity verification: does the destination still hold what the catalog
//! says it does?
//!
//! Full scans walk every catalog row for a destination; quick scans check a
//! uniform random sample. Either way a row is verified by statting its remote
//! object and comparing sizes (entity tags aren't comparable to our SHA-256,
//! and downloading everything would defeat the point of a scan). Gap
//! detection runs the other direction, asking which library photos have no
//! healthy catalog row yet.

#[cfg(test)]
mod tests;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{Duration, Utc};
use futures::StreamExt;
use rand::{seq::SliceRandom, Rng};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    catalog::{
        Catalog, CatalogError, LogEntry, LogLevel, LogStream, SyncedPhoto, VerificationJob,
        VerificationKind,
    },
    dest::{DestError, DestinationBackend},
    notify::{NotificationEvent, Notifier},
    source::{DateRangeFilter, PhotoMetadata, PhotoSource, SourceError},
    sync::{is_modified, LogBuffer},
};

pub const DEFAULT_CONCURRENCY: usize = 5;
/// A row counts as unverified once its last check is older than this
pub const DEFAULT_REVERIFY_DAYS: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Destination(#[from] DestError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyStatus {
    Verified,
    ChecksumMismatch,
    Missing,
    Error,
}

#[derive(Clone, Debug)]
pub struct VerifyResult {
    pub photo: SyncedPhoto,
    pub status: VerifyStatus,
    pub message: Option<String>,
}

#[derive(Debug)]
pub struct VerificationReport {
    pub job: VerificationJob,
    pub results: Vec<VerifyResult>,
}

impl VerificationReport {
    pub fn failed_results(&self) -> Vec<&VerifyResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, VerifyStatus::Missing | VerifyStatus::ChecksumMismatch))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct GapReport {
    /// Library photos with no catalog row for the destination
    pub unsynced: Vec<PhotoMetadata>,
    /// Library photos whose row exists but predates their modification
    pub modified: Vec<PhotoMetadata>,
    pub library_total: usize,
    pub synced_total: usize,
}

pub struct VerificationEngine {
    catalog: Arc<Catalog>,
    notifier: Notifier,
    concurrency: usize,
    cancelled: AtomicBool,
}

impl VerificationEngine {
    pub fn new(catalog: Arc<Catalog>, notifier: Notifier) -> Self {
        Self::with_concurrency(catalog, notifier, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(catalog: Arc<Catalog>, notifier: Notifier, concurrency: usize) -> Self {
        Self {
            catalog,
            notifier,
            concurrency: concurrency.clamp(1, 10),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Workers in flight finish their current photo; the job keeps whatever
    /// counters accrued
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Checks every catalog row for the destination
    pub async fn verify_backup<B: DestinationBackend>(
        &self,
        backend: &B,
        destination_id: Uuid,
        update_last_verified: bool,
    ) -> Result<VerificationReport, VerifyError> {
        let rows = self.catalog.get_synced_for_destination(destination_id)?;
        let report = self
            .verify_rows(
                backend,
                destination_id,
                VerificationKind::Full,
                rows,
                update_last_verified,
            )
            .await;
        self.notify_failure(destination_id, report)
    }

    /// Checks a uniform random sample without replacement
    pub async fn quick_verification<B: DestinationBackend, R: Rng>(
        &self,
        backend: &B,
        destination_id: Uuid,
        sample_size: usize,
        rng: &mut R,
    ) -> Result<VerificationReport, VerifyError> {
        let mut rows = self.catalog.get_synced_for_destination(destination_id)?;
        let sample_size = sample_size.min(rows.len());
        let (sampled, _) = rows.partial_shuffle(rng, sample_size);
        let sampled = sampled.to_vec();

        let report = self
            .verify_rows(backend, destination_id, VerificationKind::Quick, sampled, true)
            .await;
        self.notify_failure(destination_id, report)
    }

    fn notify_failure(
        &self,
        destination_id: Uuid,
        report: Result<VerificationReport, VerifyError>,
    ) -> Result<VerificationReport, VerifyError> {
        if let Err(err) = &report {
            self.notifier.send(NotificationEvent::VerificationFailed {
                destination_id,
                reason: format!("{err:#}"),
            });
        }
        report
    }

    /// Rows that have never been verified or not recently enough
    pub fn unverified_photos(
        &self,
        destination_id: Uuid,
        older_than_days: i64,
    ) -> Result<Vec<SyncedPhoto>, VerifyError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let rows = self.catalog.get_synced_for_destination(destination_id)?;
        Ok(rows
            .into_iter()
            .filter(|row| match row.last_verified_date {
                None => true,
                Some(verified) => verified < cutoff,
            })
            .collect())
    }

    /// Library photos the catalog doesn't cover (or covers stalely) for the
    /// destination
    pub async fn detect_gaps(
        &self,
        source: &dyn PhotoSource,
        destination_id: Uuid,
        filter: DateRangeFilter,
    ) -> Result<GapReport, VerifyError> {
        let library = source.fetch_photos(filter).await?;
        let synced = self.catalog.get_synced_for_destination(destination_id)?;
        let by_local_id: std::collections::HashMap<&str, &SyncedPhoto> = synced
            .iter()
            .map(|row| (row.local_id.as_str(), row))
            .collect();

        let mut report = GapReport {
            library_total: library.len(),
            synced_total: synced.len(),
            ..Default::default()
        };
        for photo in library {
            match by_local_id.get(photo.local_id.as_str()) {
                None => report.unsynced.push(photo),
                Some(row) if is_modified(photo.modification_date, row.sync_date) => {
                    report.modified.push(photo)
                }
                Some(_) => {}
            }
        }

        self.notifier.send(NotificationEvent::GapDetectionCompleted {
            unsynced: report.unsynced.len() as u64,
            modified: report.modified.len() as u64,
        });
        Ok(report)
    }

    /// Clears out bad remote objects and their rows so the next backup run
    /// re-uploads them
    pub async fn reupload_failed_photos<B: DestinationBackend>(
        &self,
        failed: &[&VerifyResult],
        backend: &B,
    ) -> Result<usize, VerifyError> {
        let mut cleared = 0;
        for result in failed {
            if !matches!(
                result.status,
                VerifyStatus::Missing | VerifyStatus::ChecksumMismatch
            ) {
                continue;
            }
            // Best-effort: a missing object is already gone
            if let Err(err) = backend.delete(&result.photo.remote_path).await {
                if !matches!(err, DestError::FileNotFound(_)) {
                    warn!(
                        "Failed deleting {} before re-upload: {err:#}",
                        result.photo.remote_path
                    );
                }
            }
            self.catalog.delete_synced(result.photo.id)?;
            cleared += 1;
        }
        info!("Cleared {cleared} rows; the next backup run will re-upload them");
        Ok(cleared)
    }

    async fn verify_rows<B: DestinationBackend>(
        &self,
        backend: &B,
        destination_id: Uuid,
        kind: VerificationKind,
        rows: Vec<SyncedPhoto>,
        update_last_verified: bool,
    ) -> Result<VerificationReport, VerifyError> {
        self.cancelled.store(false, Ordering::Relaxed);
        self.notifier
            .send(NotificationEvent::VerificationStarted { destination_id });

        let mut job = VerificationJob {
            id: Uuid::new_v4(),
            destination_id,
            kind,
            start_time: Utc::now(),
            end_time: None,
            total_photos: rows.len() as u64,
            verified_count: 0,
            mismatch_count: 0,
            missing_count: 0,
            error_count: 0,
        };
        self.catalog.create_verification_job(&job)?;

        let logs = LogBuffer::new(Arc::clone(&self.catalog), LogStream::Verification);

        let mut outcomes = futures::stream::iter(rows)
            .map(|row| self.verify_one(backend, row))
            .buffer_unordered(self.concurrency);

        let mut results = Vec::new();
        while let Some(result) = outcomes.next().await {
            let Some(result) = result else { continue };
            match result.status {
                VerifyStatus::Verified => job.verified_count += 1,
                VerifyStatus::ChecksumMismatch => {
                    job.mismatch_count += 1;
                    logs.push(
                        LogEntry::new(
                            Some(job.id),
                            LogLevel::Warning,
                            "mismatch",
                            "Remote size does not match the catalog".to_owned(),
                        )
                        .with_photo(result.photo.remote_path.clone()),
                    );
                }
                VerifyStatus::Missing => {
                    job.missing_count += 1;
                    logs.push(
                        LogEntry::new(
                            Some(job.id),
                            LogLevel::Warning,
                            "missing",
                            "Remote object is gone".to_owned(),
                        )
                        .with_photo(result.photo.remote_path.clone()),
                    );
                }
                VerifyStatus::Error => {
                    job.error_count += 1;
                    logs.push(
                        LogEntry::new(
                            Some(job.id),
                            LogLevel::Error,
                            "verify",
                            result
                                .message
                                .clone()
                                .unwrap_or_else(|| "Verification errored".to_owned()),
                        )
                        .with_photo(result.photo.remote_path.clone()),
                    );
                }
            }
            results.push(result);
        }

        if update_last_verified {
            let verified_ids: Vec<Uuid> = results
                .iter()
                .filter(|r| r.status == VerifyStatus::Verified)
                .map(|r| r.photo.id)
                .collect();
            if !verified_ids.is_empty() {
                self.catalog
                    .update_last_verified_batch(&verified_ids, Utc::now())?;
            }
        }

        job.end_time = Some(Utc::now());
        self.catalog.update_verification_job(&job)?;
        logs.push(
            LogEntry::new(
                Some(job.id),
                LogLevel::Info,
                "verify",
                format!(
                    "Verification finished: {} ok, {} mismatched, {} missing, {} errored",
                    job.verified_count, job.mismatch_count, job.missing_count, job.error_count,
                ),
            ),
        );
        logs.flush();

        self.notifier.send(NotificationEvent::VerificationCompleted {
            destination_id,
            verified: job.verified_count,
            mismatched: job.mismatch_count,
            missing: job.missing_count,
        });

        Ok(VerificationReport { job, results })
    }

    async fn verify_one<B: DestinationBackend>(
        &self,
        backend: &B,
        row: SyncedPhoto,
    ) -> Option<VerifyResult> {
        // Photo boundary for cancellation; in-flight stats finish on their own
        if self.cancelled.load(Ordering::Relaxed) {
            return None;
        }

        let (status, message) = match backend.stat(&row.remote_path).await {
            Ok(None) => (VerifyStatus::Missing, None),
            Ok(Some(meta)) if meta.size == row.file_size => (VerifyStatus::Verified, None),
            Ok(Some(meta)) => (
                VerifyStatus::ChecksumMismatch,
                Some(format!(
                    "recorded {} bytes, remote has {}",
                    row.file_size, meta.size
                )),
            ),
            Err(err) => (VerifyStatus::Error, Some(format!("{err:#}"))),
        };

        Some(VerifyResult {
            photo: row,
            status,
            message,
        })
    }
}
