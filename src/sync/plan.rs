//! Dedup planning: deciding which photos actually need to move
//!
//! The plan is computed against the catalog first and the destination second:
//! a photo with a catalog row whose remote object still stats at the recorded
//! size is skipped, everything else gets queued with the reason recorded. The
//! three queue reasons are disjoint by construction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    catalog::SyncedPhoto,
    dest::DestinationBackend,
    encryption::ENCRYPTED_SUFFIX,
    metrics::{histogram, HistTag},
    source::{MediaType, PhotoMetadata},
    utils,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanReason {
    New,
    Modified,
    RemoteVerifyFailed,
}

impl PlanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Modified => "modified",
            Self::RemoteVerifyFailed => "remote-verify-failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlannedPhoto {
    pub photo: PhotoMetadata,
    pub reason: PlanReason,
}

#[derive(Debug, Default)]
pub struct SyncPlan {
    pub queue: Vec<PlannedPhoto>,
    /// Verified-in-place photos that need nothing
    pub skipped: Vec<PhotoMetadata>,
}

impl SyncPlan {
    pub fn count(&self, reason: PlanReason) -> usize {
        self.queue.iter().filter(|p| p.reason == reason).count()
    }
}

/// Classifies every library photo as new / modified / remote-verify-failed /
/// skip
///
/// Only photos whose catalog row looks current get the remote stat, so an
/// unchanged library costs one catalog batch lookup plus one stat per row.
pub async fn plan<B: DestinationBackend + ?Sized>(
    photos: Vec<PhotoMetadata>,
    synced: &HashMap<String, SyncedPhoto>,
    destination: &B,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for photo in photos {
        let Some(row) = synced.get(&photo.local_id) else {
            plan.queue.push(PlannedPhoto {
                photo,
                reason: PlanReason::New,
            });
            continue;
        };

        if is_modified(photo.modification_date, row.sync_date) {
            plan.queue.push(PlannedPhoto {
                photo,
                reason: PlanReason::Modified,
            });
            continue;
        }

        // The row claims this photo is safe; make the destination back that up
        let stat_start = std::time::Instant::now();
        let verified = match destination.stat(&row.remote_path).await {
            Ok(Some(meta)) => meta.size == row.file_size,
            Ok(None) => false,
            Err(err) => {
                warn!(
                    "Failed statting {} while planning, scheduling a re-upload: {err:#}",
                    row.remote_path
                );
                false
            }
        };
        histogram!(HistTag::RemoteStat).record(stat_start.elapsed());

        if verified {
            plan.skipped.push(photo);
        } else {
            debug!("{} failed remote verification", row.remote_path);
            plan.queue.push(PlannedPhoto {
                photo,
                reason: PlanReason::RemoteVerifyFailed,
            });
        }
    }

    plan
}

/// Computes the remote path for one photo: `YYYY/MM/DD/<filename>` with the
/// date taken from the creation date (or the literal `unknown`), and
/// `.encrypted` appended when the upload will be sealed
pub fn remote_path_for(photo: &PhotoMetadata, obfuscate_filename: bool, encrypted: bool) -> String {
    let date_part = match photo.creation_date {
        Some(created) => created.format("%Y/%m/%d").to_string(),
        None => "unknown".to_owned(),
    };

    let filename = if obfuscate_filename {
        format!("{}.{}", Uuid::new_v4(), extension_for(photo))
    } else {
        match &photo.original_filename {
            Some(name) => utils::sanitize_file_stem(name),
            None => format!(
                "{}.{}",
                utils::sanitize_file_stem(&photo.local_id),
                extension_for(photo)
            ),
        }
    };

    let mut path = format!("{date_part}/{filename}");
    if encrypted {
        path.push_str(ENCRYPTED_SUFFIX);
    }
    path
}

fn extension_for(photo: &PhotoMetadata) -> String {
    photo
        .original_filename
        .as_deref()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_else(|| {
            match photo.media_type {
                MediaType::Image => "jpg",
                MediaType::Video => "mov",
                MediaType::Audio => "m4a",
                MediaType::Unknown => "bin",
            }
            .to_owned()
        })
}

/// Timestamps compare strictly: equality means "not modified"
pub fn is_modified(modification_date: Option<DateTime<Utc>>, sync_date: DateTime<Utc>) -> bool {
    modification_date.is_some_and(|modified| modified > sync_date)
}
