use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::source::{
    DateRangeFilter, ExportedPhoto, MediaType, PhotoMetadata, PhotoSource, ProgressFn, SourceError,
};

pub fn creation_date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 10, 0, 0).unwrap()
}

/// A library asset plus the bytes its export produces
#[derive(Clone)]
pub struct FakeAsset {
    pub meta: PhotoMetadata,
    pub bytes: Vec<u8>,
}

impl FakeAsset {
    pub fn new(local_id: &str, filename: &str, bytes: Vec<u8>, created: DateTime<Utc>) -> Self {
        let media_type = if filename.ends_with(".mov") || filename.ends_with(".mp4") {
            MediaType::Video
        } else {
            MediaType::Image
        };
        Self {
            meta: PhotoMetadata {
                local_id: local_id.to_owned(),
                creation_date: Some(created),
                modification_date: Some(created),
                media_type,
                pixel_width: 4_032,
                pixel_height: 3_024,
                original_filename: Some(filename.to_owned()),
                file_size: Some(bytes.len() as u64),
            },
            bytes,
        }
    }

    pub fn sized(local_id: &str, filename: &str, size: usize, created: DateTime<Utc>) -> Self {
        let bytes = (0..size).map(|n| (n % 249) as u8).collect();
        Self::new(local_id, filename, bytes, created)
    }
}

#[derive(Default)]
struct State {
    assets: Vec<FakeAsset>,
    export_failures: HashMap<String, u32>,
    export_count: usize,
    authorized: bool,
    cancelled: bool,
}

/// Scripted read-only photo library
#[derive(Clone)]
pub struct FakePhotoSource {
    state: Arc<Mutex<State>>,
    export_dir: PathBuf,
}

impl FakePhotoSource {
    pub fn new(export_dir: PathBuf, assets: Vec<FakeAsset>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                assets,
                authorized: true,
                ..Default::default()
            })),
            export_dir,
        }
    }

    /// Makes the next `times` exports of `local_id` fail
    pub fn fail_exports(&self, local_id: &str, times: u32) {
        self.state
            .lock()
            .export_failures
            .insert(local_id.to_owned(), times);
    }

    pub fn touch(&self, local_id: &str, modified: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(asset) = state
            .assets
            .iter_mut()
            .find(|asset| asset.meta.local_id == local_id)
        {
            asset.meta.modification_date = Some(modified);
        }
    }

    pub fn export_count(&self) -> usize {
        self.state.lock().export_count
    }
}

#[async_trait::async_trait]
impl PhotoSource for FakePhotoSource {
    async fn request_authorization(&self) -> bool {
        self.state.lock().authorized
    }

    async fn fetch_photos(
        &self,
        filter: DateRangeFilter,
    ) -> Result<Vec<PhotoMetadata>, SourceError> {
        let now = Utc::now();
        Ok(self
            .state
            .lock()
            .assets
            .iter()
            .filter(|asset| filter.matches(asset.meta.creation_date, now))
            .map(|asset| asset.meta.clone())
            .collect())
    }

    async fn export_photo(
        &self,
        photo: &PhotoMetadata,
        progress: ProgressFn,
    ) -> Result<ExportedPhoto, SourceError> {
        let bytes = {
            let mut state = self.state.lock();
            state.export_count += 1;

            if let Some(remaining) = state.export_failures.get_mut(&photo.local_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SourceError::ExportFailed {
                        local_id: photo.local_id.clone(),
                        reason: "scripted failure".to_owned(),
                    });
                }
            }

            state
                .assets
                .iter()
                .find(|asset| asset.meta.local_id == photo.local_id)
                .map(|asset| asset.bytes.clone())
                .ok_or_else(|| SourceError::ExportFailed {
                    local_id: photo.local_id.clone(),
                    reason: "no such asset".to_owned(),
                })?
        };

        let path = self
            .export_dir
            .join(format!("export-{}", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|_| SourceError::ExportFailed {
                local_id: photo.local_id.clone(),
                reason: "temp write failed".to_owned(),
            })?;
        progress(1.0);

        Ok(ExportedPhoto {
            path,
            size: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(&bytes)),
        })
    }

    fn cancel_export(&self) {
        self.state.lock().cancelled = true;
    }
}
