//! The read-only contract a photo library adapter has to satisfy
//!
//! The engine never talks to a concrete photo library directly. A host shell
//! provides an implementation of [`PhotoSource`] (e.g. wrapping the platform
//! photos framework) and the engine only ever enumerates and exports through
//! it. No mutating operation exists on this seam on purpose: the library is
//! strictly read-only to us.

use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use crate::dest::ProgressFn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Unknown,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Unknown => "unknown",
        }
    }
}

/// Source-provided identity and attributes of a single asset
#[derive(Clone, Debug, PartialEq)]
pub struct PhotoMetadata {
    /// Opaque identifier that stays stable for an asset within the library
    pub local_id: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub modification_date: Option<DateTime<Utc>>,
    pub media_type: MediaType,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub original_filename: Option<String>,
    pub file_size: Option<u64>,
}

/// A single exported asset sitting in a local temp file
#[derive(Debug)]
pub struct ExportedPhoto {
    pub path: PathBuf,
    pub size: u64,
    /// Hex encoded SHA-256 of the exported bytes
    pub sha256: String,
}

/// Which slice of the library a backup run covers
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateRangeFilter {
    Last24h,
    Last7d,
    Last30d,
    Last90d,
    FullLibrary,
    CustomRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl DateRangeFilter {
    /// Resolves to concrete bounds, `None` meaning the whole library
    pub fn bounds(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let days = match self {
            Self::Last24h => 1,
            Self::Last7d => 7,
            Self::Last30d => 30,
            Self::Last90d => 90,
            Self::FullLibrary => return None,
            Self::CustomRange { start, end } => return Some((*start, *end)),
        };
        Some((now - Duration::days(days), now))
    }

    pub fn matches(&self, creation_date: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self.bounds(now) {
            None => true,
            Some((start, end)) => {
                creation_date.is_some_and(|created| start <= created && created <= end)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("library access was denied by the user")]
    AuthDenied,
    #[error("library access is restricted on this system")]
    AuthRestricted,
    #[error("failed exporting asset {local_id}: {reason}")]
    ExportFailed { local_id: String, reason: String },
    #[error("failed downloading the cloud original for asset {local_id}")]
    CloudDownloadFailed { local_id: String },
    #[error("asset {local_id} has an unsupported media kind")]
    UnsupportedAsset { local_id: String },
}

/// Read-only photo library seam
///
/// `export_photo` writes the asset's original bytes to a temp file owned by
/// the caller, reporting progress as a fraction in `[0, 1]`. Implementations
/// must never invoke a mutating API on the underlying library.
#[async_trait::async_trait]
pub trait PhotoSource: Send + Sync {
    async fn request_authorization(&self) -> bool;

    async fn fetch_photos(&self, filter: DateRangeFilter)
        -> Result<Vec<PhotoMetadata>, SourceError>;

    async fn export_photo(
        &self,
        photo: &PhotoMetadata,
        progress: ProgressFn,
    ) -> Result<ExportedPhoto, SourceError>;

    /// Best-effort cancellation of any in-flight export
    fn cancel_export(&self);
}

const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "heic", "heif", "gif", "tiff", "webp", "dng"];
const VIDEO_EXTS: &[&str] = &["mov", "mp4", "m4v", "avi", "hevc"];
const AUDIO_EXTS: &[&str] = &["m4a", "mp3", "wav", "aac"];

/// Library adapter over a plain directory tree
///
/// The CLI's stand-in for a platform photo library: every media file under
/// the root is an asset, its path relative to the root is the local id, and
/// exporting is a copy into a scratch directory. Nothing under the root is
/// ever written to.
pub struct FolderSource {
    root: PathBuf,
    scratch_dir: PathBuf,
}

impl FolderSource {
    pub fn new(root: PathBuf, scratch_dir: PathBuf) -> Self {
        Self { root, scratch_dir }
    }

    fn media_type_of(path: &std::path::Path) -> Option<MediaType> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTS.contains(&ext.as_str()) {
            Some(MediaType::Image)
        } else if VIDEO_EXTS.contains(&ext.as_str()) {
            Some(MediaType::Video)
        } else if AUDIO_EXTS.contains(&ext.as_str()) {
            Some(MediaType::Audio)
        } else {
            None
        }
    }

    fn scan(root: &std::path::Path) -> std::io::Result<Vec<PhotoMetadata>> {
        let mut photos = Vec::new();
        let mut pending = vec![root.to_owned()];

        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(media_type) = Self::media_type_of(&path) else {
                    continue;
                };

                let meta = entry.metadata()?;
                let modified: Option<DateTime<Utc>> = meta.modified().ok().map(Into::into);
                let created: Option<DateTime<Utc>> =
                    meta.created().ok().map(Into::into).or(modified);
                let local_id = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");

                photos.push(PhotoMetadata {
                    local_id,
                    creation_date: created,
                    modification_date: modified,
                    media_type,
                    pixel_width: 0,
                    pixel_height: 0,
                    original_filename: path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned()),
                    file_size: Some(meta.len()),
                });
            }
        }

        photos.sort_by(|a, b| a.local_id.cmp(&b.local_id));
        Ok(photos)
    }
}

#[async_trait::async_trait]
impl PhotoSource for FolderSource {
    async fn request_authorization(&self) -> bool {
        self.root.is_dir()
    }

    async fn fetch_photos(
        &self,
        filter: DateRangeFilter,
    ) -> Result<Vec<PhotoMetadata>, SourceError> {
        let root = self.root.clone();
        let photos = tokio::task::spawn_blocking(move || Self::scan(&root))
            .await
            .map_err(|_| SourceError::AuthRestricted)?
            .map_err(|_| SourceError::AuthDenied)?;

        let now = Utc::now();
        Ok(photos
            .into_iter()
            .filter(|photo| filter.matches(photo.creation_date, now))
            .collect())
    }

    async fn export_photo(
        &self,
        photo: &PhotoMetadata,
        progress: ProgressFn,
    ) -> Result<ExportedPhoto, SourceError> {
        use sha2::{Digest, Sha256};

        let export_failed = |reason: &str| SourceError::ExportFailed {
            local_id: photo.local_id.clone(),
            reason: reason.to_owned(),
        };

        let src = self.root.join(&photo.local_id);
        if Self::media_type_of(&src).is_none() {
            return Err(SourceError::UnsupportedAsset {
                local_id: photo.local_id.clone(),
            });
        }
        let bytes = tokio::fs::read(&src)
            .await
            .map_err(|_| export_failed("asset file is unreadable"))?;

        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|_| export_failed("scratch dir is unwritable"))?;
        let dst = self
            .scratch_dir
            .join(format!("export-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&dst, &bytes)
            .await
            .map_err(|_| export_failed("scratch write failed"))?;
        progress(1.0);

        Ok(ExportedPhoto {
            path: dst,
            size: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(&bytes)),
        })
    }

    fn cancel_export(&self) {}
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_utils::{log, temp};

    fn seed_library(root: &std::path::Path) {
        std::fs::create_dir_all(root.join("2024/roadtrip")).unwrap();
        std::fs::write(root.join("2024/roadtrip/IMG_0001.jpg"), vec![1u8; 256]).unwrap();
        std::fs::write(root.join("2024/roadtrip/clip.mov"), vec![2u8; 512]).unwrap();
        std::fs::write(root.join("notes.txt"), b"not a photo").unwrap();
    }

    #[tokio::test]
    async fn folder_source_scans_media_only() {
        log::init();

        let (_root_guard, root) = temp::dir();
        let (_scratch_guard, scratch) = temp::dir();
        seed_library(&root);

        let source = FolderSource::new(root, scratch);
        assert!(source.request_authorization().await);

        let photos = source
            .fetch_photos(DateRangeFilter::FullLibrary)
            .await
            .unwrap();
        let ids: Vec<&str> = photos.iter().map(|p| p.local_id.as_str()).collect();
        assert_eq!(ids, vec!["2024/roadtrip/IMG_0001.jpg", "2024/roadtrip/clip.mov"]);
        assert_eq!(photos[0].media_type, MediaType::Image);
        assert_eq!(photos[1].media_type, MediaType::Video);
        assert_eq!(photos[0].file_size, Some(256));
        assert!(photos[0].creation_date.is_some());
    }

    #[tokio::test]
    async fn folder_source_exports_with_checksum() {
        log::init();

        let (_root_guard, root) = temp::dir();
        let (_scratch_guard, scratch) = temp::dir();
        seed_library(&root);

        let source = FolderSource::new(root, scratch.clone());
        let photos = source
            .fetch_photos(DateRangeFilter::FullLibrary)
            .await
            .unwrap();

        let exported = source
            .export_photo(&photos[0], Box::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(exported.size, 256);
        assert!(exported.path.starts_with(&scratch));
        assert_eq!(
            std::fs::read(&exported.path).unwrap(),
            vec![1u8; 256],
        );
        {
            use sha2::{Digest, Sha256};
            assert_eq!(exported.sha256, hex::encode(Sha256::digest(vec![1u8; 256])));
        }

        // Unknown ids refuse cleanly
        let mut bogus = photos[0].clone();
        bogus.local_id = "nope.jpg".to_owned();
        assert!(matches!(
            source.export_photo(&bogus, Box::new(|_| {})).await,
            Err(SourceError::ExportFailed { .. })
        ));
    }

    #[test]
    fn filters_resolve_bounds() {
        let now = Utc::now();

        assert_eq!(DateRangeFilter::FullLibrary.bounds(now), None);
        let (start, end) = DateRangeFilter::Last7d.bounds(now).unwrap();
        assert_eq!(end, now);
        assert_eq!(end - start, Duration::days(7));

        assert!(DateRangeFilter::Last24h.matches(Some(now - Duration::hours(3)), now));
        assert!(!DateRangeFilter::Last24h.matches(Some(now - Duration::days(2)), now));
        // Photos without a creation date only match the full library
        assert!(!DateRangeFilter::Last24h.matches(None, now));
        assert!(DateRangeFilter::FullLibrary.matches(None, now));
    }
}
