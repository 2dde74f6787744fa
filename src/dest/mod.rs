//! Backup destinations and the capability contract they all satisfy
//!
//! Every backend speaks the same CRUD-ish surface: connect, upload, stat,
//! list, delete, download, verify. Remote paths are always forward-slash
//! paths relative to the backend's configured prefix; each backend translates
//! to its native syntax. The concrete variants are enum-dispatched through
//! [`Destination`] so callers never name a backend type directly.

mod mount;
mod s3;

use std::{path::Path, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{DestinationKind, DestinationRecord};

pub use self::mount::{MountBackend, MountConfig};
pub use self::s3::{S3Backend, S3Config};

/// Receives a monotonically non-decreasing fraction in `[0, 1]`, ending on a
/// final `1.0`
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

pub fn noop_progress() -> ProgressFn {
    Box::new(|_| {})
}

#[derive(Debug, thiserror::Error)]
pub enum DestError {
    #[error("failed connecting to the destination")]
    ConnectionFailed(#[source] Option<anyhow::Error>),
    #[error("destination configuration is invalid: {0}")]
    InvalidConfig(String),
    #[error("failed uploading {path}")]
    UploadFailed {
        path: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("no remote file at {0}")]
    FileNotFound(String),
    #[error("the destination rejected our credentials")]
    AuthFailed,
    #[error("the destination network is unreachable")]
    NetworkUnreachable,
    #[error("the destination operation timed out")]
    Timeout,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileMeta {
    /// Path relative to the backend's prefix, forward slashes
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Whatever checksum-ish value the store exposes (entity tag, etc.); not
    /// comparable to our SHA-256
    pub checksum: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UploadResult {
    pub remote_path: String,
    /// Hex encoded SHA-256 computed from the bytes we sent
    pub checksum: String,
    pub size: u64,
    pub duration: Duration,
}

/// Tunables for the object-store transfer path
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransferTuning {
    /// Uploads at or above this size take the multipart path
    pub multipart_threshold: u64,
    pub part_size: u64,
    /// Retries per part after the initial attempt
    pub max_part_retries: u32,
}

impl TransferTuning {
    pub fn is_multipart(&self, size: u64) -> bool {
        size >= self.multipart_threshold
    }
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            multipart_threshold: 50 * 1_024 * 1_024,
            part_size: 10 * 1_024 * 1_024,
            max_part_retries: 3,
        }
    }
}

/// The capability set every destination satisfies
///
/// `upload` reports progress after meaningful transfer milestones and always
/// finishes with `1.0`. `verify_checksum` compares sizes on purpose: object
/// stores return an MD5 (or a `md5-partcount` composite for multipart) as the
/// entity tag, which is not comparable to the SHA-256 we record, so true
/// content verification is done by `download`ing.
#[async_trait::async_trait]
pub trait DestinationBackend: Send + Sync {
    async fn connect(&mut self) -> Result<(), DestError>;

    async fn disconnect(&mut self) -> Result<(), DestError>;

    /// Cheap round-trip proving the destination is reachable and willing
    async fn test_connection(&mut self) -> Result<(), DestError>;

    async fn upload(
        &self,
        local: &Path,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<UploadResult, DestError>;

    async fn exists(&self, remote_path: &str) -> Result<bool, DestError>;

    async fn stat(&self, remote_path: &str) -> Result<Option<FileMeta>, DestError>;

    async fn list(&self, directory: &str) -> Result<Vec<FileMeta>, DestError>;

    async fn delete(&self, remote_path: &str) -> Result<(), DestError>;

    async fn download(
        &self,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<Vec<u8>, DestError>;

    async fn verify_checksum(
        &self,
        remote_path: &str,
        expected_size: u64,
    ) -> Result<bool, DestError>;
}

/// Enum-dispatched concrete backends
pub enum Destination {
    S3(S3Backend),
    Smb(MountBackend),
    Sftp(MountBackend),
    Ftp(MountBackend),
}

impl Destination {
    /// Rehydrates a backend from a catalog row's opaque config blob
    pub fn from_record(record: &DestinationRecord, tuning: TransferTuning) -> Result<Self, DestError> {
        let dest = match record.kind {
            DestinationKind::S3 => {
                let config = decode_config::<S3Config>(&record.config_blob)?;
                Self::S3(S3Backend::new(config, tuning))
            }
            DestinationKind::Smb => {
                let config = decode_config::<MountConfig>(&record.config_blob)?;
                Self::Smb(MountBackend::new(DestinationKind::Smb, config))
            }
            DestinationKind::Sftp => {
                let config = decode_config::<MountConfig>(&record.config_blob)?;
                Self::Sftp(MountBackend::new(DestinationKind::Sftp, config))
            }
            DestinationKind::Ftp => {
                let config = decode_config::<MountConfig>(&record.config_blob)?;
                Self::Ftp(MountBackend::new(DestinationKind::Ftp, config))
            }
        };
        Ok(dest)
    }

    fn inner(&self) -> &dyn DestinationBackend {
        match self {
            Self::S3(backend) => backend,
            Self::Smb(backend) | Self::Sftp(backend) | Self::Ftp(backend) => backend,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn DestinationBackend {
        match self {
            Self::S3(backend) => backend,
            Self::Smb(backend) | Self::Sftp(backend) | Self::Ftp(backend) => backend,
        }
    }
}

#[async_trait::async_trait]
impl DestinationBackend for Destination {
    async fn connect(&mut self) -> Result<(), DestError> {
        self.inner_mut().connect().await
    }

    async fn disconnect(&mut self) -> Result<(), DestError> {
        self.inner_mut().disconnect().await
    }

    async fn test_connection(&mut self) -> Result<(), DestError> {
        self.inner_mut().test_connection().await
    }

    async fn upload(
        &self,
        local: &Path,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<UploadResult, DestError> {
        self.inner().upload(local, remote_path, progress).await
    }

    async fn exists(&self, remote_path: &str) -> Result<bool, DestError> {
        self.inner().exists(remote_path).await
    }

    async fn stat(&self, remote_path: &str) -> Result<Option<FileMeta>, DestError> {
        self.inner().stat(remote_path).await
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileMeta>, DestError> {
        self.inner().list(directory).await
    }

    async fn delete(&self, remote_path: &str) -> Result<(), DestError> {
        self.inner().delete(remote_path).await
    }

    async fn download(
        &self,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<Vec<u8>, DestError> {
        self.inner().download(remote_path, progress).await
    }

    async fn verify_checksum(
        &self,
        remote_path: &str,
        expected_size: u64,
    ) -> Result<bool, DestError> {
        self.inner().verify_checksum(remote_path, expected_size).await
    }
}

pub fn encode_config<T: Serialize>(config: &T) -> Result<Vec<u8>, DestError> {
    bincode::serialize(config)
        .map_err(|err| DestError::InvalidConfig(format!("unencodable config: {err}")))
}

pub fn decode_config<T: for<'de> Deserialize<'de>>(blob: &[u8]) -> Result<T, DestError> {
    bincode::deserialize(blob)
        .map_err(|err| DestError::InvalidConfig(format!("undecodable config blob: {err}")))
}

/// Joins a backend path prefix with a remote path, keeping forward slashes
/// and avoiding doubled separators
pub(crate) fn prefixed(prefix: Option<&str>, remote_path: &str) -> String {
    let remote_path = remote_path.trim_start_matches('/');
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{remote_path}"),
        None => remote_path.to_owned(),
    }
}
