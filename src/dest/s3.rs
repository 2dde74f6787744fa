//! S3-family object store backend
//!
//! Small files go up in one request; anything at or past the multipart
//! threshold is split into fixed-size parts that are retried individually
//! with exponential backoff and stitched together with a complete-multipart
//! call. A failed part aborts the whole aggregate upload (best-effort) so the
//! store never accumulates half-finished uploads we pay for.

use std::{path::Path, time::Instant};

use s3::{bucket::Bucket, creds::Credentials, error::S3Error, region::Region};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncReadExt, time::Duration};
use tracing::{debug, warn};

use super::{
    prefixed, DestError, DestinationBackend, FileMeta, ProgressFn, TransferTuning, UploadResult,
};

const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores (MinIO, Wasabi, ...); unset
    /// means AWS proper
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub path_prefix: Option<String>,
}

pub struct S3Backend {
    config: S3Config,
    tuning: TransferTuning,
    bucket: Option<Box<Bucket>>,
}

impl S3Backend {
    pub fn new(config: S3Config, tuning: TransferTuning) -> Self {
        Self {
            config,
            tuning,
            bucket: None,
        }
    }

    fn bucket(&self) -> Result<&Bucket, DestError> {
        self.bucket
            .as_deref()
            .ok_or(DestError::ConnectionFailed(None))
    }

    fn full_path(&self, remote_path: &str) -> String {
        prefixed(self.config.path_prefix.as_deref(), remote_path)
    }

    async fn multipart_upload(
        &self,
        local: &Path,
        full_path: &str,
        size: u64,
        progress: &ProgressFn,
    ) -> Result<String, DestError> {
        let bucket = self.bucket()?;
        let upload_failed = |source: S3Error| upload_err(full_path, source);

        let initiated = bucket
            .initiate_multipart_upload(full_path, "application/octet-stream")
            .await
            .map_err(upload_failed)?;
        let upload_id = initiated.upload_id;

        let mut file = fs::File::open(local).await.map_err(|err| {
            DestError::UploadFailed {
                path: full_path.to_owned(),
                source: Some(err.into()),
            }
        })?;
        let mut hasher = Sha256::new();
        let mut parts = Vec::new();
        let mut uploaded: u64 = 0;
        let mut part_number: u32 = 0;

        while uploaded < size {
            part_number += 1;
            let chunk_len = self.tuning.part_size.min(size - uploaded) as usize;
            let mut chunk = vec![0u8; chunk_len];
            if let Err(err) = file.read_exact(&mut chunk).await {
                self.abort_upload(full_path, &upload_id).await;
                return Err(DestError::UploadFailed {
                    path: full_path.to_owned(),
                    source: Some(err.into()),
                });
            }
            hasher.update(&chunk);

            match self
                .upload_part_with_retry(full_path, &upload_id, part_number, chunk)
                .await
            {
                Ok(part) => parts.push(part),
                Err(err) => {
                    self.abort_upload(full_path, &upload_id).await;
                    return Err(err);
                }
            }

            uploaded += chunk_len as u64;
            progress(uploaded as f64 / size as f64);
        }

        // The store requires parts ordered by number on completion
        parts.sort_by_key(|part| part.part_number);
        if let Err(err) = bucket
            .complete_multipart_upload(full_path, &upload_id, parts)
            .await
        {
            self.abort_upload(full_path, &upload_id).await;
            return Err(upload_failed(err));
        }

        Ok(hex::encode(hasher.finalize()))
    }

    async fn upload_part_with_retry(
        &self,
        full_path: &str,
        upload_id: &str,
        part_number: u32,
        chunk: Vec<u8>,
    ) -> Result<s3::serde_types::Part, DestError> {
        let bucket = self.bucket()?;

        let mut attempt: u32 = 0;
        loop {
            match bucket
                .put_multipart_chunk(
                    chunk.clone(),
                    full_path,
                    part_number,
                    upload_id,
                    "application/octet-stream",
                )
                .await
            {
                Ok(part) => return Ok(part),
                Err(err) if attempt < self.tuning.max_part_retries => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    warn!(
                        "Part {part_number} of {full_path} failed (attempt {}), retrying in \
                         {delay:?}: {err}",
                        attempt + 1,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(upload_err(full_path, err)),
            }
        }
    }

    /// Best-effort: a failed abort only costs leftover parts on the store
    async fn abort_upload(&self, full_path: &str, upload_id: &str) {
        let Ok(bucket) = self.bucket() else { return };
        if let Err(err) = bucket.abort_upload(full_path, upload_id).await {
            warn!("Failed aborting multipart upload for {full_path}: {err}");
        }
    }
}

#[async_trait::async_trait]
impl DestinationBackend for S3Backend {
    async fn connect(&mut self) -> Result<(), DestError> {
        let credentials = Credentials::new(
            Some(&self.config.access_key),
            Some(&self.config.secret_key),
            None,
            None,
            None,
        )
        .map_err(|err| DestError::InvalidConfig(format!("bad credentials: {err}")))?;

        let region = match &self.config.endpoint {
            Some(endpoint) => Region::Custom {
                region: self.config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => self
                .config
                .region
                .parse()
                .map_err(|err| DestError::InvalidConfig(format!("bad region: {err}")))?,
        };

        let mut bucket = Bucket::new(&self.config.bucket, region, credentials)
            .map_err(|err| DestError::ConnectionFailed(Some(err.into())))?;
        // Compatible stores usually live behind a plain host, not virtual-host
        // bucket DNS
        if self.config.endpoint.is_some() {
            bucket = bucket.with_path_style();
        }
        self.bucket = Some(bucket);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DestError> {
        self.bucket = None;
        Ok(())
    }

    async fn test_connection(&mut self) -> Result<(), DestError> {
        if self.bucket.is_none() {
            self.connect().await?;
        }
        let prefix = self.full_path("");
        self.bucket()?
            .list_page(prefix, None, None, None, Some(1))
            .await
            .map(|_| ())
            .map_err(|err| map_s3_err("", err, DestError::ConnectionFailed(None)))
    }

    async fn upload(
        &self,
        local: &Path,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<UploadResult, DestError> {
        let full_path = self.full_path(remote_path);
        let started = Instant::now();

        let size = fs::metadata(local)
            .await
            .map_err(|err| DestError::UploadFailed {
                path: full_path.clone(),
                source: Some(err.into()),
            })?
            .len();

        let checksum = if self.tuning.is_multipart(size) {
            debug!(
                "Uploading {full_path} as {} parts of {} bytes",
                size.div_ceil(self.tuning.part_size),
                self.tuning.part_size,
            );
            self.multipart_upload(local, &full_path, size, &progress)
                .await?
        } else {
            let bytes = fs::read(local).await.map_err(|err| DestError::UploadFailed {
                path: full_path.clone(),
                source: Some(err.into()),
            })?;
            let checksum = hex::encode(Sha256::digest(&bytes));
            let response = self
                .bucket()?
                .put_object(&full_path, &bytes)
                .await
                .map_err(|err| upload_err(&full_path, err))?;
            if response.status_code() >= 300 {
                return Err(DestError::UploadFailed {
                    path: full_path.clone(),
                    source: Some(anyhow::anyhow!(
                        "put returned status {}",
                        response.status_code()
                    )),
                });
            }
            progress(1.0);
            checksum
        };

        Ok(UploadResult {
            remote_path: remote_path.to_owned(),
            checksum,
            size,
            duration: started.elapsed(),
        })
    }

    async fn exists(&self, remote_path: &str) -> Result<bool, DestError> {
        Ok(self.stat(remote_path).await?.is_some())
    }

    async fn stat(&self, remote_path: &str) -> Result<Option<FileMeta>, DestError> {
        let full_path = self.full_path(remote_path);
        match self.bucket()?.head_object(&full_path).await {
            Ok((_, 404)) => Ok(None),
            Ok((head, _)) => Ok(Some(FileMeta {
                path: remote_path.to_owned(),
                size: head.content_length.unwrap_or_default().max(0) as u64,
                modified: head
                    .last_modified
                    .as_deref()
                    .and_then(|raw| chrono::DateTime::parse_from_rfc2822(raw).ok())
                    .map(Into::into),
                checksum: head.e_tag.map(|etag| etag.trim_matches('"').to_owned()),
            })),
            Err(err) if status_of(&err) == Some(404) => Ok(None),
            Err(err) => Err(map_s3_err(
                remote_path,
                err,
                DestError::ConnectionFailed(None),
            )),
        }
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileMeta>, DestError> {
        let mut prefix = self.full_path(directory);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let pages = self
            .bucket()?
            .list(prefix.clone(), None)
            .await
            .map_err(|err| map_s3_err(directory, err, DestError::ConnectionFailed(None)))?;

        let strip = self
            .config
            .path_prefix
            .as_deref()
            .map(|p| format!("{}/", p.trim_matches('/')))
            .unwrap_or_default();
        let mut files = Vec::new();
        for page in pages {
            for object in page.contents {
                let path = object
                    .key
                    .strip_prefix(&strip)
                    .unwrap_or(&object.key)
                    .to_owned();
                files.push(FileMeta {
                    path,
                    size: object.size,
                    modified: chrono::DateTime::parse_from_rfc3339(&object.last_modified)
                        .ok()
                        .map(Into::into),
                    checksum: object.e_tag.map(|etag| etag.trim_matches('"').to_owned()),
                });
            }
        }
        Ok(files)
    }

    async fn delete(&self, remote_path: &str) -> Result<(), DestError> {
        let full_path = self.full_path(remote_path);
        self.bucket()?
            .delete_object(&full_path)
            .await
            .map(|_| ())
            .map_err(|err| map_s3_err(remote_path, err, DestError::ConnectionFailed(None)))
    }

    async fn download(
        &self,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<Vec<u8>, DestError> {
        let full_path = self.full_path(remote_path);
        let response = self
            .bucket()?
            .get_object(&full_path)
            .await
            .map_err(|err| map_s3_err(remote_path, err, DestError::ConnectionFailed(None)))?;
        if response.status_code() == 404 {
            return Err(DestError::FileNotFound(remote_path.to_owned()));
        }
        progress(1.0);
        Ok(response.bytes().to_vec())
    }

    async fn verify_checksum(
        &self,
        remote_path: &str,
        expected_size: u64,
    ) -> Result<bool, DestError> {
        let meta = self.stat(remote_path).await?;
        Ok(meta.is_some_and(|meta| meta.size == expected_size))
    }
}

fn status_of(err: &S3Error) -> Option<u16> {
    match err {
        S3Error::HttpFailWithBody(code, _) => Some(*code),
        _ => None,
    }
}

fn upload_err(path: &str, err: S3Error) -> DestError {
    map_s3_err(
        path,
        err,
        DestError::UploadFailed {
            path: path.to_owned(),
            source: None,
        },
    )
}

/// Folds an `S3Error` into our closed taxonomy, defaulting to the operation's
/// natural failure when the status code doesn't pin it down
fn map_s3_err(path: &str, err: S3Error, default: DestError) -> DestError {
    match status_of(&err) {
        Some(404) => DestError::FileNotFound(path.to_owned()),
        Some(401) | Some(403) => DestError::AuthFailed,
        Some(408) | Some(504) => DestError::Timeout,
        _ => match default {
            DestError::ConnectionFailed(_) => DestError::ConnectionFailed(Some(err.into())),
            DestError::UploadFailed { path, .. } => DestError::UploadFailed {
                path,
                source: Some(err.into()),
            },
            other => other,
        },
    }
}
