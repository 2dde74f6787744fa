//! Filesystem-style backends: SMB, SFTP, and FTP shares
//!
//! These three only differ in how the share gets attached. `connect()` asks
//! the OS mount subsystem to mount the share (or adopts an already-mounted
//! path), after which every operation is a plain buffered stream copy against
//! the mount point. Checksums are computed in the same pass as the copy so a
//! file is never read twice.

use std::{
    io,
    path::{Path, PathBuf},
    process::Output,
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
};
use tracing::{debug, warn};

use super::{DestError, DestinationBackend, FileMeta, ProgressFn, UploadResult};
use crate::catalog::DestinationKind;

/// Stream copies move this much per read
const COPY_BUF: usize = 1_024 * 1_024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Share locator (`smb://host/share`, `sftp://user@host/dir`,
    /// `ftp://host/dir`). Unset means the mount point is managed outside of
    /// us and only adopted.
    pub share_url: Option<String>,
    pub mount_point: PathBuf,
    pub username: Option<String>,
    pub path_prefix: Option<String>,
}

/// An fs-level failure with the OS error code kept around for diagnostics
#[derive(Debug, thiserror::Error)]
#[error("{op} on {path} failed (os error {code:?})")]
struct FsOpError {
    op: &'static str,
    path: PathBuf,
    code: Option<i32>,
    #[source]
    source: io::Error,
}

#[derive(Debug, thiserror::Error)]
#[error("mount helper exited with {code:?}: {stderr}")]
struct MountFailure {
    code: Option<i32>,
    stderr: String,
}

pub struct MountBackend {
    kind: DestinationKind,
    config: MountConfig,
    connected: bool,
    /// Only unmount on disconnect if the mount was ours to begin with
    mounted_by_us: bool,
}

impl MountBackend {
    pub fn new(kind: DestinationKind, config: MountConfig) -> Self {
        Self {
            kind,
            config,
            connected: false,
            mounted_by_us: false,
        }
    }

    fn root(&self) -> PathBuf {
        match self.config.path_prefix.as_deref() {
            Some(prefix) => {
                let mut root = self.config.mount_point.clone();
                for part in prefix.split('/').filter(|p| !p.is_empty()) {
                    root.push(part);
                }
                root
            }
            None => self.config.mount_point.clone(),
        }
    }

    fn native(&self, remote_path: &str) -> PathBuf {
        let mut native = self.root();
        for part in remote_path.split('/').filter(|p| !p.is_empty()) {
            native.push(part);
        }
        native
    }

    fn ensure_connected(&self) -> Result<(), DestError> {
        if self.connected {
            Ok(())
        } else {
            Err(DestError::ConnectionFailed(None))
        }
    }

    async fn mount_share(&self, share_url: &str) -> Result<(), DestError> {
        let mount_point = &self.config.mount_point;
        fs::create_dir_all(mount_point)
            .await
            .map_err(|err| map_io_err("create mount point", mount_point.clone(), err, connection))?;

        let mut cmd = match self.kind {
            DestinationKind::Smb => {
                // `smb://host/share` -> `//host/share` for the cifs helper
                let unc = format!("//{}", share_url.trim_start_matches("smb://"));
                let mut cmd = Command::new("mount");
                cmd.arg("-t").arg("cifs").arg(unc).arg(mount_point);
                if let Some(user) = &self.config.username {
                    cmd.arg("-o").arg(format!("user={user}"));
                }
                cmd
            }
            DestinationKind::Sftp => {
                let host_path = share_url.trim_start_matches("sftp://");
                let target = match &self.config.username {
                    Some(user) if !host_path.contains('@') => format!("{user}@{host_path}"),
                    _ => host_path.to_owned(),
                };
                let mut cmd = Command::new("sshfs");
                // `user@host/dir` -> `user@host:/dir`
                cmd.arg(target.replacen('/', ":/", 1));
                cmd.arg(mount_point);
                cmd
            }
            DestinationKind::Ftp => {
                let mut cmd = Command::new("curlftpfs");
                cmd.arg(share_url).arg(mount_point);
                cmd
            }
            DestinationKind::S3 => unreachable!("object store shares are never mounted"),
        };

        debug!("Mounting {share_url} at {}", mount_point.display());
        let output = cmd
            .output()
            .await
            .map_err(|err| map_io_err("spawn mount helper", mount_point.clone(), err, connection))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(map_mount_failure(&output))
        }
    }

    async fn copy_with_progress(
        &self,
        mut reader: fs::File,
        mut writer: Option<&mut fs::File>,
        total: u64,
        progress: &ProgressFn,
        op: &'static str,
        at: &Path,
    ) -> Result<(Vec<u8>, String), DestError> {
        let mut hasher = Sha256::new();
        let mut collected = Vec::new();
        let mut buf = vec![0u8; COPY_BUF];
        let mut copied: u64 = 0;

        loop {
            let read = reader
                .read(&mut buf)
                .await
                .map_err(|err| map_io_err(op, at.to_owned(), err, connection))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            match writer.as_deref_mut() {
                Some(writer) => writer
                    .write_all(&buf[..read])
                    .await
                    .map_err(|err| map_io_err(op, at.to_owned(), err, connection))?,
                None => collected.extend_from_slice(&buf[..read]),
            }
            copied += read as u64;
            if total > 0 {
                progress((copied as f64 / total as f64).min(1.0));
            }
        }
        if let Some(writer) = writer.as_deref_mut() {
            writer
                .flush()
                .await
                .map_err(|err| map_io_err(op, at.to_owned(), err, connection))?;
        }
        progress(1.0);

        Ok((collected, hex::encode(hasher.finalize())))
    }
}

#[async_trait::async_trait]
impl DestinationBackend for MountBackend {
    async fn connect(&mut self) -> Result<(), DestError> {
        if self.connected {
            return Ok(());
        }

        let mount_point = self.config.mount_point.clone();
        let adoptable = fs::metadata(&mount_point)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        if !adoptable {
            match &self.config.share_url {
                Some(share_url) => {
                    let share_url = share_url.clone();
                    self.mount_share(&share_url).await?;
                    self.mounted_by_us = true;
                }
                None => {
                    return Err(DestError::InvalidConfig(format!(
                        "mount point {} is not accessible and no share url is configured",
                        mount_point.display()
                    )))
                }
            }
        }

        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DestError> {
        if self.connected && self.mounted_by_us {
            let output = Command::new("umount")
                .arg(&self.config.mount_point)
                .output()
                .await;
            if let Err(err) = output {
                warn!(
                    "Failed unmounting {}: {err}",
                    self.config.mount_point.display()
                );
            }
            self.mounted_by_us = false;
        }
        self.connected = false;
        Ok(())
    }

    async fn test_connection(&mut self) -> Result<(), DestError> {
        self.connect().await?;
        let root = self.root();
        let mut entries = fs::read_dir(&self.config.mount_point)
            .await
            .map_err(|err| map_io_err("probe mount", root.clone(), err, connection))?;
        // One entry is enough to prove the share answers
        let _ = entries
            .next_entry()
            .await
            .map_err(|err| map_io_err("probe mount", root, err, connection))?;
        Ok(())
    }

    async fn upload(
        &self,
        local: &Path,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<UploadResult, DestError> {
        self.ensure_connected()?;
        let native = self.native(remote_path);
        let started = Instant::now();

        let upload_failed = |err: io::Error| {
            map_io_err("upload", native.clone(), err, || DestError::UploadFailed {
                path: remote_path.to_owned(),
                source: None,
            })
        };

        if let Some(parent) = native.parent() {
            fs::create_dir_all(parent).await.map_err(upload_failed)?;
        }
        let size = fs::metadata(local).await.map_err(upload_failed)?.len();
        let reader = fs::File::open(local).await.map_err(upload_failed)?;
        let mut writer = fs::File::create(&native).await.map_err(upload_failed)?;

        let (_, checksum) = self
            .copy_with_progress(reader, Some(&mut writer), size, &progress, "upload", &native)
            .await?;

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
        self.ensure_connected()?;
        let native = self.native(remote_path);
        match fs::metadata(&native).await {
            Ok(meta) => Ok(Some(FileMeta {
                path: remote_path.to_owned(),
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                checksum: None,
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_io_err("stat", native, err, connection)),
        }
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileMeta>, DestError> {
        self.ensure_connected()?;
        let native = self.native(directory);
        let dir_prefix = directory.trim_matches('/');

        let mut entries = match fs::read_dir(&native).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(map_io_err("list", native, err, connection)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| map_io_err("list", native.clone(), err, connection))?
        {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = if dir_prefix.is_empty() {
                name
            } else {
                format!("{dir_prefix}/{name}")
            };
            files.push(FileMeta {
                path,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                checksum: None,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn delete(&self, remote_path: &str) -> Result<(), DestError> {
        self.ensure_connected()?;
        let native = self.native(remote_path);
        match fs::remove_file(&native).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(DestError::FileNotFound(remote_path.to_owned()))
            }
            Err(err) => Err(map_io_err("delete", native, err, connection)),
        }
    }

    async fn download(
        &self,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<Vec<u8>, DestError> {
        self.ensure_connected()?;
        let native = self.native(remote_path);
        let reader = match fs::File::open(&native).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(DestError::FileNotFound(remote_path.to_owned()))
            }
            Err(err) => return Err(map_io_err("download", native, err, connection)),
        };
        let size = reader
            .metadata()
            .await
            .map_err(|err| map_io_err("download", native.clone(), err, connection))?
            .len();

        let (bytes, _) = self
            .copy_with_progress(reader, None, size, &progress, "download", &native)
            .await?;
        Ok(bytes)
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

fn connection() -> DestError {
    DestError::ConnectionFailed(None)
}

/// Maps an io failure into the taxonomy, keeping the OS error code in the
/// error chain
fn map_io_err(
    op: &'static str,
    path: PathBuf,
    err: io::Error,
    default: impl FnOnce() -> DestError,
) -> DestError {
    const ENETUNREACH: i32 = 101;
    const EHOSTUNREACH: i32 = 113;

    let code = err.raw_os_error();
    match err.kind() {
        io::ErrorKind::NotFound => DestError::FileNotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => DestError::AuthFailed,
        io::ErrorKind::TimedOut => DestError::Timeout,
        _ if matches!(code, Some(ENETUNREACH) | Some(EHOSTUNREACH)) => {
            DestError::NetworkUnreachable
        }
        _ => {
            let wrapped = FsOpError {
                op,
                path,
                code,
                source: err,
            };
            match default() {
                DestError::UploadFailed { path, .. } => DestError::UploadFailed {
                    path,
                    source: Some(wrapped.into()),
                },
                _ => DestError::ConnectionFailed(Some(wrapped.into())),
            }
        }
    }
}

fn map_mount_failure(output: &Output) -> DestError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    let lowered = stderr.to_lowercase();

    if lowered.contains("permission denied") || lowered.contains("authentication") {
        DestError::AuthFailed
    } else if lowered.contains("unreachable") || lowered.contains("no route") {
        DestError::NetworkUnreachable
    } else if lowered.contains("timed out") {
        DestError::Timeout
    } else {
        DestError::ConnectionFailed(Some(
            MountFailure {
                code: output.status.code(),
                stderr,
            }
            .into(),
        ))
    }
}
