use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::dest::{
    DestError, DestinationBackend, FileMeta, ProgressFn, TransferTuning, UploadResult,
};

#[derive(Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    upload_count: usize,
    /// Remote paths whose uploads should fail
    poisoned: Vec<String>,
    /// Artificial per-upload latency so tests can catch a run mid-flight
    upload_delay: Option<Duration>,
    /// Same, for stats driving verification scans
    stat_delay: Option<Duration>,
    connected: bool,
}

#[derive(Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    /// Lets tests fake an out-of-band corruption where the remote size no
    /// longer matches the content
    reported_size: u64,
    modified: DateTime<Utc>,
    multipart: bool,
}

/// In-memory destination with scriptable failures and out-of-band mutation
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<State>>,
    tuning: TransferTuning,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tuning(tuning: TransferTuning) -> Self {
        Self {
            state: Arc::default(),
            tuning,
        }
    }

    pub fn poison(&self, remote_path: &str) {
        self.state.lock().poisoned.push(remote_path.to_owned());
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        self.state.lock().upload_delay = Some(delay);
    }

    pub fn set_stat_delay(&self, delay: Duration) {
        self.state.lock().stat_delay = Some(delay);
    }

    pub fn remove_object(&self, remote_path: &str) -> bool {
        self.state.lock().objects.remove(remote_path).is_some()
    }

    /// Plants an object directly, bypassing `upload`
    pub fn seed_object(&self, remote_path: &str, bytes: Vec<u8>) {
        self.state.lock().objects.insert(
            remote_path.to_owned(),
            StoredObject {
                reported_size: bytes.len() as u64,
                bytes,
                modified: Utc::now(),
                multipart: false,
            },
        );
    }

    /// Fakes remote corruption by changing only the size the store reports
    pub fn corrupt_reported_size(&self, remote_path: &str, size: u64) {
        if let Some(object) = self.state.lock().objects.get_mut(remote_path) {
            object.reported_size = size;
        }
    }

    pub fn object(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(remote_path)
            .map(|object| object.bytes.clone())
    }

    pub fn object_paths(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().upload_count
    }

    pub fn was_multipart(&self, remote_path: &str) -> Option<bool> {
        self.state
            .lock()
            .objects
            .get(remote_path)
            .map(|object| object.multipart)
    }
}

#[async_trait::async_trait]
impl DestinationBackend for MemoryDestination {
    async fn connect(&mut self) -> Result<(), DestError> {
        self.state.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DestError> {
        self.state.lock().connected = false;
        Ok(())
    }

    async fn test_connection(&mut self) -> Result<(), DestError> {
        self.connect().await
    }

    async fn upload(
        &self,
        local: &Path,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<UploadResult, DestError> {
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|err| DestError::UploadFailed {
                path: remote_path.to_owned(),
                source: Some(err.into()),
            })?;

        let delay = self.state.lock().upload_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut state = self.state.lock();
            state.upload_count += 1;
            if state.poisoned.iter().any(|p| remote_path.contains(p.as_str())) {
                return Err(DestError::UploadFailed {
                    path: remote_path.to_owned(),
                    source: None,
                });
            }
        }

        let size = bytes.len() as u64;
        let multipart = self.tuning.is_multipart(size);
        if multipart {
            // Emulate per-part progress reporting
            let parts = size.div_ceil(self.tuning.part_size);
            for part in 1..=parts {
                let uploaded = (part * self.tuning.part_size).min(size);
                progress(uploaded as f64 / size as f64);
            }
        } else {
            progress(1.0);
        }

        let checksum = hex::encode(Sha256::digest(&bytes));
        self.state.lock().objects.insert(
            remote_path.to_owned(),
            StoredObject {
                reported_size: size,
                bytes,
                modified: Utc::now(),
                multipart,
            },
        );

        Ok(UploadResult {
            remote_path: remote_path.to_owned(),
            checksum,
            size,
            duration: Duration::from_millis(1),
        })
    }

    async fn exists(&self, remote_path: &str) -> Result<bool, DestError> {
        Ok(self.state.lock().objects.contains_key(remote_path))
    }

    async fn stat(&self, remote_path: &str) -> Result<Option<FileMeta>, DestError> {
        let delay = self.state.lock().stat_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state
            .lock()
            .objects
            .get(remote_path)
            .map(|object| FileMeta {
                path: remote_path.to_owned(),
                size: object.reported_size,
                modified: Some(object.modified),
                checksum: None,
            }))
    }

    async fn list(&self, directory: &str) -> Result<Vec<FileMeta>, DestError> {
        let prefix = format!("{}/", directory.trim_matches('/'));
        Ok(self
            .state
            .lock()
            .objects
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, object)| FileMeta {
                path: path.clone(),
                size: object.reported_size,
                modified: Some(object.modified),
                checksum: None,
            })
            .collect())
    }

    async fn delete(&self, remote_path: &str) -> Result<(), DestError> {
        if self.state.lock().objects.remove(remote_path).is_some() {
            Ok(())
        } else {
            Err(DestError::FileNotFound(remote_path.to_owned()))
        }
    }

    async fn download(
        &self,
        remote_path: &str,
        progress: ProgressFn,
    ) -> Result<Vec<u8>, DestError> {
        let bytes = self
            .object(remote_path)
            .ok_or_else(|| DestError::FileNotFound(remote_path.to_owned()))?;
        progress(1.0);
        Ok(bytes)
    }

    async fn verify_checksum(
        &self,
        remote_path: &str,
        expected_size: u64,
    ) -> Result<bool, DestError> {
        Ok(self
            .stat(remote_path)
            .await?
            .is_some_and(|meta| meta.size == expected_size))
    }
}
