//! Typed key/value seam over the OS credential vault
//!
//! The real vault is host-provided; the engine only relies on this contract.
//! We ship a plain-file implementation so the CLI works on systems where no
//! vault integration is wired up, with file modes standing in for the vault's
//! access control.

use std::{fs, io, path::PathBuf};

/// Named policy mirroring vault accessibility classes; implementers pick the
/// OS-appropriate equivalent
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Accessibility {
    #[default]
    WhenUnlocked,
    AfterFirstUnlock,
}

#[derive(Debug, thiserror::Error)]
#[error("secure store operation failed (status {code})")]
pub struct SecureStoreError {
    pub code: i32,
}

impl SecureStoreError {
    fn from_io(err: &io::Error) -> Self {
        Self {
            code: err.raw_os_error().unwrap_or(-1),
        }
    }
}

pub trait SecureStore: Send + Sync {
    fn get(&self, service: &str, account: &str) -> Result<Option<Vec<u8>>, SecureStoreError>;

    fn put(
        &self,
        service: &str,
        account: &str,
        value: &[u8],
        accessibility: Accessibility,
    ) -> Result<(), SecureStoreError>;

    /// Idempotent: deleting an absent item is success
    fn delete(&self, service: &str, account: &str) -> Result<(), SecureStoreError>;
}

/// File-backed store keeping one private file per `(service, account)` pair
pub struct FileSecureStore {
    dir: PathBuf,
}

impl FileSecureStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn item_path(&self, service: &str, account: &str) -> PathBuf {
        self.dir.join(format!("{service}.{account}"))
    }
}

impl SecureStore for FileSecureStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<Vec<u8>>, SecureStoreError> {
        match fs::read(self.item_path(service, account)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SecureStoreError::from_io(&err)),
        }
    }

    fn put(
        &self,
        service: &str,
        account: &str,
        value: &[u8],
        _accessibility: Accessibility,
    ) -> Result<(), SecureStoreError> {
        fs::create_dir_all(&self.dir).map_err(|err| SecureStoreError::from_io(&err))?;
        let path = self.item_path(service, account);
        fs::write(&path, value).map_err(|err| SecureStoreError::from_io(&err))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .map_err(|err| SecureStoreError::from_io(&err))?;
        }

        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), SecureStoreError> {
        match fs::remove_file(self.item_path(service, account)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SecureStoreError::from_io(&err)),
        }
    }
}
