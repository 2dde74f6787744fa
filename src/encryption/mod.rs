//! Optional client-side encryption for uploaded assets
//!
//! A 256-bit key is derived from the user's passphrase with
//! PBKDF2-HMAC-SHA-256 and persisted (together with its salt) in the secure
//! store, so backups stay decryptable across sessions without keeping the
//! passphrase anywhere. Files are sealed one at a time with AES-256-GCM; the
//! on-disk layout is exactly `nonce(12) || ciphertext || tag(16)` with no
//! header, and encrypted uploads carry an `.encrypted` path suffix so
//! downstream tooling can tell them apart.

#[cfg(test)]
mod tests;

use std::{fs, path::Path, sync::Arc};

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng as AeadOsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::secure_store::{Accessibility, SecureStore, SecureStoreError};

const SERVICE: &str = "snapvault";
const ACCOUNT: &str = "master-key";

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const MIN_PASSPHRASE_LEN: usize = 12;

/// Appended to remote paths of encrypted objects
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("passphrase must be at least {MIN_PASSPHRASE_LEN} characters")]
    InvalidPassphrase,
    #[error("no encryption key is configured")]
    KeyNotFound,
    #[error("the stored key material is malformed")]
    InvalidKeyData,
    #[error("failed generating key material")]
    KeyGen,
    #[error("encryption failed")]
    EncryptFail,
    #[error("decryption failed (wrong key or tampered data)")]
    DecryptFail,
    #[error("the secure store refused the operation (status {0})")]
    SecureStore(i32),
}

impl From<SecureStoreError> for EncryptionError {
    fn from(err: SecureStoreError) -> Self {
        Self::SecureStore(err.code)
    }
}

#[derive(Clone)]
pub struct Encryptor {
    store: Arc<dyn SecureStore>,
}

impl Encryptor {
    pub fn new(store: Arc<dyn SecureStore>) -> Self {
        Self { store }
    }

    /// Derives a fresh key from `passphrase` and persists `salt || key` as a
    /// single blob
    pub fn setup(&self, passphrase: &str) -> Result<(), EncryptionError> {
        if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
            return Err(EncryptionError::InvalidPassphrase);
        }

        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|_| EncryptionError::KeyGen)?;
        let key = derive_key(passphrase, &salt);

        let mut blob = Vec::with_capacity(SALT_LEN + KEY_LEN);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&key);
        self.store
            .put(SERVICE, ACCOUNT, &blob, Accessibility::WhenUnlocked)?;
        Ok(())
    }

    /// Checks a passphrase against the stored key material
    pub fn verify(&self, passphrase: &str) -> Result<bool, EncryptionError> {
        let (salt, key) = self.load_blob()?;
        Ok(derive_key(passphrase, &salt) == key)
    }

    /// Idempotent: removing a key that was never set up is success
    pub fn remove(&self) -> Result<(), EncryptionError> {
        self.store.delete(SERVICE, ACCOUNT)?;
        Ok(())
    }

    pub fn is_configured(&self) -> Result<bool, EncryptionError> {
        Ok(self.store.get(SERVICE, ACCOUNT)?.is_some())
    }

    pub fn encrypt_bytes(
        &self,
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; NONCE_LEN]), EncryptionError> {
        let key = self.load_key()?;
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| EncryptionError::InvalidKeyData)?;

        // Fresh nonce per call; reuse would void GCM's guarantees
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| EncryptionError::EncryptFail)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(nonce.as_slice());
        combined.extend_from_slice(&ciphertext);
        Ok((combined, nonce.into()))
    }

    pub fn decrypt_bytes(&self, combined: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if combined.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::DecryptFail);
        }
        let key = self.load_key()?;
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|_| EncryptionError::InvalidKeyData)?;

        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::DecryptFail)
    }

    /// Seals `src` into `dst`; CPU bound, so callers run it off the I/O loop
    pub fn encrypt_file(&self, src: &Path, dst: &Path) -> Result<(), EncryptionError> {
        let plaintext = fs::read(src).map_err(|_| EncryptionError::EncryptFail)?;
        let (combined, _) = self.encrypt_bytes(&plaintext)?;
        fs::write(dst, combined).map_err(|_| EncryptionError::EncryptFail)
    }

    pub fn decrypt_file(&self, src: &Path, dst: &Path) -> Result<(), EncryptionError> {
        let combined = fs::read(src).map_err(|_| EncryptionError::DecryptFail)?;
        let plaintext = self.decrypt_bytes(&combined)?;
        fs::write(dst, plaintext).map_err(|_| EncryptionError::DecryptFail)
    }

    fn load_key(&self) -> Result<[u8; KEY_LEN], EncryptionError> {
        self.load_blob().map(|(_, key)| key)
    }

    fn load_blob(&self) -> Result<([u8; SALT_LEN], [u8; KEY_LEN]), EncryptionError> {
        let blob = self
            .store
            .get(SERVICE, ACCOUNT)?
            .ok_or(EncryptionError::KeyNotFound)?;
        if blob.len() != SALT_LEN + KEY_LEN {
            return Err(EncryptionError::InvalidKeyData);
        }

        let mut salt = [0u8; SALT_LEN];
        let mut key = [0u8; KEY_LEN];
        salt.copy_from_slice(&blob[..SALT_LEN]);
        key.copy_from_slice(&blob[SALT_LEN..]);
        Ok((salt, key))
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}
