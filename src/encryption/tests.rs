use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::*;
use crate::test_utils::{log, store::MemorySecureStore, temp};

const PASSPHRASE: &str = "correct horse battery";

fn configured() -> (Arc<MemorySecureStore>, Encryptor) {
    let store = Arc::new(MemorySecureStore::default());
    let encryptor = Encryptor::new(store.clone());
    encryptor.setup(PASSPHRASE).unwrap();
    (store, encryptor)
}

#[test]
fn round_trips_arbitrary_bytes() {
    log::init();

    let (_, encryptor) = configured();
    for plaintext in [&b""[..], b"a", b"snapshot of a photo", &[0u8; 4_096]] {
        let (combined, nonce) = encryptor.encrypt_bytes(plaintext).unwrap();
        assert_eq!(&combined[..NONCE_LEN], nonce.as_slice());
        assert_eq!(combined.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
        assert_eq!(encryptor.decrypt_bytes(&combined).unwrap(), plaintext);
    }
}

// Authenticated encryption has to reject any bit flip, wherever it lands
#[test]
fn tampering_fails_authentication() {
    log::init();

    let (_, encryptor) = configured();
    let (combined, _) = encryptor.encrypt_bytes(b"original payload").unwrap();

    // One flip in the nonce, the ciphertext body, and the tag
    for index in [0, NONCE_LEN + 2, combined.len() - 1] {
        let mut tampered = combined.clone();
        tampered[index] ^= 0x01;
        assert!(matches!(
            encryptor.decrypt_bytes(&tampered),
            Err(EncryptionError::DecryptFail)
        ));
    }

    // Truncation below the minimum layout is rejected outright
    assert!(matches!(
        encryptor.decrypt_bytes(&combined[..NONCE_LEN + TAG_LEN - 1]),
        Err(EncryptionError::DecryptFail)
    ));
}

#[test]
fn nonces_are_never_reused() {
    log::init();

    let (_, encryptor) = configured();
    let (first, first_nonce) = encryptor.encrypt_bytes(b"same input").unwrap();
    let (second, second_nonce) = encryptor.encrypt_bytes(b"same input").unwrap();

    assert_ne!(first_nonce, second_nonce);
    assert_ne!(first, second);
}

#[test]
fn file_round_trip() {
    log::init();

    let (_, encryptor) = configured();
    let (_guard, dir) = temp::dir();

    let plain = dir.join("IMG-0001.jpg");
    let sealed = dir.join("IMG-0001.jpg.encrypted");
    let restored = dir.join("restored.jpg");
    let body: Vec<u8> = (0..10_000).map(|n| (n % 255) as u8).collect();
    std::fs::write(&plain, &body).unwrap();

    encryptor.encrypt_file(&plain, &sealed).unwrap();
    let sealed_bytes = std::fs::read(&sealed).unwrap();
    assert_eq!(sealed_bytes.len(), body.len() + NONCE_LEN + TAG_LEN);
    assert_ne!(&sealed_bytes[NONCE_LEN..NONCE_LEN + body.len()], &body[..]);

    encryptor.decrypt_file(&sealed, &restored).unwrap();
    assert_eq!(std::fs::read(&restored).unwrap(), body);
}

#[test]
fn passphrase_lifecycle() {
    log::init();

    let store = Arc::new(MemorySecureStore::default());
    let encryptor = Encryptor::new(store.clone());

    // Nothing set up yet
    assert!(!encryptor.is_configured().unwrap());
    assert!(matches!(
        encryptor.encrypt_bytes(b"x"),
        Err(EncryptionError::KeyNotFound)
    ));
    assert!(matches!(
        encryptor.verify(PASSPHRASE),
        Err(EncryptionError::KeyNotFound)
    ));

    // Too-short passphrases are refused before touching the store
    assert!(matches!(
        encryptor.setup("short"),
        Err(EncryptionError::InvalidPassphrase)
    ));

    encryptor.setup(PASSPHRASE).unwrap();
    assert!(encryptor.is_configured().unwrap());
    assert!(encryptor.verify(PASSPHRASE).unwrap());
    assert!(!encryptor.verify("not the passphrase").unwrap());

    // Removing twice is fine
    encryptor.remove().unwrap();
    encryptor.remove().unwrap();
    assert!(!encryptor.is_configured().unwrap());
}

// Re-running setup derives a different key even for the same passphrase, so
// the salt is doing its job
#[test]
fn setup_salts_freshly() {
    log::init();

    let store = Arc::new(MemorySecureStore::default());
    let encryptor = Encryptor::new(store.clone());

    encryptor.setup(PASSPHRASE).unwrap();
    let first = store.get("snapvault", "master-key").unwrap().unwrap();
    encryptor.setup(PASSPHRASE).unwrap();
    let second = store.get("snapvault", "master-key").unwrap().unwrap();

    assert_eq!(first.len(), 64);
    assert_eq!(second.len(), 64);
    assert_ne!(first, second);
}

#[test]
fn malformed_key_material_is_rejected() {
    log::init();

    let store = Arc::new(MemorySecureStore::default());
    let encryptor = Encryptor::new(store.clone());
    store
        .put("snapvault", "master-key", &[0u8; 63], Default::default())
        .unwrap();

    assert!(matches!(
        encryptor.encrypt_bytes(b"x"),
        Err(EncryptionError::InvalidKeyData)
    ));
}

#[test]
fn secure_store_codes_surface() {
    log::init();

    let store = Arc::new(MemorySecureStore::default());
    let encryptor = Encryptor::new(store.clone());
    *store.broken_with.lock() = Some(-25_300);

    assert!(matches!(
        encryptor.is_configured(),
        Err(EncryptionError::SecureStore(-25_300))
    ));
}
