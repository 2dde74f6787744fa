use std::collections::HashMap;

use parking_lot::Mutex;

use crate::secure_store::{Accessibility, SecureStore, SecureStoreError};

/// In-memory secure store for exercising the encryption flows
#[derive(Default)]
pub struct MemorySecureStore {
    items: Mutex<HashMap<(String, String), Vec<u8>>>,
    /// When set, every operation fails with this status code
    pub broken_with: Mutex<Option<i32>>,
}

impl MemorySecureStore {
    fn check_broken(&self) -> Result<(), SecureStoreError> {
        match *self.broken_with.lock() {
            Some(code) => Err(SecureStoreError { code }),
            None => Ok(()),
        }
    }
}

impl SecureStore for MemorySecureStore {
    fn get(&self, service: &str, account: &str) -> Result<Option<Vec<u8>>, SecureStoreError> {
        self.check_broken()?;
        Ok(self
            .items
            .lock()
            .get(&(service.to_owned(), account.to_owned()))
            .cloned())
    }

    fn put(
        &self,
        service: &str,
        account: &str,
        value: &[u8],
        _accessibility: Accessibility,
    ) -> Result<(), SecureStoreError> {
        self.check_broken()?;
        self.items
            .lock()
            .insert((service.to_owned(), account.to_owned()), value.to_owned());
        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), SecureStoreError> {
        self.check_broken()?;
        self.items
            .lock()
            .remove(&(service.to_owned(), account.to_owned()));
        Ok(())
    }
}
