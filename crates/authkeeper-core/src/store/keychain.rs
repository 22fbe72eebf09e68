use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use keyring::Entry;

use super::{StorageBackend, StoreError};

/// Default keychain service name
pub const SERVICE_NAME: &str = "authkeeper";

/// Stores every key as its own OS keychain entry under one service name.
pub struct KeyringBackend {
    service: String,
    // Entries are reused so that one handle sees its own writes on every platform store
    entries: Mutex<HashMap<String, Entry>>,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn with_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Entry) -> keyring::Result<T>,
    ) -> Result<T, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(key) {
            let entry = Entry::new(&self.service, key)?;
            entries.insert(key.to_string(), entry);
        }
        let entry = &entries[key];
        Ok(f(entry)?)
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl StorageBackend for KeyringBackend {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_entry(key, |entry| entry.set_password(value))
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyring_backend_with_mock_store() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());

        let backend = KeyringBackend::new("authkeeper-test");
        assert_eq!(backend.load("token").unwrap(), None);

        backend.save("token", "secret").unwrap();
        assert_eq!(backend.load("token").unwrap().as_deref(), Some("secret"));

        backend.remove("token").unwrap();
        assert_eq!(backend.load("token").unwrap(), None);
        backend.remove("token").unwrap();
    }
}
