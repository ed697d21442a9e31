use std::collections::HashMap;
use std::sync::Mutex;

use super::{KeyStore, StoreError, StoreResult, Version, Versioned};

/// In-process store. Same contract as the file store, used for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

impl KeyStore for MemoryStore {
    fn create_if_absent(&self, name: &str, bytes: &[u8]) -> StoreResult<Version> {
        let mut guard = self.inner.lock().map_err(poisoned)?;
        if guard.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        guard.insert(name.to_string(), Versioned { bytes: bytes.to_vec(), version: 1 });
        Ok(1)
    }

    fn read(&self, name: &str) -> StoreResult<Versioned> {
        let guard = self.inner.lock().map_err(poisoned)?;
        guard.get(name).cloned().ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn write_if_version(&self, name: &str, bytes: &[u8], expected: Version) -> StoreResult<Version> {
        let mut guard = self.inner.lock().map_err(poisoned)?;
        let entry = guard.get_mut(name).ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if entry.version != expected {
            return Err(StoreError::Conflict { name: name.to_string(), expected });
        }
        entry.bytes = bytes.to_vec();
        entry.version += 1;
        Ok(entry.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_exclusive() {
        let store = MemoryStore::new();
        assert_eq!(store.create_if_absent("alpha", b"one").unwrap(), 1);
        assert!(matches!(store.create_if_absent("alpha", b"two"), Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.read("alpha").unwrap().bytes, b"one");
    }

    #[test]
    fn stale_version_is_rejected() {
        let store = MemoryStore::new();
        store.create_if_absent("alpha", b"one").unwrap();
        assert_eq!(store.write_if_version("alpha", b"two", 1).unwrap(), 2);
        assert!(matches!(
            store.write_if_version("alpha", b"three", 1),
            Err(StoreError::Conflict { expected: 1, .. })
        ));
        let current = store.read("alpha").unwrap();
        assert_eq!(current.bytes, b"two");
        assert_eq!(current.version, 2);
    }

    #[test]
    fn missing_record() {
        let store = MemoryStore::new();
        assert!(matches!(store.read("ghost"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.write_if_version("ghost", b"x", 1), Err(StoreError::NotFound(_))));
    }
}
