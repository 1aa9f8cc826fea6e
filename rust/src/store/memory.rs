//! In-process artifact store.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{ArtifactStore, StoreError};
use crate::models::{ArtifactKey, FieldArray};

/// Artifact store backed by a locked hash map.
///
/// The existence check and insert of `write` happen under one lock, so
/// concurrent rollouts sharing the store cannot both publish a key.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<FxHashMap<ArtifactKey, FieldArray>>,
    writes: Mutex<Vec<ArtifactKey>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys in the order they were successfully written.
    pub fn write_log(&self) -> Vec<ArtifactKey> {
        self.writes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.lock().is_empty()
    }

    /// Drop one artifact, e.g. to simulate a torn multi-kind write.
    pub fn remove(&self, key: &ArtifactKey) -> Option<FieldArray> {
        self.artifacts.lock().remove(key)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        Ok(self.artifacts.lock().contains_key(key))
    }

    fn read(&self, key: &ArtifactKey) -> Result<FieldArray, StoreError> {
        self.artifacts
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn write(&self, key: &ArtifactKey, array: &FieldArray) -> Result<(), StoreError> {
        let mut artifacts = self.artifacts.lock();
        if artifacts.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.clone()));
        }
        artifacts.insert(key.clone(), array.clone());
        self.writes.lock().push(key.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_write_then_read() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::new("surface", 3600);
        let array = FieldArray::from_elem(vec![2, 2], 4.0);

        assert!(!store.exists(&key).unwrap());
        assert!(matches!(store.read(&key), Err(StoreError::NotFound(_))));

        store.write(&key, &array).unwrap();
        assert!(store.exists(&key).unwrap());
        assert_eq!(store.read(&key).unwrap(), array);
        assert_eq!(store.write_log(), vec![key]);
    }

    #[test]
    fn test_second_write_is_rejected() {
        let store = MemoryArtifactStore::new();
        let key = ArtifactKey::new("upper", 0);
        store.write(&key, &FieldArray::from_elem(vec![1], 1.0)).unwrap();

        let err = store
            .write(&key, &FieldArray::from_elem(vec![1], 2.0))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(k) if k == key));
        assert_eq!(store.read(&key).unwrap(), FieldArray::from_elem(vec![1], 1.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_writers_publish_once() {
        let store = Arc::new(MemoryArtifactStore::new());
        let key = ArtifactKey::new("surface", 0);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let key = key.clone();
                std::thread::spawn(move || {
                    store
                        .write(&key, &FieldArray::from_elem(vec![1], i as f32))
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.write_log().len(), 1);
    }
}
