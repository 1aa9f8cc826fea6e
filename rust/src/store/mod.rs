//! Artifact store: timestamp-keyed persistence for field arrays.
//!
//! Keys are `(kind, timestamp)` pairs. Artifacts are immutable once
//! written, so a store rejects a second write to the same key instead of
//! overwriting it. A snapshot counts as materialized only when every one
//! of its kinds is present; see [`ArtifactStore::presence`].

mod file;
mod memory;
pub mod npy;

pub use file::FileArtifactStore;
pub use memory::MemoryArtifactStore;

use std::path::PathBuf;
use thiserror::Error;

use crate::config::is_valid_kind;
use crate::models::{all_finite, ArtifactKey, FieldArray, StateSnapshot, Timestamp};

/// Errors raised by artifact stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(ArtifactKey),
    #[error("artifact already exists: {0}")]
    AlreadyExists(ArtifactKey),
    #[error("refusing to write {key}: {reason}")]
    Rejected { key: ArtifactKey, reason: String },
    #[error("malformed artifact {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// How much of a snapshot is materialized at one timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// Every requested kind exists.
    All,
    /// No requested kind exists.
    None,
    /// Some kinds exist: the signature of an interrupted multi-kind write.
    Partial {
        present: Vec<String>,
        missing: Vec<String>,
    },
}

/// Persistence contract consumed by the rollout engine.
pub trait ArtifactStore {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError>;

    /// Read one field array; a missing key is [`StoreError::NotFound`].
    fn read(&self, key: &ArtifactKey) -> Result<FieldArray, StoreError>;

    /// Write one field array; an existing key is [`StoreError::AlreadyExists`].
    fn write(&self, key: &ArtifactKey, array: &FieldArray) -> Result<(), StoreError>;

    /// Check every kind at `timestamp`, never a subset.
    fn presence(&self, kinds: &[String], timestamp: Timestamp) -> Result<Presence, StoreError> {
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for kind in kinds {
            if self.exists(&ArtifactKey::new(kind.clone(), timestamp))? {
                present.push(kind.clone());
            } else {
                missing.push(kind.clone());
            }
        }
        Ok(if missing.is_empty() {
            Presence::All
        } else if present.is_empty() {
            Presence::None
        } else {
            Presence::Partial { present, missing }
        })
    }

    /// Load every kind of a snapshot.
    fn read_snapshot(
        &self,
        kinds: &[String],
        timestamp: Timestamp,
    ) -> Result<StateSnapshot, StoreError> {
        let mut fields = std::collections::BTreeMap::new();
        for kind in kinds {
            let key = ArtifactKey::new(kind.clone(), timestamp);
            fields.insert(kind.clone(), self.read(&key)?);
        }
        Ok(StateSnapshot::new(timestamp, fields))
    }

    /// Write every field of `snapshot`.
    ///
    /// All fields are checked before the first write: a kind that cannot
    /// name an artifact, a non-finite value or an already stored key
    /// rejects the whole call and nothing is written.
    fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<Vec<ArtifactKey>, StoreError> {
        let mut keys = Vec::with_capacity(snapshot.fields.len());
        for (kind, array) in &snapshot.fields {
            let key = ArtifactKey::new(kind.clone(), snapshot.timestamp);
            let reason = if !is_valid_kind(kind) {
                Some("invalid field kind")
            } else if !all_finite(array) {
                Some("field contains non-finite values")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(StoreError::Rejected {
                    key,
                    reason: reason.to_string(),
                });
            }
            if self.exists(&key)? {
                return Err(StoreError::AlreadyExists(key));
            }
            keys.push(key);
        }
        for key in &keys {
            self.write(key, &snapshot.fields[&key.kind])?;
        }
        Ok(keys)
    }
}

impl<S: ArtifactStore + ?Sized> ArtifactStore for &S {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        (**self).exists(key)
    }

    fn read(&self, key: &ArtifactKey) -> Result<FieldArray, StoreError> {
        (**self).read(key)
    }

    fn write(&self, key: &ArtifactKey, array: &FieldArray) -> Result<(), StoreError> {
        (**self).write(key, array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds() -> Vec<String> {
        vec!["surface".to_string(), "upper".to_string()]
    }

    #[test]
    fn test_presence_states() {
        let store = MemoryArtifactStore::new();
        assert_eq!(store.presence(&kinds(), 0).unwrap(), Presence::None);

        store
            .write(&ArtifactKey::new("surface", 0), &FieldArray::from_elem(vec![1], 0.0))
            .unwrap();
        assert_eq!(
            store.presence(&kinds(), 0).unwrap(),
            Presence::Partial {
                present: vec!["surface".to_string()],
                missing: vec!["upper".to_string()],
            }
        );

        store
            .write(&ArtifactKey::new("upper", 0), &FieldArray::from_elem(vec![1], 0.0))
            .unwrap();
        assert_eq!(store.presence(&kinds(), 0).unwrap(), Presence::All);
    }

    #[test]
    fn test_read_snapshot() {
        let store = MemoryArtifactStore::new();
        store
            .write(&ArtifactKey::new("surface", 7), &FieldArray::from_elem(vec![2], 1.0))
            .unwrap();
        store
            .write(&ArtifactKey::new("upper", 7), &FieldArray::from_elem(vec![3], 2.0))
            .unwrap();

        let by_ref: &dyn ArtifactStore = &store;
        let snapshot = by_ref.read_snapshot(&kinds(), 7).unwrap();
        assert_eq!(snapshot.timestamp, 7);
        assert_eq!(snapshot.field("upper").unwrap().len(), 3);

        assert!(matches!(
            store.read_snapshot(&kinds(), 8),
            Err(StoreError::NotFound(_))
        ));
    }

    fn initial(fields: &[(&str, f32)]) -> StateSnapshot {
        let fields = fields
            .iter()
            .map(|&(kind, value)| (kind.to_string(), FieldArray::from_elem(vec![2, 2], value)))
            .collect();
        StateSnapshot::new(3600, fields)
    }

    #[test]
    fn test_write_snapshot_writes_every_kind() {
        let store = MemoryArtifactStore::new();
        let keys = store
            .write_snapshot(&initial(&[("upper", 2.0), ("surface", 1.0)]))
            .unwrap();
        assert_eq!(
            keys,
            vec![ArtifactKey::new("surface", 3600), ArtifactKey::new("upper", 3600)]
        );
        assert_eq!(store.presence(&kinds(), 3600).unwrap(), Presence::All);
    }

    #[test]
    fn test_rejected_snapshot_writes_nothing() {
        let store = MemoryArtifactStore::new();

        let err = store
            .write_snapshot(&initial(&[("surface", 1.0), ("up-per", 2.0)]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { ref key, .. } if key.kind == "up-per"));
        assert!(store.is_empty());

        let err = store
            .write_snapshot(&initial(&[("surface", 1.0), ("upper", f32::NAN)]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { ref key, .. } if key.kind == "upper"));
        assert!(store.is_empty());

        store
            .write(&ArtifactKey::new("upper", 3600), &FieldArray::from_elem(vec![1], 0.0))
            .unwrap();
        let err = store
            .write_snapshot(&initial(&[("surface", 1.0), ("upper", 2.0)]))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.write_log(), vec![ArtifactKey::new("upper", 3600)]);
    }
}
