//! Filesystem-backed artifact store: one `.npy` file per key.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{npy, ArtifactStore, StoreError};
use crate::models::{ArtifactKey, FieldArray, Timestamp};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Artifact store rooted at a directory, naming files `{kind}-{timestamp}.npy`.
///
/// Files are written under a private temporary name and published with a
/// hard link. The link fails when the final name already exists, so a
/// reader never sees a half-written array and two processes racing on the
/// same key cannot overwrite each other.
///
/// The root must live on a filesystem that supports hard links. Where it
/// does not (some network and FUSE mounts), every `write` fails with
/// [`StoreError::Io`] naming the final path.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    /// Open a store, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path at which `key` is (or would be) persisted.
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Timestamps materialized for `kind`, ascending.
    pub fn timestamps(&self, kind: &str) -> Result<Vec<Timestamp>, StoreError> {
        let mut found: Vec<Timestamp> = self
            .keys()?
            .into_iter()
            .filter(|key| key.kind == kind)
            .map(|key| key.timestamp)
            .collect();
        found.sort_unstable();
        Ok(found)
    }

    /// Remove every artifact older than `cutoff`. Returns the number removed.
    ///
    /// End-of-run housekeeping for callers; rollouts never delete.
    pub fn purge_before(&self, cutoff: Timestamp) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in self.keys()? {
            if key.timestamp >= cutoff {
                continue;
            }
            let path = self.path_for(&key);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        Ok(removed)
    }

    fn keys(&self) -> Result<Vec<ArtifactKey>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Ok(key) = ArtifactKey::parse_file_name(name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn temp_path(&self, key: &ArtifactKey) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            ".{}.{}.{}.tmp",
            key.file_name(),
            std::process::id(),
            n
        ))
    }
}

impl ArtifactStore for FileArtifactStore {
    fn exists(&self, key: &ArtifactKey) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        path.try_exists().map_err(|e| StoreError::io(path, e))
    }

    fn read(&self, key: &ArtifactKey) -> Result<FieldArray, StoreError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.clone()))
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };
        npy::decode(&bytes).map_err(|reason| StoreError::Malformed { path, reason })
    }

    fn write(&self, key: &ArtifactKey, array: &FieldArray) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if self.exists(key)? {
            return Err(StoreError::AlreadyExists(key.clone()));
        }

        let temp = self.temp_path(key);
        let staged = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                npy::encode(array, &mut writer)?;
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()
            });
        if let Err(e) = staged {
            let _ = fs::remove_file(&temp);
            return Err(StoreError::io(temp, e));
        }

        let published = fs::hard_link(&temp, &path);
        let _ = fs::remove_file(&temp);
        match published {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(key.clone()))
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}
