//! Core data types for forecast rollouts.

use ndarray::ArrayD;
use numpy::{PyArrayDyn, PyReadonlyArrayDyn};
use pyo3::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Seconds since the Unix epoch, UTC.
pub type Timestamp = i64;

pub const SECONDS_PER_HOUR: i64 = 3600;

/// Separator between field kind and timestamp in artifact names.
pub const KEY_SEPARATOR: char = '-';

/// File extension used for persisted field arrays.
pub const ARTIFACT_EXTENSION: &str = "npy";

/// Violations of the snapshot data model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelDataError {
    #[error("field kinds disagree on timestamp: {0}")]
    MixedTimestamps(String),
    #[error("snapshot has no field kinds")]
    Empty,
    #[error("invalid artifact name: {0:?}")]
    InvalidArtifactName(String),
}

/// A fixed-shape numeric tensor for one field kind.
pub type FieldArray = ArrayD<f32>;

/// True when no element is NaN or infinite.
pub fn all_finite(array: &FieldArray) -> bool {
    array.iter().all(|v| v.is_finite())
}

/// Copy a NumPy array into a field array.
///
/// `float32` arrays are taken as is; `float64` arrays are narrowed the way
/// `astype(np.float32)` would.
pub fn field_from_py(value: &Bound<'_, PyAny>) -> PyResult<FieldArray> {
    if let Ok(array) = value.extract::<PyReadonlyArrayDyn<'_, f32>>() {
        return Ok(array.as_array().to_owned());
    }
    let array = value.extract::<PyReadonlyArrayDyn<'_, f64>>()?;
    Ok(array.as_array().mapv(|v| v as f32))
}

/// Hand a field array to Python as a `float32` NumPy array.
pub fn field_to_py<'py>(py: Python<'py>, array: &FieldArray) -> Bound<'py, PyArrayDyn<f32>> {
    PyArrayDyn::from_array_bound(py, array)
}

/// Durable identity of one persisted field array: `{kind}-{timestamp}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub kind: String,
    pub timestamp: Timestamp,
}

impl ArtifactKey {
    pub fn new(kind: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            kind: kind.into(),
            timestamp,
        }
    }

    /// File name under which the key is persisted, e.g. `surface-1689433200.npy`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self, ARTIFACT_EXTENSION)
    }

    /// Parse a name produced by [`ArtifactKey::file_name`].
    ///
    /// The timestamp is taken after the last separator so negative
    /// timestamps are not supported in file names.
    pub fn parse_file_name(name: &str) -> Result<Self, ModelDataError> {
        let invalid = || ModelDataError::InvalidArtifactName(name.to_string());
        let stem = name
            .strip_suffix(ARTIFACT_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;
        let (kind, ts) = stem.rsplit_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        if kind.is_empty() || ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let timestamp = ts.parse::<Timestamp>().map_err(|_| invalid())?;
        Ok(Self::new(kind, timestamp))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.kind, KEY_SEPARATOR, self.timestamp)
    }
}

/// Reference to a snapshot materialized in an artifact store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRef {
    pub timestamp: Timestamp,
    pub kinds: Vec<String>,
}

impl SnapshotRef {
    pub fn new(timestamp: Timestamp, kinds: Vec<String>) -> Self {
        Self { timestamp, kinds }
    }

    /// Assemble a reference from per-kind keys, which must share one timestamp.
    pub fn from_keys(keys: &[ArtifactKey]) -> Result<Self, ModelDataError> {
        let first = keys.first().ok_or(ModelDataError::Empty)?;
        if keys.iter().any(|k| k.timestamp != first.timestamp) {
            let listed: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
            return Err(ModelDataError::MixedTimestamps(listed.join(", ")));
        }
        Ok(Self {
            timestamp: first.timestamp,
            kinds: keys.iter().map(|k| k.kind.clone()).collect(),
        })
    }

    /// Keys of every field kind of this snapshot.
    pub fn keys(&self) -> impl Iterator<Item = ArtifactKey> + '_ {
        self.kinds
            .iter()
            .map(move |kind| ArtifactKey::new(kind.clone(), self.timestamp))
    }
}

/// Forecast state at one instant: named field arrays sharing a timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct StateSnapshot {
    pub timestamp: Timestamp,
    pub fields: BTreeMap<String, FieldArray>,
}

impl StateSnapshot {
    pub fn new(timestamp: Timestamp, fields: BTreeMap<String, FieldArray>) -> Self {
        Self { timestamp, fields }
    }

    /// Pair field arrays that were loaded independently.
    ///
    /// Fails when the parts carry different timestamps.
    pub fn from_parts(
        parts: Vec<(ArtifactKey, FieldArray)>,
    ) -> Result<Self, ModelDataError> {
        let keys: Vec<ArtifactKey> = parts.iter().map(|(k, _)| k.clone()).collect();
        let reference = SnapshotRef::from_keys(&keys)?;
        let fields = parts
            .into_iter()
            .map(|(key, array)| (key.kind, array))
            .collect();
        Ok(Self {
            timestamp: reference.timestamp,
            fields,
        })
    }

    pub fn field(&self, kind: &str) -> Option<&FieldArray> {
        self.fields.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn to_ref(&self) -> SnapshotRef {
        SnapshotRef::new(self.timestamp, self.fields.keys().cloned().collect())
    }
}
