//! Autoregressive forecast rollouts over fixed-step transition models.
//!
//! A horizon is decomposed greedily into the configured step sizes, each
//! step's output is chained into the next step's input, and every
//! intermediate snapshot is checkpointed so an interrupted rollout resumes
//! where it stopped.

// Allow clippy warning triggered by PyO3 macro expansion
#![allow(clippy::useless_conversion)]

use chrono::{DateTime, Utc};
use numpy::PyArrayDyn;
use pyo3::exceptions::{
    PyFileExistsError, PyFileNotFoundError, PyOSError, PyRuntimeError, PyValueError,
};
use pyo3::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

pub mod logging;

pub mod config;
pub mod engine;
pub mod models;
pub mod planner;
pub mod provenance;
pub mod registry;
pub mod store;

pub use config::{ConfigError, RolloutConfig};
pub use engine::{RolloutEngine, RolloutError, RolloutErrorKind, RolloutOutcome};
pub use models::{ArtifactKey, FieldArray, SnapshotRef, StateSnapshot, Timestamp};
pub use planner::{PlanError, StepChoice, StepPlanner, StepRun};
pub use provenance::{ProvenanceEntry, ProvenanceLog};
pub use registry::{
    FnTransitionModel, ModelError, PyTransitionModel, RegistryError, TransitionModel,
    TransitionRegistry,
};
pub use store::{ArtifactStore, FileArtifactStore, MemoryArtifactStore, Presence, StoreError};

fn store_err(e: StoreError) -> PyErr {
    match e {
        StoreError::AlreadyExists(_) => PyFileExistsError::new_err(e.to_string()),
        StoreError::NotFound(_) => PyFileNotFoundError::new_err(e.to_string()),
        StoreError::Rejected { .. } => PyValueError::new_err(e.to_string()),
        StoreError::Io { .. } => PyOSError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

/// Summary of a finished rollout handed to verification.
#[pyclass]
#[derive(Clone, Debug)]
pub struct RolloutReport {
    #[pyo3(get)]
    pub init_timestamp: i64,
    #[pyo3(get)]
    pub target_timestamp: i64,
    #[pyo3(get)]
    pub final_timestamp: i64,
    #[pyo3(get)]
    pub final_time: DateTime<Utc>,
    /// Artifact path of the final snapshot per field kind.
    #[pyo3(get)]
    pub final_paths: HashMap<String, String>,
    /// Step sizes applied, in order.
    #[pyo3(get)]
    pub forward_records: Vec<u32>,
    #[pyo3(get)]
    pub shortfall_seconds: i64,
    #[pyo3(get)]
    pub invocations: usize,
    #[pyo3(get)]
    pub cache_hits: usize,
}

impl RolloutReport {
    fn from_outcome(
        init_timestamp: i64,
        outcome: &RolloutOutcome,
        store: &FileArtifactStore,
    ) -> PyResult<Self> {
        let final_timestamp = outcome.final_snapshot.timestamp;
        let final_time = DateTime::<Utc>::from_timestamp(final_timestamp, 0).ok_or_else(|| {
            PyValueError::new_err(format!("timestamp {} out of range", final_timestamp))
        })?;
        let final_paths = outcome
            .final_snapshot
            .keys()
            .map(|key| {
                (
                    key.kind.clone(),
                    store.path_for(&key).to_string_lossy().into_owned(),
                )
            })
            .collect();
        Ok(Self {
            init_timestamp,
            target_timestamp: outcome.target,
            final_timestamp,
            final_time,
            final_paths,
            forward_records: outcome.provenance.step_hours(),
            shortfall_seconds: outcome.shortfall_seconds(),
            invocations: outcome.invocations,
            cache_hits: outcome.cache_hits,
        })
    }
}

#[pymethods]
impl RolloutReport {
    /// Forecast lead time of the final snapshot in hours.
    #[getter]
    fn lead_time_hours(&self) -> u64 {
        self.forward_records.iter().map(|&h| u64::from(h)).sum()
    }

    fn __repr__(&self) -> String {
        format!(
            "RolloutReport(final={}, forward_records={:?}, invocations={}, cache_hits={})",
            self.final_time.to_rfc3339(),
            self.forward_records,
            self.invocations,
            self.cache_hits
        )
    }
}

/// Advance the snapshot stored at `init_timestamp` toward `target_timestamp`.
///
/// # Arguments
/// * `init_timestamp` - Timestamp of the initial snapshot, already in `artifact_dir`
/// * `target_timestamp` - Requested valid time of the forecast
/// * `artifact_dir` - Directory holding `{kind}-{timestamp}.npy` artifacts
/// * `models` - Dict mapping step hours to a callable `dict[str, np.ndarray] -> dict[str, np.ndarray]`
/// * `config` - Rollout configuration (step sizes, field kinds, verbosity)
///
/// # Returns
/// * RolloutReport with final artifact paths and the applied step sizes
///
/// # Raises
/// * ValueError for invalid configuration or model registration
/// * RuntimeError when the rollout fails; completed steps stay cached
#[pyfunction]
#[pyo3(signature = (init_timestamp, target_timestamp, artifact_dir, models, config=None))]
fn iteratively_predict(
    init_timestamp: i64,
    target_timestamp: i64,
    artifact_dir: PathBuf,
    models: HashMap<u32, PyObject>,
    config: Option<RolloutConfig>,
) -> PyResult<RolloutReport> {
    let config = config.unwrap_or_default();

    let mut registry = TransitionRegistry::new();
    for (hours, callable) in models {
        registry
            .register(Box::new(PyTransitionModel::new(hours, callable)))
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
    }

    let store = FileArtifactStore::open(artifact_dir).map_err(store_err)?;
    let engine = RolloutEngine::new(&config, registry, &store)
        .map_err(|e| PyValueError::new_err(e.to_string()))?;

    let initial: Vec<ArtifactKey> = config
        .field_kinds
        .iter()
        .map(|kind| ArtifactKey::new(kind.clone(), init_timestamp))
        .collect();

    match engine.run_from_keys(&initial, target_timestamp) {
        Ok(outcome) => RolloutReport::from_outcome(init_timestamp, &outcome, &store),
        Err(e) => Err(PyRuntimeError::new_err(format!("{}: {}", e.kind.code(), e))),
    }
}

/// Persist an initial condition so a rollout can start from it.
///
/// # Arguments
/// * `artifact_dir` - Directory holding `{kind}-{timestamp}.npy` artifacts
/// * `timestamp` - Valid time of the snapshot
/// * `fields` - Dict mapping field kind to a `float32` or `float64` array
///
/// # Returns
/// * The written paths, in field-kind order
///
/// # Raises
/// * ValueError for an invalid kind or non-finite values; nothing is written
/// * FileExistsError when a field of this snapshot is already stored
#[pyfunction]
fn write_snapshot<'py>(
    artifact_dir: PathBuf,
    timestamp: i64,
    fields: HashMap<String, Bound<'py, PyAny>>,
) -> PyResult<Vec<String>> {
    let mut arrays = BTreeMap::new();
    for (kind, value) in &fields {
        arrays.insert(kind.clone(), models::field_from_py(value)?);
    }
    let store = FileArtifactStore::open(artifact_dir).map_err(store_err)?;
    let keys = store
        .write_snapshot(&StateSnapshot::new(timestamp, arrays))
        .map_err(store_err)?;
    Ok(keys
        .iter()
        .map(|key| store.path_for(key).to_string_lossy().into_owned())
        .collect())
}

/// Load one persisted field as a `float32` array.
///
/// # Raises
/// * FileNotFoundError when the artifact does not exist
/// * RuntimeError when the file is not a readable `.npy` array
#[pyfunction]
fn read_artifact<'py>(
    py: Python<'py>,
    artifact_dir: PathBuf,
    kind: String,
    timestamp: i64,
) -> PyResult<Bound<'py, PyArrayDyn<f32>>> {
    let store = FileArtifactStore::open(artifact_dir).map_err(store_err)?;
    let array = store
        .read(&ArtifactKey::new(kind, timestamp))
        .map_err(store_err)?;
    Ok(models::field_to_py(py, &array))
}

/// Path at which the artifact for `(kind, timestamp)` is persisted.
#[pyfunction]
fn artifact_path(artifact_dir: PathBuf, kind: String, timestamp: i64) -> String {
    artifact_dir
        .join(ArtifactKey::new(kind, timestamp).file_name())
        .to_string_lossy()
        .into_owned()
}

/// Remove artifacts older than `before_timestamp`; returns how many were removed.
#[pyfunction]
fn purge_artifacts(artifact_dir: PathBuf, before_timestamp: i64) -> PyResult<usize> {
    let store = FileArtifactStore::open(artifact_dir).map_err(store_err)?;
    store.purge_before(before_timestamp).map_err(store_err)
}

/// The forecast rollout Python module.
#[pymodule]
fn rust(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Config and report types
    m.add_class::<RolloutConfig>()?;
    m.add_class::<RolloutReport>()?;

    // Rollout and artifact helpers
    m.add_function(wrap_pyfunction!(iteratively_predict, m)?)?;
    m.add_function(wrap_pyfunction!(write_snapshot, m)?)?;
    m.add_function(wrap_pyfunction!(read_artifact, m)?)?;
    m.add_function(wrap_pyfunction!(artifact_path, m)?)?;
    m.add_function(wrap_pyfunction!(purge_artifacts, m)?)?;

    Ok(())
}
