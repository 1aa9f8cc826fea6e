//! Configuration types for the rollout engine.

use pyo3::prelude::*;
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::models::KEY_SEPARATOR;

/// Step sizes available out of the box, in hours.
pub const DEFAULT_STEP_HOURS: [u32; 4] = [24, 6, 3, 1];

/// Field kinds persisted for every snapshot by default.
pub const DEFAULT_FIELD_KINDS: [&str; 2] = ["surface", "upper"];

/// Invalid rollout configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one step size must be configured")]
    NoStepSizes,
    #[error("step size must be a positive number of hours")]
    ZeroStep,
    #[error("step size {0}h configured more than once")]
    DuplicateStep(u32),
    #[error("at least one field kind must be configured")]
    NoFieldKinds,
    #[error("field kind {0:?} configured more than once")]
    DuplicateKind(String),
    #[error("field kind {0:?} must be non-empty and free of '-' and path separators")]
    InvalidKind(String),
    #[error("no transition model registered for configured step size {0}h")]
    UnregisteredStep(u32),
}

/// Configuration for an autoregressive rollout.
#[pyclass]
#[derive(Clone, Debug, PartialEq)]
pub struct RolloutConfig {
    /// Step sizes in hours. Order is irrelevant; the planner sorts descending.
    #[pyo3(get, set)]
    pub step_hours: Vec<u32>,
    /// Field kinds that together make up one snapshot.
    #[pyo3(get, set)]
    pub field_kinds: Vec<String>,
    /// Verbosity level: 0=silent, 1=steps, 2=cache, 3=debug.
    #[pyo3(get, set)]
    pub verbosity: u8,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            step_hours: DEFAULT_STEP_HOURS.to_vec(),
            field_kinds: DEFAULT_FIELD_KINDS.iter().map(|k| k.to_string()).collect(),
            verbosity: 0,
        }
    }
}

impl RolloutConfig {
    /// Check step sizes and field kinds for structural problems.
    ///
    /// A step list without 1h is accepted; targets it cannot reach are
    /// rejected by the planner instead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step_hours.is_empty() {
            return Err(ConfigError::NoStepSizes);
        }
        let mut seen_steps = FxHashSet::default();
        for &step in &self.step_hours {
            if step == 0 {
                return Err(ConfigError::ZeroStep);
            }
            if !seen_steps.insert(step) {
                return Err(ConfigError::DuplicateStep(step));
            }
        }

        if self.field_kinds.is_empty() {
            return Err(ConfigError::NoFieldKinds);
        }
        let mut seen_kinds = FxHashSet::default();
        for kind in &self.field_kinds {
            if !is_valid_kind(kind) {
                return Err(ConfigError::InvalidKind(kind.clone()));
            }
            if !seen_kinds.insert(kind.as_str()) {
                return Err(ConfigError::DuplicateKind(kind.clone()));
            }
        }
        Ok(())
    }
}

/// Kinds become file name prefixes, so they must not contain the key
/// separator or anything that escapes the artifact directory.
pub(crate) fn is_valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind != "."
        && kind != ".."
        && !kind.contains(KEY_SEPARATOR)
        && !kind.contains(['/', '\\'])
}

#[pymethods]
impl RolloutConfig {
    #[new]
    #[pyo3(signature = (step_hours=None, field_kinds=None, verbosity=None))]
    fn new(
        step_hours: Option<Vec<u32>>,
        field_kinds: Option<Vec<String>>,
        verbosity: Option<u8>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            step_hours: step_hours.unwrap_or(defaults.step_hours),
            field_kinds: field_kinds.unwrap_or(defaults.field_kinds),
            verbosity: verbosity.unwrap_or(defaults.verbosity),
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "RolloutConfig(step_hours={:?}, field_kinds={:?}, verbosity={})",
            self.step_hours, self.field_kinds, self.verbosity
        )
    }
}
