//! Transition model registry: step size -> operator advancing state by that many hours.

use pyo3::prelude::*;
use pyo3::types::PyDict;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::models::{field_from_py, field_to_py, FieldArray, StateSnapshot, SECONDS_PER_HOUR};

/// Failure of a single model invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("model failed: {0}")]
    Failed(String),
    #[error("model output is missing field {0:?}")]
    MissingField(String),
    #[error("model output has unexpected field {0:?}")]
    UnexpectedField(String),
    #[error("field {kind:?} changed shape from {input:?} to {output:?}")]
    ShapeChanged {
        kind: String,
        input: Vec<usize>,
        output: Vec<usize>,
    },
    #[error("field {0:?} contains non-finite values")]
    NonFinite(String),
    #[error("model output stamped {actual}, expected {expected}")]
    WrongTimestamp { expected: i64, actual: i64 },
}

/// Registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("step size must be a positive number of hours")]
    ZeroStep,
    #[error("a transition model for {0}h is already registered")]
    Duplicate(u32),
    #[error("model reports {reported}h but was registered for {registered}h")]
    StepMismatch { registered: u32, reported: u32 },
}

/// Deterministic operator mapping a snapshot at `t` to one at `t + step_hours`.
pub trait TransitionModel {
    fn step_hours(&self) -> u32;

    fn advance(&self, state: &StateSnapshot) -> Result<StateSnapshot, ModelError>;
}

/// Transition model built from a closure over the input fields.
///
/// The closure only produces field arrays; the output timestamp is derived
/// from the step size.
pub struct FnTransitionModel<F> {
    step_hours: u32,
    func: F,
}

impl<F> FnTransitionModel<F>
where
    F: Fn(&BTreeMap<String, FieldArray>) -> Result<BTreeMap<String, FieldArray>, ModelError>,
{
    pub fn new(step_hours: u32, func: F) -> Self {
        Self { step_hours, func }
    }
}

impl<F> TransitionModel for FnTransitionModel<F>
where
    F: Fn(&BTreeMap<String, FieldArray>) -> Result<BTreeMap<String, FieldArray>, ModelError>,
{
    fn step_hours(&self) -> u32 {
        self.step_hours
    }

    fn advance(&self, state: &StateSnapshot) -> Result<StateSnapshot, ModelError> {
        let fields = (self.func)(&state.fields)?;
        Ok(StateSnapshot::new(
            state.timestamp + i64::from(self.step_hours) * SECONDS_PER_HOUR,
            fields,
        ))
    }
}

/// Python callable `dict[str, np.ndarray] -> dict[str, np.ndarray]`.
///
/// Typically wraps an inference session for one step size; the execution
/// backend is whatever the callable chose. Inputs are handed over as
/// `float32` arrays; `float64` outputs are narrowed.
pub struct PyTransitionModel {
    step_hours: u32,
    callable: PyObject,
}

impl PyTransitionModel {
    pub fn new(step_hours: u32, callable: PyObject) -> Self {
        Self {
            step_hours,
            callable,
        }
    }

    fn call(&self, py: Python<'_>, state: &StateSnapshot) -> PyResult<BTreeMap<String, FieldArray>> {
        let inputs = PyDict::new_bound(py);
        for (kind, array) in &state.fields {
            inputs.set_item(kind, field_to_py(py, array))?;
        }
        let output = self.callable.call1(py, (inputs,))?;
        let output = output.bind(py).downcast::<PyDict>()?;

        let mut fields = BTreeMap::new();
        for (kind, array) in output.iter() {
            fields.insert(kind.extract::<String>()?, field_from_py(&array)?);
        }
        Ok(fields)
    }
}

impl TransitionModel for PyTransitionModel {
    fn step_hours(&self) -> u32 {
        self.step_hours
    }

    fn advance(&self, state: &StateSnapshot) -> Result<StateSnapshot, ModelError> {
        let fields = Python::with_gil(|py| self.call(py, state))
            .map_err(|e| ModelError::Failed(e.to_string()))?;
        Ok(StateSnapshot::new(
            state.timestamp + i64::from(self.step_hours) * SECONDS_PER_HOUR,
            fields,
        ))
    }
}

/// Available transition models keyed by step size.
#[derive(Default)]
pub struct TransitionRegistry {
    models: FxHashMap<u32, Box<dyn TransitionModel>>,
}

impl TransitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the model for its own step size.
    pub fn register(&mut self, model: Box<dyn TransitionModel>) -> Result<(), RegistryError> {
        let hours = model.step_hours();
        self.register_as(hours, model)
    }

    /// Register a model under an explicit step size, which must match the model's.
    pub fn register_as(
        &mut self,
        hours: u32,
        model: Box<dyn TransitionModel>,
    ) -> Result<(), RegistryError> {
        if hours == 0 {
            return Err(RegistryError::ZeroStep);
        }
        if model.step_hours() != hours {
            return Err(RegistryError::StepMismatch {
                registered: hours,
                reported: model.step_hours(),
            });
        }
        if self.models.contains_key(&hours) {
            return Err(RegistryError::Duplicate(hours));
        }
        self.models.insert(hours, model);
        Ok(())
    }

    pub fn get(&self, hours: u32) -> Option<&dyn TransitionModel> {
        self.models.get(&hours).map(|m| m.as_ref())
    }

    pub fn contains(&self, hours: u32) -> bool {
        self.models.contains_key(&hours)
    }

    /// Registered step sizes, largest first.
    pub fn step_hours(&self) -> Vec<u32> {
        let mut hours: Vec<u32> = self.models.keys().copied().collect();
        hours.sort_unstable_by(|a, b| b.cmp(a));
        hours
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(hours: u32) -> Box<dyn TransitionModel> {
        Box::new(FnTransitionModel::new(hours, |fields: &BTreeMap<String, FieldArray>| {
            Ok(fields.clone())
        }))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TransitionRegistry::new();
        for hours in [1, 24, 3, 6] {
            registry.register(identity(hours)).unwrap();
        }
        assert_eq!(registry.step_hours(), vec![24, 6, 3, 1]);
        assert!(registry.contains(6));
        assert!(registry.get(12).is_none());
        assert_eq!(registry.get(3).unwrap().step_hours(), 3);
    }

    #[test]
    fn test_register_rejects_bad_entries() {
        let mut registry = TransitionRegistry::new();
        registry.register(identity(6)).unwrap();
        assert_eq!(
            registry.register(identity(6)),
            Err(RegistryError::Duplicate(6))
        );
        assert_eq!(registry.register(identity(0)), Err(RegistryError::ZeroStep));
        assert_eq!(
            registry.register_as(3, identity(1)),
            Err(RegistryError::StepMismatch {
                registered: 3,
                reported: 1
            })
        );
    }

    #[test]
    fn test_fn_model_advances_timestamp() {
        let model = identity(6);
        let mut fields = BTreeMap::new();
        fields.insert("surface".to_string(), FieldArray::from_elem(vec![2], 1.0));
        let out = model.advance(&StateSnapshot::new(1000, fields.clone())).unwrap();
        assert_eq!(out.timestamp, 1000 + 6 * 3600);
        assert_eq!(out.fields, fields);
    }

    fn python_model(hours: u32, body: &str) -> Option<PyTransitionModel> {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            // The conversions need NumPy on the interpreter's path.
            py.import_bound("numpy").ok()?;
            let code = format!("import numpy as np\n\ndef step(fields):\n    {}\n", body);
            let module = PyModule::from_code_bound(py, &code, "step_model.py", "step_model").ok()?;
            let callable = module.getattr("step").ok()?.unbind();
            Some(PyTransitionModel::new(hours, callable))
        })
    }

    #[test]
    fn test_python_model_round_trips_numpy_arrays() {
        let Some(model) = python_model(
            6,
            "return {k: v.astype(np.float64) + 1.0 for k, v in fields.items()}",
        ) else {
            return;
        };
        let mut fields = BTreeMap::new();
        fields.insert(
            "surface".to_string(),
            FieldArray::from_shape_vec(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap(),
        );
        fields.insert("upper".to_string(), FieldArray::from_elem(vec![2, 2, 2], 10.0));

        let out = model.advance(&StateSnapshot::new(0, fields)).unwrap();
        assert_eq!(out.timestamp, 6 * 3600);
        assert_eq!(
            out.fields["surface"],
            FieldArray::from_shape_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()
        );
        assert_eq!(out.fields["upper"], FieldArray::from_elem(vec![2, 2, 2], 11.0));
    }

    #[test]
    fn test_python_model_errors_become_failures() {
        let Some(model) = python_model(1, "raise RuntimeError('session crashed')") else {
            return;
        };
        let mut fields = BTreeMap::new();
        fields.insert("surface".to_string(), FieldArray::from_elem(vec![1], 0.0));
        let err = model.advance(&StateSnapshot::new(0, fields)).unwrap_err();
        assert!(matches!(&err, ModelError::Failed(msg) if msg.contains("session crashed")));

        let Some(model) = python_model(1, "return [1.0]") else {
            return;
        };
        let mut fields = BTreeMap::new();
        fields.insert("surface".to_string(), FieldArray::from_elem(vec![1], 0.0));
        assert!(matches!(
            model.advance(&StateSnapshot::new(0, fields)),
            Err(ModelError::Failed(_))
        ));
    }
}
