//! Rollout engine: drives transition models from an initial snapshot to a target time.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Planning -> CachedHit ----------------------------> Advancing -> (Planning | next cache check)
//!          -> CachedMissInvoking -> Persisting ---->
//! Planning -> Done
//! any      -> Failed (returned as RolloutError)
//! ```
//!
//! Every step's output is persisted before the engine advances, and a step
//! whose output is already fully materialized in the store is never
//! recomputed. Re-running an interrupted rollout therefore resumes from the
//! last persisted snapshot.

use std::time::Instant;
use thiserror::Error;

use crate::config::{ConfigError, RolloutConfig};
use crate::logging::iso;
use crate::models::{all_finite, ArtifactKey, SnapshotRef, StateSnapshot, Timestamp, SECONDS_PER_HOUR};
use crate::planner::{remaining_hours, PlanError, StepChoice, StepPlanner};
use crate::provenance::ProvenanceLog;
use crate::registry::{ModelError, TransitionRegistry};
use crate::store::{ArtifactStore, Presence, StoreError};
use crate::{log_cache, log_debug, log_steps, log_warn};

/// Why a rollout stopped.
#[derive(Error, Debug)]
pub enum RolloutErrorKind {
    #[error("unreachable target: {0}")]
    UnreachableTarget(#[from] PlanError),
    #[error("transition model for {step_hours}h failed: {source}")]
    ModelInvocation {
        step_hours: u32,
        #[source]
        source: ModelError,
    },
    #[error("snapshot at {timestamp} is incomplete: present {present:?}, missing {missing:?}")]
    StoreInconsistency {
        timestamp: Timestamp,
        present: Vec<String>,
        missing: Vec<String>,
    },
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),
    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),
}

impl RolloutErrorKind {
    /// Stable name of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnreachableTarget(_) => "UnreachableTarget",
            Self::ModelInvocation { .. } => "ModelInvocationError",
            Self::StoreInconsistency { .. } => "StoreInconsistency",
            Self::PreconditionViolation(_) => "PreconditionViolation",
            Self::Store(_) => "StoreError",
        }
    }
}

/// A failed rollout, with enough context to resume it later.
#[derive(Error, Debug)]
#[error("rollout stopped at {last_good_timestamp}: {kind}")]
pub struct RolloutError {
    pub kind: RolloutErrorKind,
    /// Timestamp of the last snapshot fully materialized by this run.
    pub last_good_timestamp: Timestamp,
    /// Steps completed before the failure.
    pub completed: ProvenanceLog,
}

/// Result of a completed rollout.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutOutcome {
    pub final_snapshot: SnapshotRef,
    pub provenance: ProvenanceLog,
    pub target: Timestamp,
    pub invocations: usize,
    pub cache_hits: usize,
}

impl RolloutOutcome {
    /// Seconds between the final snapshot and a later target.
    ///
    /// Non-zero when the horizon was not a whole number of hours; the
    /// remainder is reported rather than rounded away.
    pub fn shortfall_seconds(&self) -> i64 {
        (self.target - self.final_snapshot.timestamp).max(0)
    }

    pub fn reached_target(&self) -> bool {
        self.shortfall_seconds() == 0
    }
}

/// Engine states. `Failed` is represented by the `Err` arm of a transition.
#[derive(Debug)]
enum Phase {
    Planning,
    CachedHit { step_hours: u32 },
    CachedMissInvoking { step_hours: u32 },
    Persisting { step_hours: u32, output: StateSnapshot },
    Advancing { step_hours: u32, cached: bool },
    Done,
}

/// Mutable progress of one rollout.
struct Cursor {
    current: Timestamp,
    /// In-memory copy of the snapshot at `current`, when this run produced it.
    state: Option<StateSnapshot>,
    /// Applications left in the current run of equal steps.
    pending: u64,
    log: ProvenanceLog,
    invocations: usize,
    cache_hits: usize,
}

impl Cursor {
    fn into_error(self, kind: RolloutErrorKind) -> RolloutError {
        RolloutError {
            kind,
            last_good_timestamp: self.current,
            completed: self.log,
        }
    }
}

/// Autoregressive rollout driver over a transition registry and artifact store.
pub struct RolloutEngine<S: ArtifactStore> {
    registry: TransitionRegistry,
    store: S,
    planner: StepPlanner,
    kinds: Vec<String>,
    verbosity: u8,
}

impl<S: ArtifactStore> RolloutEngine<S> {
    /// Build an engine; every configured step size needs a registered model.
    pub fn new(
        config: &RolloutConfig,
        registry: TransitionRegistry,
        store: S,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Some(&missing) = config.step_hours.iter().find(|&&s| !registry.contains(s)) {
            return Err(ConfigError::UnregisteredStep(missing));
        }
        Ok(Self {
            registry,
            store,
            planner: StepPlanner::new(&config.step_hours),
            kinds: config.field_kinds.clone(),
            verbosity: config.verbosity,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn planner(&self) -> &StepPlanner {
        &self.planner
    }

    /// Run from per-kind initial keys, which must agree on timestamp.
    pub fn run_from_keys(
        &self,
        initial: &[ArtifactKey],
        target: Timestamp,
    ) -> Result<RolloutOutcome, RolloutError> {
        match SnapshotRef::from_keys(initial) {
            Ok(reference) => self.run(&reference, target),
            Err(e) => Err(RolloutError {
                kind: RolloutErrorKind::PreconditionViolation(e.to_string()),
                last_good_timestamp: initial.first().map(|k| k.timestamp).unwrap_or_default(),
                completed: ProvenanceLog::new(),
            }),
        }
    }

    /// Advance the snapshot `initial` until no whole step fits before `target`.
    pub fn run(
        &self,
        initial: &SnapshotRef,
        target: Timestamp,
    ) -> Result<RolloutOutcome, RolloutError> {
        let mut cursor = Cursor {
            current: initial.timestamp,
            state: None,
            pending: 0,
            log: ProvenanceLog::new(),
            invocations: 0,
            cache_hits: 0,
        };

        if let Err(kind) = self.preflight(initial, target) {
            return Err(cursor.into_error(kind));
        }

        log_steps!(
            self.verbosity,
            "Rollout from {} to {}",
            iso(initial.timestamp),
            iso(target)
        );

        let mut phase = Phase::Planning;
        loop {
            if let Phase::Done = phase {
                break;
            }
            match self.transition(phase, &mut cursor, target) {
                Ok(next) => phase = next,
                Err(kind) => return Err(cursor.into_error(kind)),
            }
        }

        let outcome = RolloutOutcome {
            final_snapshot: SnapshotRef::new(cursor.current, self.kinds.clone()),
            provenance: cursor.log,
            target,
            invocations: cursor.invocations,
            cache_hits: cursor.cache_hits,
        };
        if !outcome.reached_target() {
            log_steps!(
                self.verbosity,
                "Stopped {}s short of {}: remainder is below one hour",
                outcome.shortfall_seconds(),
                iso(target)
            );
        }
        log_steps!(
            self.verbosity,
            "All done. {} steps, {} invoked, {} from cache.",
            outcome.provenance.len(),
            outcome.invocations,
            outcome.cache_hits
        );
        Ok(outcome)
    }

    /// Checks made before any step runs.
    fn preflight(&self, initial: &SnapshotRef, target: Timestamp) -> Result<(), RolloutErrorKind> {
        let mut given = initial.kinds.clone();
        let mut expected = self.kinds.clone();
        given.sort();
        expected.sort();
        if given != expected {
            return Err(RolloutErrorKind::PreconditionViolation(format!(
                "initial snapshot has kinds {:?}, expected {:?}",
                initial.kinds, self.kinds
            )));
        }

        match self.store.presence(&self.kinds, initial.timestamp)? {
            Presence::All => {}
            Presence::None => {
                return Err(RolloutErrorKind::PreconditionViolation(format!(
                    "initial snapshot at {} is not in the artifact store",
                    initial.timestamp
                )))
            }
            Presence::Partial { present, missing } => {
                return Err(RolloutErrorKind::StoreInconsistency {
                    timestamp: initial.timestamp,
                    present,
                    missing,
                })
            }
        }

        let remaining = self.remaining(initial.timestamp, target)?;
        for run in self.planner.plan(remaining)? {
            log_debug!(
                self.verbosity,
                "Planned {}h x{}",
                run.step_hours,
                run.repeat
            );
        }
        Ok(())
    }

    fn remaining(&self, current: Timestamp, target: Timestamp) -> Result<i64, RolloutErrorKind> {
        remaining_hours(current, target).ok_or_else(|| {
            RolloutErrorKind::PreconditionViolation(format!(
                "horizon from {} to {} overflows a 64-bit timestamp",
                current, target
            ))
        })
    }

    fn transition(
        &self,
        phase: Phase,
        cursor: &mut Cursor,
        target: Timestamp,
    ) -> Result<Phase, RolloutErrorKind> {
        match phase {
            Phase::Planning => {
                let remaining = self.remaining(cursor.current, target)?;
                match self.planner.next_step(remaining) {
                    StepChoice::Done => Ok(Phase::Done),
                    StepChoice::Unreachable {
                        remaining_hours,
                        smallest_step,
                    } => Err(PlanError {
                        remaining_hours,
                        smallest_step,
                    }
                    .into()),
                    StepChoice::Advance { step_hours, repeat } => {
                        log_debug!(
                            self.verbosity,
                            "{}h remaining: applying {}h x{}",
                            remaining,
                            step_hours,
                            repeat
                        );
                        cursor.pending = repeat;
                        self.check_cache(cursor, step_hours)
                    }
                }
            }
            Phase::CachedHit { step_hours } => {
                cursor.cache_hits += 1;
                // Loaded lazily if a later step needs it as input
                cursor.state = None;
                Ok(Phase::Advancing {
                    step_hours,
                    cached: true,
                })
            }
            Phase::CachedMissInvoking { step_hours } => {
                let output = self.invoke(cursor, step_hours)?;
                Ok(Phase::Persisting { step_hours, output })
            }
            Phase::Persisting { step_hours, output } => {
                let raced = self.persist(&output)?;
                cursor.state = if raced { None } else { Some(output) };
                Ok(Phase::Advancing {
                    step_hours,
                    cached: false,
                })
            }
            Phase::Advancing { step_hours, cached } => {
                cursor.current = cursor.log.record(step_hours, cursor.current, cached);
                cursor.pending = cursor.pending.saturating_sub(1);
                if cursor.pending > 0 {
                    self.check_cache(cursor, step_hours)
                } else {
                    Ok(Phase::Planning)
                }
            }
            Phase::Done => Ok(Phase::Done),
        }
    }

    /// Decide between a cache hit and a model invocation for the next step.
    fn check_cache(&self, cursor: &Cursor, step_hours: u32) -> Result<Phase, RolloutErrorKind> {
        let next = cursor.current + i64::from(step_hours) * SECONDS_PER_HOUR;
        match self.store.presence(&self.kinds, next)? {
            Presence::All => {
                log_cache!(self.verbosity, "Cache hit for {} ({}h)", iso(next), step_hours);
                Ok(Phase::CachedHit { step_hours })
            }
            Presence::None => {
                log_cache!(self.verbosity, "Cache miss for {} ({}h)", iso(next), step_hours);
                Ok(Phase::CachedMissInvoking { step_hours })
            }
            Presence::Partial { present, missing } => Err(RolloutErrorKind::StoreInconsistency {
                timestamp: next,
                present,
                missing,
            }),
        }
    }

    fn invoke(&self, cursor: &mut Cursor, step_hours: u32) -> Result<StateSnapshot, RolloutErrorKind> {
        let model = self.registry.get(step_hours).ok_or_else(|| {
            RolloutErrorKind::PreconditionViolation(format!(
                "no transition model registered for {}h",
                step_hours
            ))
        })?;

        let input = match cursor.state.take() {
            Some(state) if state.timestamp == cursor.current => state,
            _ => {
                log_cache!(
                    self.verbosity,
                    "Loading snapshot {} from store",
                    iso(cursor.current)
                );
                self.store.read_snapshot(&self.kinds, cursor.current)?
            }
        };

        let end = cursor.current + i64::from(step_hours) * SECONDS_PER_HOUR;
        log_steps!(
            self.verbosity,
            "Predicting from {} to {}",
            iso(cursor.current),
            iso(end)
        );
        let started = Instant::now();
        cursor.invocations += 1;
        let output = model
            .advance(&input)
            .and_then(|output| self.check_output(&input, output, end))
            .map_err(|source| RolloutErrorKind::ModelInvocation { step_hours, source })?;
        log_steps!(
            self.verbosity,
            "Done. Time elapsed: {:.2}s",
            started.elapsed().as_secs_f64()
        );
        Ok(output)
    }

    /// Reject outputs that would corrupt the chain: wrong time, wrong fields,
    /// changed shapes or non-finite values.
    fn check_output(
        &self,
        input: &StateSnapshot,
        output: StateSnapshot,
        expected_timestamp: Timestamp,
    ) -> Result<StateSnapshot, ModelError> {
        if output.timestamp != expected_timestamp {
            return Err(ModelError::WrongTimestamp {
                expected: expected_timestamp,
                actual: output.timestamp,
            });
        }
        if let Some(extra) = output.kinds().find(|k| !self.kinds.iter().any(|c| c.as_str() == *k)) {
            return Err(ModelError::UnexpectedField(extra.to_string()));
        }
        for kind in &self.kinds {
            let produced = output
                .field(kind)
                .ok_or_else(|| ModelError::MissingField(kind.clone()))?;
            if let Some(source) = input.field(kind) {
                if source.shape() != produced.shape() {
                    return Err(ModelError::ShapeChanged {
                        kind: kind.clone(),
                        input: source.shape().to_vec(),
                        output: produced.shape().to_vec(),
                    });
                }
            }
            if !all_finite(produced) {
                return Err(ModelError::NonFinite(kind.clone()));
            }
        }
        Ok(output)
    }

    /// Write every kind of `output`. Returns true when another writer
    /// published some of the keys first.
    fn persist(&self, output: &StateSnapshot) -> Result<bool, RolloutErrorKind> {
        let mut raced = false;
        for kind in &self.kinds {
            let Some(array) = output.field(kind) else {
                continue;
            };
            let key = ArtifactKey::new(kind.clone(), output.timestamp);
            match self.store.write(&key, array) {
                Ok(()) => {}
                Err(StoreError::AlreadyExists(key)) => {
                    log_warn!("{} was written by another rollout; keeping the stored artifact", key);
                    raced = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(raced)
    }
}
