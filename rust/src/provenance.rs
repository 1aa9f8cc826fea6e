//! Provenance log: the ordered step sizes actually applied during a rollout.

use crate::models::{Timestamp, SECONDS_PER_HOUR};

/// One applied step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceEntry {
    pub step_hours: u32,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Served from the artifact store instead of a model invocation.
    pub cached: bool,
}

/// Ordered record of applied steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvenanceLog {
    entries: Vec<ProvenanceEntry>,
}

impl ProvenanceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step starting at `start`; returns the step's end timestamp.
    pub fn record(&mut self, step_hours: u32, start: Timestamp, cached: bool) -> Timestamp {
        let end = start + i64::from(step_hours) * SECONDS_PER_HOUR;
        self.entries.push(ProvenanceEntry {
            step_hours,
            start,
            end,
            cached,
        });
        end
    }

    pub fn entries(&self) -> &[ProvenanceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The bare step sequence ("forward records").
    pub fn step_hours(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.step_hours).collect()
    }

    /// Forecast lead time of the final state, in hours.
    pub fn lead_time_hours(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.step_hours)).sum()
    }

    pub fn cached_steps(&self) -> usize {
        self.entries.iter().filter(|e| e.cached).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_chains_timestamps() {
        let mut log = ProvenanceLog::new();
        let t1 = log.record(24, 0, false);
        let t2 = log.record(6, t1, true);
        let t3 = log.record(3, t2, false);

        assert_eq!(t3, 33 * SECONDS_PER_HOUR);
        assert_eq!(log.step_hours(), vec![24, 6, 3]);
        assert_eq!(log.lead_time_hours(), 33);
        assert_eq!(log.cached_steps(), 1);
        assert_eq!(log.entries()[1].start, 24 * SECONDS_PER_HOUR);
        assert_eq!(log.entries()[1].end, 30 * SECONDS_PER_HOUR);
    }

    #[test]
    fn test_empty_log() {
        let log = ProvenanceLog::new();
        assert!(log.is_empty());
        assert_eq!(log.lead_time_hours(), 0);
        assert!(log.step_hours().is_empty());
    }
}
