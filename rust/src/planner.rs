//! Step planner: greedy decomposition of a forecast horizon into step sizes.
//!
//! At each outer iteration the planner looks at the whole remaining horizon,
//! picks the largest step that fits and applies it as many times as it fits.
//! The caller then re-plans from scratch with every step size back in play.

use thiserror::Error;

use crate::models::{Timestamp, SECONDS_PER_HOUR};

/// The remaining horizon cannot be covered by the configured step sizes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "{remaining_hours}h remain but the smallest step is {smallest_step}h; \
     target cannot be reached exactly"
)]
pub struct PlanError {
    pub remaining_hours: i64,
    pub smallest_step: u32,
}

/// Next move decided by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepChoice {
    /// Apply `step_hours` consecutively `repeat` times.
    Advance { step_hours: u32, repeat: u64 },
    /// Nothing left to do.
    Done,
    /// Hours remain but no configured step fits into them.
    Unreachable { remaining_hours: i64, smallest_step: u32 },
}

/// A run of `repeat` consecutive applications of one step size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRun {
    pub step_hours: u32,
    pub repeat: u64,
}

/// Whole hours between `current` and `target`, rounded toward negative infinity.
///
/// `None` when the distance does not fit in an `i64`.
pub fn remaining_hours(current: Timestamp, target: Timestamp) -> Option<i64> {
    target
        .checked_sub(current)
        .map(|delta| delta.div_euclid(SECONDS_PER_HOUR))
}

/// Greedy descending step planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlanner {
    /// Distinct positive step sizes, largest first.
    steps: Vec<u32>,
}

impl StepPlanner {
    /// Build a planner; zero entries and duplicates are dropped and the
    /// remaining sizes sorted descending.
    pub fn new(step_hours: &[u32]) -> Self {
        let mut steps: Vec<u32> = step_hours.iter().copied().filter(|&s| s > 0).collect();
        steps.sort_unstable_by(|a, b| b.cmp(a));
        steps.dedup();
        Self { steps }
    }

    pub fn steps(&self) -> &[u32] {
        &self.steps
    }

    pub fn smallest_step(&self) -> Option<u32> {
        self.steps.last().copied()
    }

    /// Largest step size not exceeding `remaining_hours`.
    pub fn largest_eligible(&self, remaining_hours: i64) -> Option<u32> {
        self.steps
            .iter()
            .copied()
            .find(|&s| i64::from(s) <= remaining_hours)
    }

    /// Decide the next run of steps for `remaining_hours`.
    pub fn next_step(&self, remaining_hours: i64) -> StepChoice {
        if remaining_hours <= 0 {
            return StepChoice::Done;
        }
        match self.largest_eligible(remaining_hours) {
            Some(step_hours) => StepChoice::Advance {
                step_hours,
                repeat: (remaining_hours / i64::from(step_hours)) as u64,
            },
            None => StepChoice::Unreachable {
                remaining_hours,
                smallest_step: self.smallest_step().unwrap_or(0),
            },
        }
    }

    /// Runs of steps covering `remaining_hours`, largest step first.
    ///
    /// Each step size appears at most once, so the plan stays small however
    /// long the horizon is.
    pub fn plan(&self, remaining_hours: i64) -> Result<Vec<StepRun>, PlanError> {
        let mut planned = Vec::new();
        let mut remaining = remaining_hours;
        loop {
            match self.next_step(remaining) {
                StepChoice::Done => return Ok(planned),
                StepChoice::Unreachable {
                    remaining_hours,
                    smallest_step,
                } => {
                    return Err(PlanError {
                        remaining_hours,
                        smallest_step,
                    })
                }
                StepChoice::Advance { step_hours, repeat } => {
                    planned.push(StepRun { step_hours, repeat });
                    remaining -= i64::from(step_hours) * repeat as i64;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: i64 = SECONDS_PER_HOUR;

    fn default_planner() -> StepPlanner {
        StepPlanner::new(&[24, 6, 3, 1])
    }

    /// Step sizes in application order for the horizon `current..target`.
    fn steps(planner: &StepPlanner, current: Timestamp, target: Timestamp) -> Result<Vec<u32>, PlanError> {
        let remaining = remaining_hours(current, target).unwrap();
        Ok(planner
            .plan(remaining)?
            .into_iter()
            .flat_map(|run| std::iter::repeat(run.step_hours).take(run.repeat as usize))
            .collect())
    }

    #[test]
    fn test_steps_sorted_descending() {
        let planner = StepPlanner::new(&[1, 6, 0, 24, 3, 6]);
        assert_eq!(planner.steps(), &[24, 6, 3, 1]);
        assert_eq!(planner.smallest_step(), Some(1));
    }

    #[test]
    fn test_remaining_hours_floors() {
        assert_eq!(remaining_hours(0, 3 * H), Some(3));
        assert_eq!(remaining_hours(0, 3 * H + 3599), Some(3));
        assert_eq!(remaining_hours(0, 59), Some(0));
        assert_eq!(remaining_hours(0, -1), Some(-1));
        assert_eq!(remaining_hours(H, 0), Some(-1));
    }

    #[test]
    fn test_remaining_hours_overflow() {
        assert_eq!(remaining_hours(-H, i64::MAX), None);
        assert_eq!(remaining_hours(1, i64::MIN), None);
        assert_eq!(remaining_hours(0, i64::MAX), Some(i64::MAX / H));
    }

    #[test]
    fn test_next_step_choices() {
        let planner = default_planner();
        assert_eq!(
            planner.next_step(50),
            StepChoice::Advance {
                step_hours: 24,
                repeat: 2
            }
        );
        assert_eq!(
            planner.next_step(5),
            StepChoice::Advance {
                step_hours: 3,
                repeat: 1
            }
        );
        assert_eq!(planner.next_step(0), StepChoice::Done);
        assert_eq!(planner.next_step(-4), StepChoice::Done);
    }

    #[test]
    fn test_scenarios() {
        let planner = default_planner();
        assert_eq!(steps(&planner, 0, 33 * H).unwrap(), vec![24, 6, 3]);
        assert_eq!(steps(&planner, 0, H).unwrap(), vec![1]);
        assert_eq!(steps(&planner, 0, -H).unwrap(), Vec::<u32>::new());
        assert_eq!(steps(&planner, 0, 0).unwrap(), Vec::<u32>::new());
        assert_eq!(steps(&planner, 0, 52 * H).unwrap(), vec![24, 24, 3, 1]);
    }

    #[test]
    fn test_plan_groups_runs() {
        let planner = default_planner();
        assert_eq!(
            planner.plan(52).unwrap(),
            vec![
                StepRun { step_hours: 24, repeat: 2 },
                StepRun { step_hours: 3, repeat: 1 },
                StepRun { step_hours: 1, repeat: 1 },
            ]
        );
    }

    #[test]
    fn test_decomposition_sums_to_horizon() {
        let planner = default_planner();
        for h in 0..=24 * 7 {
            let plan = steps(&planner, 0, h * H).unwrap();
            assert_eq!(plan.iter().map(|&s| i64::from(s)).sum::<i64>(), h, "h={}", h);
            assert!(plan.windows(2).all(|w| w[0] >= w[1]), "h={}", h);
        }
    }

    #[test]
    fn test_extreme_horizon_plans_without_expanding() {
        let planner = default_planner();
        let hours = i64::MAX / H;
        let plan = planner.plan(hours).unwrap();
        assert!(plan.len() <= planner.steps().len());
        let total: i128 = plan
            .iter()
            .map(|run| i128::from(run.step_hours) * i128::from(run.repeat))
            .sum();
        assert_eq!(total, i128::from(hours));
    }

    #[test]
    fn test_sub_hour_remainder_is_dropped() {
        let planner = default_planner();
        assert_eq!(steps(&planner, 0, 2 * H + 1800).unwrap(), vec![1, 1]);
        assert_eq!(steps(&planner, 0, 1800).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_unreachable_without_unit_step() {
        let planner = StepPlanner::new(&[24, 6]);
        assert_eq!(steps(&planner, 0, 30 * H).unwrap(), vec![24, 6]);
        assert_eq!(
            steps(&planner, 0, 31 * H),
            Err(PlanError {
                remaining_hours: 1,
                smallest_step: 6
            })
        );
        assert_eq!(
            planner.next_step(5),
            StepChoice::Unreachable {
                remaining_hours: 5,
                smallest_step: 6
            }
        );
    }
}
