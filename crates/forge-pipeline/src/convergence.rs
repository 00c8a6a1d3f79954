//! Fixed-count iteration control for EM phases and mixup schedules.
//!
//! ```text
//! schedule 2_4_8, 6 iterations per level
//!
//! level:   m2                 m4                 m8
//! iter:    1* 2 3 4 5 6       1* 2 3 4 5 6       1* 2 3 4 5 6   → Stop
//!          * mixture split precedes the iteration
//! ```
//!
//! There is no likelihood-based early stop: every level runs exactly
//! `iterations_per_level` iterations, and the tracker moves to the next level
//! only once all of them have succeeded.

use forge_types::MixupSchedule;

/// One finished (or failed) iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationRecord {
    pub mixtures: u32,
    pub iteration: u32,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue {
        target_mixtures: u32,
        /// 1-based within the current level.
        iteration: u32,
        /// Split mixtures up to `target_mixtures` before this iteration.
        mixup: bool,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    schedule: MixupSchedule,
    iterations_per_level: u32,
}

impl ConvergenceTracker {
    pub fn new(schedule: MixupSchedule, iterations_per_level: u32) -> Self {
        Self {
            schedule,
            iterations_per_level,
        }
    }

    pub fn total_iterations(&self) -> u32 {
        self.schedule.len() as u32 * self.iterations_per_level
    }

    /// Decide what to run after `history`.
    ///
    /// Only succeeded records count; a trailing failure is re-issued.
    pub fn next_iteration(&self, history: &[IterationRecord]) -> Decision {
        if self.iterations_per_level == 0 {
            return Decision::Stop;
        }
        let done = history.iter().filter(|r| r.succeeded).count() as u32;
        let level = (done / self.iterations_per_level) as usize;
        let Some(&target_mixtures) = self.schedule.levels().get(level) else {
            return Decision::Stop;
        };
        let iteration = done % self.iterations_per_level + 1;
        Decision::Continue {
            target_mixtures,
            iteration,
            mixup: self.schedule.splits() && iteration == 1,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(tracker: &ConvergenceTracker) -> Vec<Decision> {
        let mut history = Vec::new();
        let mut decisions = Vec::new();
        loop {
            let d = tracker.next_iteration(&history);
            if d == Decision::Stop {
                break;
            }
            if let Decision::Continue { target_mixtures, iteration, .. } = d {
                history.push(IterationRecord {
                    mixtures: target_mixtures,
                    iteration,
                    succeeded: true,
                });
            }
            decisions.push(d);
            assert!(decisions.len() < 1000, "tracker never stopped");
        }
        decisions
    }

    #[test]
    fn schedule_2_4_8_runs_exactly_18_iterations() {
        let tracker = ConvergenceTracker::new("2_4_8".parse().unwrap(), 6);
        let decisions = drive(&tracker);
        assert_eq!(decisions.len(), 18);
        assert_eq!(tracker.total_iterations(), 18);

        let per_level = |m: u32| {
            decisions
                .iter()
                .filter(|d| matches!(d, Decision::Continue { target_mixtures, .. } if *target_mixtures == m))
                .count()
        };
        assert_eq!(per_level(2), 6);
        assert_eq!(per_level(4), 6);
        assert_eq!(per_level(8), 6);

        let mixups: Vec<u32> = decisions
            .iter()
            .filter_map(|d| match d {
                Decision::Continue { target_mixtures, mixup: true, .. } => Some(*target_mixtures),
                _ => None,
            })
            .collect();
        assert_eq!(mixups, vec![2, 4, 8]);
    }

    #[test]
    fn single_value_schedule_never_splits() {
        let tracker = ConvergenceTracker::new("8".parse().unwrap(), 4);
        let decisions = drive(&tracker);
        assert_eq!(decisions.len(), 4);
        assert!(decisions
            .iter()
            .all(|d| matches!(d, Decision::Continue { mixup: false, target_mixtures: 8, .. })));
    }

    #[test]
    fn failed_iteration_is_reissued_not_skipped() {
        let tracker = ConvergenceTracker::new("2_4".parse().unwrap(), 2);
        let history = vec![
            IterationRecord { mixtures: 2, iteration: 1, succeeded: true },
            IterationRecord { mixtures: 2, iteration: 2, succeeded: false },
        ];
        assert_eq!(
            tracker.next_iteration(&history),
            Decision::Continue { target_mixtures: 2, iteration: 2, mixup: false }
        );
    }

    #[test]
    fn advances_level_only_after_all_iterations() {
        let tracker = ConvergenceTracker::new("2_4".parse().unwrap(), 2);
        let one = vec![IterationRecord { mixtures: 2, iteration: 1, succeeded: true }];
        assert!(matches!(
            tracker.next_iteration(&one),
            Decision::Continue { target_mixtures: 2, iteration: 2, .. }
        ));
        let two = vec![
            IterationRecord { mixtures: 2, iteration: 1, succeeded: true },
            IterationRecord { mixtures: 2, iteration: 2, succeeded: true },
        ];
        assert_eq!(
            tracker.next_iteration(&two),
            Decision::Continue { target_mixtures: 4, iteration: 1, mixup: true }
        );
    }

    #[test]
    fn zero_iterations_stops_immediately() {
        assert_eq!(ConvergenceTracker::new(MixupSchedule::single(1), 0).next_iteration(&[]), Decision::Stop);
    }
}
