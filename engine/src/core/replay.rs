//! Targeted replay: `from` resets over a checkpoint.
//!
//! Every entry at or past the `from` state moves back to the state just before
//! it, and parents are demoted so the scheduler revisits them.

use crate::core::checkpoint::Checkpoint;
use crate::core::states::{ExperimentState, Lifecycle, Recorded, RunState, SubtestState, TierState};
use crate::core::tier::TierId;
use crate::core::types::RunOutcome;

/// Narrows which entries a `from` reset touches. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetFilter {
    pub tiers: Vec<TierId>,
    pub subtests: Vec<String>,
    pub runs: Vec<u32>,
    /// Prior outcome from the completed-run index.
    pub outcomes: Vec<RunOutcome>,
    /// Recorded for provenance only; never narrows the scope.
    pub judge_slots: Vec<u32>,
}

impl ResetFilter {
    pub fn matches_tier(&self, tier: TierId) -> bool {
        self.tiers.is_empty() || self.tiers.contains(&tier)
    }

    pub fn matches_subtest(&self, subtest: &str) -> bool {
        self.subtests.is_empty() || self.subtests.iter().any(|id| id == subtest)
    }

    fn matches_run(&self, checkpoint: &Checkpoint, tier: TierId, subtest: &str, run: u32) -> bool {
        if !self.runs.is_empty() && !self.runs.contains(&run) {
            return false;
        }
        if self.outcomes.is_empty() {
            return true;
        }
        checkpoint
            .completed_outcome(tier, subtest, run)
            .is_some_and(|outcome| self.outcomes.contains(&outcome))
    }
}

/// What a reset touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub runs: usize,
    pub subtests: usize,
    pub tiers: usize,
    pub experiment: bool,
    /// A judge-slot filter was supplied and had no effect.
    pub judge_slots_ignored: bool,
}

impl ResetReport {
    pub fn is_empty(&self) -> bool {
        self.runs == 0 && self.subtests == 0 && self.tiers == 0 && !self.experiment
    }
}

fn run_reached(state: &Recorded<RunState>, target: RunState) -> bool {
    match state {
        Recorded::Known(state) => state.is_at_or_past(target),
        Recorded::Unrecognized(_) => true,
    }
}

/// Reset matching runs at or past `from` to the preceding state.
pub fn reset_runs_from(checkpoint: &mut Checkpoint, from: RunState, filter: &ResetFilter) -> ResetReport {
    let target = from.predecessor();
    let mut report = ResetReport {
        judge_slots_ignored: !filter.judge_slots.is_empty(),
        ..ResetReport::default()
    };

    let mut matched: Vec<(TierId, String, u32)> = Vec::new();
    for (tier, subtests) in &checkpoint.run_states {
        if !filter.matches_tier(*tier) {
            continue;
        }
        for (subtest, runs) in subtests {
            if !filter.matches_subtest(subtest) {
                continue;
            }
            for (run, state) in runs {
                if run_reached(state, from)
                    && filter.matches_run(checkpoint, *tier, subtest, *run)
                {
                    matched.push((*tier, subtest.clone(), *run));
                }
            }
        }
    }

    let mut touched_subtests: Vec<(TierId, String)> = Vec::new();
    for (tier, subtest, run) in matched {
        checkpoint.reset_run_state(tier, &subtest, run, target);
        report.runs += 1;
        if !touched_subtests.contains(&(tier, subtest.clone())) {
            touched_subtests.push((tier, subtest));
        }
    }

    let mut touched_tiers: Vec<TierId> = Vec::new();
    for (tier, subtest) in &touched_subtests {
        if checkpoint
            .subtest_state(*tier, subtest)
            .is_some_and(|state| state.is_at_or_past(SubtestState::RunsInProgress))
        {
            checkpoint.reset_subtest_state(*tier, subtest, SubtestState::RunsInProgress);
            report.subtests += 1;
        }
        if !touched_tiers.contains(tier) {
            touched_tiers.push(*tier);
        }
    }
    for tier in touched_tiers {
        if demote_tier(checkpoint, tier, TierState::SubtestsRunning) {
            report.tiers += 1;
        }
    }
    if report.runs > 0 {
        report.experiment = demote_experiment(checkpoint);
    }
    report
}

/// Reset matching tiers at or past `from` to the preceding state.
pub fn reset_tiers_from(checkpoint: &mut Checkpoint, from: TierState, filter: &ResetFilter) -> ResetReport {
    let target = from.predecessor();
    let mut report = ResetReport {
        judge_slots_ignored: !filter.judge_slots.is_empty(),
        ..ResetReport::default()
    };
    let matched: Vec<TierId> = checkpoint
        .tier_states
        .iter()
        .filter(|(tier, state)| filter.matches_tier(**tier) && state.is_at_or_past(from))
        .map(|(tier, _)| *tier)
        .collect();
    for tier in matched {
        checkpoint.reset_tier_state(tier, target);
        report.tiers += 1;
    }
    if report.tiers > 0 {
        report.experiment = demote_experiment(checkpoint);
    }
    report
}

/// Reset the experiment if it is at or past `from`.
pub fn reset_experiment_from(checkpoint: &mut Checkpoint, from: ExperimentState) -> ResetReport {
    let mut report = ResetReport::default();
    if checkpoint.experiment_state.is_at_or_past(from) {
        checkpoint.reset_experiment_state(from.predecessor());
        report.experiment = true;
    }
    report
}

/// Move `tier` back to `to` when it is past it. Returns whether anything changed.
pub fn demote_tier(checkpoint: &mut Checkpoint, tier: TierId, to: TierState) -> bool {
    match checkpoint.tier_state(tier) {
        Some(state) if state != to && state.is_at_or_past(to) => {
            checkpoint.reset_tier_state(tier, to);
            true
        }
        _ => false,
    }
}

/// Move the experiment back to `tiers_running` when it is past it.
pub fn demote_experiment(checkpoint: &mut Checkpoint) -> bool {
    let state = checkpoint.experiment_state;
    if state != ExperimentState::TiersRunning && state.is_at_or_past(ExperimentState::TiersRunning) {
        checkpoint.reset_experiment_state(ExperimentState::TiersRunning);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::io::config::ExperimentConfig;

    fn finished() -> Checkpoint {
        let mut config = ExperimentConfig::default();
        config.experiment.id = "exp".to_string();
        config.experiment.tiers = vec![TierId::T0, TierId::T1];
        let mut cp = Checkpoint::new(config, PathBuf::from("/tmp/exp"), "h".to_string());
        for tier in [TierId::T0, TierId::T1] {
            for subtest in ["01-a", "02-b"] {
                cp.register_subtest(tier, subtest);
                cp.reset_subtest_state(tier, subtest, SubtestState::Aggregated);
                cp.mark_run_completed(tier, subtest, 1, RunOutcome::Passed);
                cp.mark_run_completed(tier, subtest, 2, RunOutcome::Failed);
            }
            cp.reset_tier_state(tier, TierState::Complete);
        }
        cp.reset_experiment_state(ExperimentState::Complete);
        cp
    }

    #[test]
    fn from_run_resets_and_demotes_parents() {
        let mut cp = finished();
        let filter = ResetFilter {
            tiers: vec![TierId::T1],
            ..ResetFilter::default()
        };
        let report = reset_runs_from(&mut cp, RunState::AgentComplete, &filter);
        assert_eq!(report.runs, 4);
        assert_eq!(report.subtests, 2);
        assert_eq!(report.tiers, 1);
        assert!(report.experiment);

        assert!(
            cp.run_state(TierId::T1, "01-a", 1)
                .expect("run")
                .is(RunState::PromptWritten)
        );
        assert!(!cp.is_run_completed(TierId::T1, "01-a", 1));
        assert!(cp.is_run_completed(TierId::T0, "01-a", 1));
        assert_eq!(
            cp.subtest_state(TierId::T1, "02-b"),
            Some(SubtestState::RunsInProgress)
        );
        assert_eq!(cp.tier_state(TierId::T1), Some(TierState::SubtestsRunning));
        assert_eq!(cp.tier_state(TierId::T0), Some(TierState::Complete));
        assert_eq!(cp.experiment_state, ExperimentState::TiersRunning);
    }

    #[test]
    fn outcome_filter_uses_completed_index() {
        let mut cp = finished();
        let filter = ResetFilter {
            outcomes: vec![RunOutcome::Failed],
            subtests: vec!["01-a".to_string()],
            ..ResetFilter::default()
        };
        let report = reset_runs_from(&mut cp, RunState::Pending, &filter);
        assert_eq!(report.runs, 2);
        assert!(cp.is_run_completed(TierId::T0, "01-a", 1));
        assert!(!cp.is_run_completed(TierId::T0, "01-a", 2));
        assert!(
            cp.run_state(TierId::T0, "01-a", 2)
                .expect("run")
                .is(RunState::Pending)
        );
    }

    #[test]
    fn judge_slot_filter_does_not_change_scope() {
        let mut with_slots = finished();
        let mut without = finished();
        let slots = ResetFilter {
            judge_slots: vec![2],
            ..ResetFilter::default()
        };
        let a = reset_runs_from(&mut with_slots, RunState::JudgePipelineRun, &slots);
        let b = reset_runs_from(&mut without, RunState::JudgePipelineRun, &ResetFilter::default());
        assert_eq!(a.runs, b.runs);
        assert!(a.judge_slots_ignored);
        assert_eq!(with_slots.run_states, without.run_states);
        assert_eq!(with_slots.completed_runs, without.completed_runs);
    }

    #[test]
    fn side_branches_count_as_reached() {
        let mut cp = finished();
        cp.reset_run_state(TierId::T0, "01-a", 1, RunState::Failed);
        let filter = ResetFilter {
            tiers: vec![TierId::T0],
            subtests: vec!["01-a".to_string()],
            runs: vec![1],
            ..ResetFilter::default()
        };
        let report = reset_runs_from(&mut cp, RunState::RunFinalized, &filter);
        assert_eq!(report.runs, 1);
        assert!(
            cp.run_state(TierId::T0, "01-a", 1)
                .expect("run")
                .is(RunState::JudgePipelineRun)
        );
    }

    #[test]
    fn from_tier_resets_tier_scope() {
        let mut cp = finished();
        let report = reset_tiers_from(&mut cp, TierState::BestSelected, &ResetFilter::default());
        assert_eq!(report.tiers, 2);
        assert_eq!(cp.tier_state(TierId::T0), Some(TierState::SubtestsComplete));
        assert_eq!(cp.experiment_state, ExperimentState::TiersRunning);
        assert!(cp.is_run_completed(TierId::T0, "01-a", 1));
    }

    #[test]
    fn from_experiment_only_touches_experiment() {
        let mut cp = finished();
        let report = reset_experiment_from(&mut cp, ExperimentState::ReportsGenerated);
        assert!(report.experiment);
        assert_eq!(cp.experiment_state, ExperimentState::TiersComplete);
        assert_eq!(cp.tier_state(TierId::T0), Some(TierState::Complete));

        let mut fresh = finished();
        fresh.reset_experiment_state(ExperimentState::DirCreated);
        assert!(reset_experiment_from(&mut fresh, ExperimentState::ReportsGenerated).is_empty());
    }
}
