//! Reconciling a loaded checkpoint with a new invocation.
//!
//! These functions are pure; persisting the result is the caller's job.

use crate::core::checkpoint::Checkpoint;
use crate::core::replay::{ResetReport, demote_experiment, demote_tier};
use crate::core::states::{ExperimentState, Lifecycle, Recorded, RunState, SubtestState, TierState};
use crate::core::tier::{TierId, union_tiers};
use crate::io::config::ExperimentConfig;

/// Config to run with after folding the current invocation into the saved one.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredArgs {
    pub config: ExperimentConfig,
    /// Whether `from` resets were requested on this invocation.
    pub apply_from: bool,
}

/// Layer the current invocation over the checkpoint's saved config.
///
/// Execution-affecting sections come from the saved config. Knobs excluded
/// from the config hash (parallelism, rate limits, workspace retention) follow
/// the current invocation. Overrides fall back to the saved values when omitted.
pub fn restore_cli_args(saved: &ExperimentConfig, current: &ExperimentConfig) -> RestoredArgs {
    let mut config = saved.clone();
    config.parallel = current.parallel.clone();
    config.rate_limit = current.rate_limit.clone();
    config.experiment.keep_workspaces = current.experiment.keep_workspaces;
    config.overrides = current.overrides.layered_over(&saved.overrides);
    RestoredArgs {
        config,
        apply_from: current.overrides.has_from(),
    }
}

/// Return stale failures to a runnable state. Terminal successes are untouched.
pub fn reset_failed_states(checkpoint: &mut Checkpoint) -> ResetReport {
    let mut report = ResetReport::default();

    if matches!(
        checkpoint.experiment_state,
        ExperimentState::Failed | ExperimentState::Interrupted
    ) {
        checkpoint.reset_experiment_state(ExperimentState::TiersRunning);
        report.experiment = true;
    }

    let failed_tiers: Vec<TierId> = checkpoint
        .tier_states
        .iter()
        .filter(|(_, state)| **state == TierState::Failed)
        .map(|(tier, _)| *tier)
        .collect();
    for tier in failed_tiers {
        checkpoint.reset_tier_state(tier, TierState::Pending);
        report.tiers += 1;
    }

    let failed_subtests: Vec<(TierId, String)> = checkpoint
        .subtest_states
        .iter()
        .flat_map(|(tier, subtests)| {
            subtests
                .iter()
                .filter(|(_, state)| **state == SubtestState::Failed)
                .map(move |(subtest, _)| (*tier, subtest.clone()))
        })
        .collect();
    for (tier, subtest) in failed_subtests {
        checkpoint.reset_subtest_state(tier, &subtest, SubtestState::Pending);
        report.subtests += 1;
    }

    let stale_runs: Vec<(TierId, String, u32)> = checkpoint
        .run_states
        .iter()
        .flat_map(|(tier, subtests)| {
            subtests.iter().flat_map(move |(subtest, runs)| {
                runs.iter()
                    .filter(|(_, state)| is_stale_failure(state))
                    .map(move |(run, _)| (*tier, subtest.clone(), *run))
            })
        })
        .collect();
    for (tier, subtest, run) in stale_runs {
        checkpoint.reset_run_state(tier, &subtest, run, RunState::Pending);
        report.runs += 1;
    }

    report
}

fn is_stale_failure(state: &Recorded<RunState>) -> bool {
    matches!(
        state,
        Recorded::Known(RunState::Failed | RunState::RateLimited | RunState::Interrupted)
    )
}

/// Tiers from `requested` that still have work to do.
pub fn check_tiers_need_execution(checkpoint: &Checkpoint, requested: &[TierId]) -> Vec<TierId> {
    requested
        .iter()
        .copied()
        .filter(|tier| match checkpoint.tier_state(*tier) {
            None => true,
            Some(TierState::Complete) => checkpoint.tier_has_incomplete_runs(*tier),
            Some(_) => true,
        })
        .collect()
}

/// What `merge_tiers_and_reset_incomplete` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added_tiers: Vec<TierId>,
    pub demoted_tiers: Vec<TierId>,
    pub demoted_subtests: Vec<(TierId, String)>,
    pub experiment_demoted: bool,
}

/// Add newly requested tiers and demote scopes that claim completion while
/// holding non-terminal runs.
pub fn merge_tiers_and_reset_incomplete(
    checkpoint: &mut Checkpoint,
    requested: &[TierId],
) -> MergeReport {
    let mut report = MergeReport::default();

    let merged = union_tiers(&checkpoint.config.experiment.tiers, requested);
    for tier in &merged {
        if checkpoint.tier_state(*tier).is_none() {
            checkpoint.register_tier(*tier);
            report.added_tiers.push(*tier);
        }
    }
    checkpoint.config.experiment.tiers = merged;

    let tiers: Vec<TierId> = checkpoint.tier_states.keys().copied().collect();
    for tier in tiers {
        for subtest in checkpoint.subtests(tier) {
            let past_runs = checkpoint
                .subtest_state(tier, &subtest)
                .is_some_and(|state| {
                    !state.is_side_branch() && state.is_at_or_past(SubtestState::RunsComplete)
                });
            if past_runs && checkpoint.subtest_has_incomplete_runs(tier, &subtest) {
                checkpoint.reset_subtest_state(tier, &subtest, SubtestState::RunsInProgress);
                report.demoted_subtests.push((tier, subtest));
            }
        }
        let past_subtests = checkpoint.tier_state(tier).is_some_and(|state| {
            !state.is_side_branch() && state.is_at_or_past(TierState::SubtestsComplete)
        });
        if past_subtests
            && checkpoint.tier_has_incomplete_runs(tier)
            && demote_tier(checkpoint, tier, TierState::SubtestsRunning)
        {
            report.demoted_tiers.push(tier);
        }
    }

    let pending_work = !report.added_tiers.is_empty()
        || !check_tiers_need_execution(checkpoint, &checkpoint.config.experiment.tiers).is_empty();
    if pending_work && !checkpoint.experiment_state.is_side_branch() {
        report.experiment_demoted = demote_experiment(checkpoint);
    }
    report
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::core::types::RunOutcome;

    fn checkpoint(tiers: &[TierId]) -> Checkpoint {
        let mut config = ExperimentConfig::default();
        config.experiment.id = "exp".to_string();
        config.experiment.tiers = tiers.to_vec();
        Checkpoint::new(config, PathBuf::from("/tmp/exp"), "h".to_string())
    }

    fn complete_tier(cp: &mut Checkpoint, tier: TierId) {
        cp.register_subtest(tier, "01-a");
        cp.reset_subtest_state(tier, "01-a", SubtestState::Aggregated);
        cp.mark_run_completed(tier, "01-a", 1, RunOutcome::Passed);
        cp.reset_tier_state(tier, TierState::Complete);
    }

    #[test]
    fn failed_experiment_and_tiers_return_to_runnable() {
        let mut cp = checkpoint(&[TierId::T0, TierId::T1]);
        complete_tier(&mut cp, TierId::T1);
        cp.reset_tier_state(TierId::T0, TierState::Failed);
        cp.register_subtest(TierId::T0, "01-a");
        cp.reset_subtest_state(TierId::T0, "01-a", SubtestState::Failed);
        cp.reset_run_state(TierId::T0, "01-a", 1, RunState::Failed);
        cp.reset_run_state(TierId::T0, "01-a", 2, RunState::RateLimited);
        cp.reset_experiment_state(ExperimentState::Failed);

        let report = reset_failed_states(&mut cp);

        assert_eq!(cp.experiment_state, ExperimentState::TiersRunning);
        assert_eq!(cp.tier_state(TierId::T0), Some(TierState::Pending));
        assert_eq!(cp.tier_state(TierId::T1), Some(TierState::Complete));
        assert_eq!(cp.subtest_state(TierId::T0, "01-a"), Some(SubtestState::Pending));
        assert!(
            cp.run_state(TierId::T0, "01-a", 2)
                .expect("run")
                .is(RunState::Pending)
        );
        assert!(cp.is_run_completed(TierId::T1, "01-a", 1));
        assert_eq!(report.runs, 2);
        assert_eq!(report.tiers, 1);
    }

    #[test]
    fn interrupted_experiment_resumes() {
        let mut cp = checkpoint(&[TierId::T0]);
        cp.reset_experiment_state(ExperimentState::Interrupted);
        cp.reset_run_state(TierId::T0, "01-a", 1, RunState::Interrupted);
        reset_failed_states(&mut cp);
        assert_eq!(cp.experiment_state, ExperimentState::TiersRunning);
        assert!(
            cp.run_state(TierId::T0, "01-a", 1)
                .expect("run")
                .is(RunState::Pending)
        );
    }

    #[test]
    fn tiers_needing_execution() {
        let mut cp = checkpoint(&[TierId::T0, TierId::T1, TierId::T2]);
        complete_tier(&mut cp, TierId::T0);
        complete_tier(&mut cp, TierId::T1);
        cp.register_run(TierId::T1, "01-a", 2);
        let needed = check_tiers_need_execution(&cp, &[TierId::T0, TierId::T1, TierId::T2, TierId::T3]);
        assert_eq!(needed, vec![TierId::T1, TierId::T2, TierId::T3]);
    }

    #[test]
    fn complete_tier_with_pending_run_is_demoted() {
        let mut cp = checkpoint(&[TierId::T0]);
        complete_tier(&mut cp, TierId::T0);
        cp.register_run(TierId::T0, "01-a", 2);
        cp.reset_experiment_state(ExperimentState::Complete);

        let report = merge_tiers_and_reset_incomplete(&mut cp, &[TierId::T0]);

        assert_eq!(cp.tier_state(TierId::T0), Some(TierState::SubtestsRunning));
        assert_eq!(
            cp.subtest_state(TierId::T0, "01-a"),
            Some(SubtestState::RunsInProgress)
        );
        assert_eq!(cp.experiment_state, ExperimentState::TiersRunning);
        assert_eq!(report.demoted_tiers, vec![TierId::T0]);
        assert!(report.experiment_demoted);
    }

    #[test]
    fn settled_tiers_are_never_demoted() {
        let mut cp = checkpoint(&[TierId::T0]);
        complete_tier(&mut cp, TierId::T0);
        cp.reset_experiment_state(ExperimentState::Complete);

        let report = merge_tiers_and_reset_incomplete(&mut cp, &[TierId::T0, TierId::T5]);

        assert_eq!(cp.tier_state(TierId::T0), Some(TierState::Complete));
        assert_eq!(cp.tier_state(TierId::T5), Some(TierState::Pending));
        assert_eq!(report.added_tiers, vec![TierId::T5]);
        assert!(report.demoted_tiers.is_empty());
        assert_eq!(cp.experiment_state, ExperimentState::TiersRunning);
        assert_eq!(cp.config.experiment.tiers, vec![TierId::T0, TierId::T5]);
    }

    #[test]
    fn finished_experiment_without_new_work_stays_complete() {
        let mut cp = checkpoint(&[TierId::T0]);
        complete_tier(&mut cp, TierId::T0);
        cp.reset_experiment_state(ExperimentState::Complete);
        let report = merge_tiers_and_reset_incomplete(&mut cp, &[TierId::T0]);
        assert_eq!(report, MergeReport::default());
        assert_eq!(cp.experiment_state, ExperimentState::Complete);
    }

    #[test]
    fn restore_prefers_explicit_overrides() {
        let mut saved = ExperimentConfig::default();
        saved.experiment.id = "exp".to_string();
        saved.overrides.until_run = Some(RunState::AgentComplete);
        saved.overrides.from_tier = Some(TierState::BestSelected);

        let mut current = saved.clone();
        current.overrides = Default::default();
        current.parallel.max_parallel_subtests = 9;
        current.execution.model = "ignored".to_string();

        let restored = restore_cli_args(&saved, &current);
        assert!(!restored.apply_from);
        assert_eq!(restored.config.overrides.until_run, Some(RunState::AgentComplete));
        assert_eq!(restored.config.parallel.max_parallel_subtests, 9);
        assert_eq!(restored.config.execution.model, saved.execution.model);

        current.overrides.from_run = Some(RunState::Pending);
        assert!(restore_cli_args(&saved, &current).apply_from);
    }
}
