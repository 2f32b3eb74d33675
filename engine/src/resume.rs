//! Reconciling a loaded checkpoint with the current invocation, persisted.

use std::path::Path;

use tracing::{info, instrument, warn};

use crate::core::checkpoint::Checkpoint;
use crate::core::replay::{ResetReport, reset_experiment_from, reset_runs_from, reset_tiers_from};
use crate::core::resume::{
    MergeReport, check_tiers_need_execution, merge_tiers_and_reset_incomplete, reset_failed_states,
    restore_cli_args,
};
use crate::core::tier::TierId;
use crate::error::CheckpointError;
use crate::io::checkpoint_store;
use crate::io::config::ExperimentConfig;

pub struct ResumeManager<'a> {
    checkpoint_path: &'a Path,
}

impl<'a> ResumeManager<'a> {
    pub fn new(checkpoint_path: &'a Path) -> Self {
        Self { checkpoint_path }
    }

    /// Fold `current` into the checkpoint and return the config to run with.
    ///
    /// Order: restore arguments, clean up stale failures, apply `from` resets
    /// given on this invocation, then merge requested tiers (which saves).
    #[instrument(skip_all, fields(experiment_id = %checkpoint.experiment_id))]
    pub fn reconcile(
        &self,
        checkpoint: &mut Checkpoint,
        current: &ExperimentConfig,
    ) -> Result<ExperimentConfig, CheckpointError> {
        let restored = restore_cli_args(&checkpoint.config, current);
        checkpoint.config = restored.config;

        let cleaned = reset_failed_states(checkpoint);
        if !cleaned.is_empty() {
            info!(
                runs = cleaned.runs,
                subtests = cleaned.subtests,
                tiers = cleaned.tiers,
                experiment = cleaned.experiment,
                "stale failures reset"
            );
        }

        if restored.apply_from {
            let replayed = self.apply_from_resets(checkpoint, current);
            info!(
                runs = replayed.runs,
                subtests = replayed.subtests,
                tiers = replayed.tiers,
                experiment = replayed.experiment,
                "from reset applied"
            );
        }

        let pending = check_tiers_need_execution(checkpoint, &current.experiment.tiers);
        info!(tiers = ?pending, "tiers needing execution");
        self.merge_cli_tiers_and_reset_incomplete(checkpoint, &current.experiment.tiers)?;
        Ok(checkpoint.config.clone())
    }

    /// Only `from` states supplied on this invocation are executed; filters
    /// fall back to the saved values.
    fn apply_from_resets(&self, checkpoint: &mut Checkpoint, current: &ExperimentConfig) -> ResetReport {
        let filter = checkpoint.config.overrides.reset_filter();
        if !filter.judge_slots.is_empty() {
            warn!(slots = ?filter.judge_slots, "judge-slot filter has no effect on reset scope");
        }
        let mut total = ResetReport::default();
        let mut add = |report: ResetReport| {
            total.runs += report.runs;
            total.subtests += report.subtests;
            total.tiers += report.tiers;
            total.experiment |= report.experiment;
            total.judge_slots_ignored |= report.judge_slots_ignored;
        };
        if let Some(from) = current.overrides.from_experiment {
            add(reset_experiment_from(checkpoint, from));
        }
        if let Some(from) = current.overrides.from_tier {
            add(reset_tiers_from(checkpoint, from, &filter));
        }
        if let Some(from) = current.overrides.from_run {
            add(reset_runs_from(checkpoint, from, &filter));
        }
        total
    }

    /// Add requested tiers, demote scopes with unfinished runs, and save.
    pub fn merge_cli_tiers_and_reset_incomplete(
        &self,
        checkpoint: &mut Checkpoint,
        requested: &[TierId],
    ) -> Result<MergeReport, CheckpointError> {
        let report = merge_tiers_and_reset_incomplete(checkpoint, requested);
        if !report.added_tiers.is_empty() {
            info!(tiers = ?report.added_tiers, "tiers added to experiment");
        }
        if !report.demoted_tiers.is_empty() || !report.demoted_subtests.is_empty() {
            info!(
                tiers = ?report.demoted_tiers,
                subtests = report.demoted_subtests.len(),
                experiment = report.experiment_demoted,
                "incomplete scopes demoted"
            );
        }
        checkpoint_store::save(checkpoint, self.checkpoint_path)?;
        Ok(report)
    }
}
