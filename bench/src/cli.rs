//! CLI command implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use engine::coordinator::ShutdownToken;
use engine::core::states::{ExperimentState, RunState, TierState};
use engine::core::tier::TierId;
use engine::core::types::RunOutcome;
use engine::exit_codes;
use engine::io::checkpoint_store;
use engine::io::config::{ExperimentConfig, load_config};
use engine::runner::run_experiment;
use tracing::{debug, info};

use crate::visualize::{self, Format};

/// Arguments for `bench run`. List flags take comma-separated values.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Experiment config (TOML).
    #[arg(long)]
    pub config: PathBuf,

    /// Tiers to run; merged with the tiers of an existing checkpoint.
    #[arg(long, value_delimiter = ',')]
    pub tiers: Vec<TierId>,

    /// Stop each run once it reaches this state. Pass `worktree_cleaned` to
    /// lift a halt saved by an earlier invocation.
    #[arg(long)]
    pub until: Option<RunState>,

    /// Stop each tier once it reaches this state (`complete` lifts a saved halt).
    #[arg(long)]
    pub until_tier: Option<TierState>,

    /// Stop the experiment once it reaches this state (`complete` lifts a saved halt).
    #[arg(long)]
    pub until_experiment: Option<ExperimentState>,

    /// Replay matching runs from this state.
    #[arg(long)]
    pub from: Option<RunState>,

    /// Replay matching tiers from this state.
    #[arg(long)]
    pub from_tier: Option<TierState>,

    /// Replay the experiment from this state.
    #[arg(long)]
    pub from_experiment: Option<ExperimentState>,

    #[arg(long, value_delimiter = ',')]
    pub filter_tier: Vec<TierId>,

    #[arg(long, value_delimiter = ',')]
    pub filter_subtest: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    pub filter_run: Vec<u32>,

    /// Completed-run outcomes to replay: passed, failed, agent_failed.
    #[arg(long, value_delimiter = ',')]
    pub filter_status: Vec<RunOutcome>,

    /// Recorded with the checkpoint; does not narrow a replay.
    #[arg(long, value_delimiter = ',')]
    pub filter_judge_slot: Vec<u32>,

    /// Run at most this many subtests per tier.
    #[arg(long)]
    pub max_subtests: Option<usize>,

    /// Worker threads per tier.
    #[arg(long)]
    pub max_parallel: Option<usize>,
}

impl RunArgs {
    /// Layer the flags onto a loaded config. Omitted flags leave it untouched.
    pub fn apply(&self, config: &mut ExperimentConfig) {
        if !self.tiers.is_empty() {
            config.experiment.tiers = self.tiers.clone();
        }
        if let Some(max) = self.max_parallel {
            config.parallel.max_parallel_subtests = max;
        }
        let overrides = &mut config.overrides;
        overrides.until_run = self.until.or(overrides.until_run);
        overrides.until_tier = self.until_tier.or(overrides.until_tier);
        overrides.until_experiment = self.until_experiment.or(overrides.until_experiment);
        overrides.from_run = self.from.or(overrides.from_run);
        overrides.from_tier = self.from_tier.or(overrides.from_tier);
        overrides.from_experiment = self.from_experiment.or(overrides.from_experiment);
        if !self.filter_tier.is_empty() {
            overrides.filter_tiers = self.filter_tier.clone();
        }
        if !self.filter_subtest.is_empty() {
            overrides.filter_subtests = self.filter_subtest.clone();
        }
        if !self.filter_run.is_empty() {
            overrides.filter_runs = self.filter_run.clone();
        }
        if !self.filter_status.is_empty() {
            overrides.filter_status = self.filter_status.clone();
        }
        if !self.filter_judge_slot.is_empty() {
            overrides.filter_judge_slots = self.filter_judge_slot.clone();
        }
        overrides.max_subtests = self.max_subtests.or(overrides.max_subtests);
    }
}

/// Run (or resume) an experiment. Returns the process exit code.
pub fn cmd_run(args: &RunArgs) -> Result<i32> {
    let mut config = load_config(&args.config).context("load config")?;
    args.apply(&mut config);
    config
        .validate()
        .with_context(|| format!("validate {} with flags", args.config.display()))?;
    debug!(
        experiment_id = %config.experiment.id,
        tiers = ?config.experiment.tiers,
        "starting experiment"
    );

    let report = run_experiment(config, ShutdownToken::new())?;
    info!(outcome = ?report.outcome, "experiment finished");
    println!(
        "run: outcome={} state={} checkpoint={}",
        report.outcome.as_str(),
        report.experiment_state,
        report.checkpoint_path.display()
    );
    Ok(report.outcome.exit_code())
}

/// Rebuild the completed-run index from run artifacts.
pub fn cmd_repair(path: &Path) -> Result<i32> {
    let checkpoint_path = checkpoint_store::resolve_checkpoint_path(path);
    let report = checkpoint_store::repair(&checkpoint_path)
        .with_context(|| format!("repair {}", checkpoint_path.display()))?;
    for run in &report.added {
        println!(
            "repair: added tier={} subtest={} run={} outcome={}",
            run.tier, run.subtest, run.run, run.outcome
        );
    }
    for skipped in &report.skipped {
        println!("repair: skipped {}", skipped.display());
    }
    println!(
        "repair: added={} skipped={} checkpoint={}",
        report.added.len(),
        report.skipped.len(),
        checkpoint_path.display()
    );
    Ok(exit_codes::OK)
}

/// Print checkpoint state.
pub fn cmd_visualize(path: &Path, format: Format, tiers: &[TierId]) -> Result<i32> {
    let checkpoint_path = checkpoint_store::resolve_checkpoint_path(path);
    let checkpoint = checkpoint_store::load(&checkpoint_path)
        .with_context(|| format!("load {}", checkpoint_path.display()))?;
    let view = visualize::view(&checkpoint, tiers);
    print!("{}", visualize::render(&view, format)?);
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_and_omitted_flags_keep_config() {
        let mut config = ExperimentConfig::default();
        config.overrides.until_tier = Some(TierState::BestSelected);
        config.overrides.filter_subtests = vec!["01-a".to_string()];

        let args = RunArgs {
            tiers: vec![TierId::T0, TierId::T2],
            until: Some(RunState::AgentComplete),
            filter_status: vec![RunOutcome::Failed],
            max_parallel: Some(2),
            ..RunArgs::default()
        };
        args.apply(&mut config);

        assert_eq!(config.experiment.tiers, vec![TierId::T0, TierId::T2]);
        assert_eq!(config.parallel.max_parallel_subtests, 2);
        assert_eq!(config.overrides.until_run, Some(RunState::AgentComplete));
        assert_eq!(config.overrides.until_tier, Some(TierState::BestSelected));
        assert_eq!(config.overrides.filter_status, vec![RunOutcome::Failed]);
        assert_eq!(config.overrides.filter_subtests, vec!["01-a".to_string()]);
        assert_eq!(config.overrides.max_subtests, None);
    }

    #[test]
    fn repair_and_visualize_accept_an_experiment_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = engine::test_support::test_config(temp.path(), &[TierId::T0]);
        let experiment_dir = config.experiment_dir();
        std::fs::create_dir_all(&experiment_dir).expect("mkdir");
        let mut checkpoint = engine::test_support::checkpoint(&config);
        checkpoint_store::save(&mut checkpoint, &checkpoint_store::checkpoint_path(&experiment_dir))
            .expect("save");

        assert_eq!(cmd_repair(&experiment_dir).expect("repair"), exit_codes::OK);
        assert_eq!(
            cmd_visualize(&experiment_dir, Format::Table, &[]).expect("visualize"),
            exit_codes::OK
        );
        assert!(cmd_visualize(&temp.path().join("missing"), Format::Tree, &[]).is_err());
    }

    #[test]
    fn empty_flags_leave_tiers_alone() {
        let mut config = ExperimentConfig::default();
        config.experiment.tiers = vec![TierId::T1];
        RunArgs::default().apply(&mut config);
        assert_eq!(config.experiment.tiers, vec![TierId::T1]);
        assert_eq!(config.overrides, Default::default());
    }
}
