//! Top-level experiment driver.
//!
//! Loads or creates the checkpoint, reconciles it with the invocation, then
//! walks tiers in dependency order. Every state change is saved before the
//! next step starts.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::ShutdownToken;
use crate::core::checkpoint::Checkpoint;
use crate::core::report::{ExperimentSummary, TierResult};
use crate::core::resources::{ResourceSpec, TierBaseline};
use crate::core::selection::{Selection, SubtestSummary, select_best_subtest};
use crate::core::states::{ExperimentState, Lifecycle, SubtestState, TierState, halt_reached};
use crate::core::tier::{TierId, execution_order};
use crate::core::types::SubtestStatus;
use crate::error::{ConfigMismatch, EngineError};
use crate::exit_codes;
use crate::io::agent::{AgentAdapter, CommandAgent};
use crate::io::artifacts::{
    SUBTEST_RESULT_FILE, SUMMARY_FILE, TIER_RESULT_FILE, read_json, subtest_dir, tier_dir,
    write_json,
};
use crate::io::baseline::{
    BestSubtestRecord, build_baseline, is_schedulable, load_best_subtest, write_best_subtest,
};
use crate::io::checkpoint_store;
use crate::io::config::ExperimentConfig;
use crate::io::judge::{CommandJudge, JudgeAdapter};
use crate::io::resources::{DirectoryResources, ResourceProvider};
use crate::parallel::ParallelSubtestExecutor;
use crate::resume::ResumeManager;
use crate::subtest::{SubtestPlan, WorkerContext};

/// External collaborators the engine delegates to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub agent: &'a dyn AgentAdapter,
    pub judge: &'a dyn JudgeAdapter,
    pub resources: &'a dyn ResourceProvider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentOutcome {
    Complete,
    /// Stopped cleanly at an `until` target.
    Halted,
    Interrupted,
    Failed,
}

impl ExperimentOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentOutcome::Complete => "complete",
            ExperimentOutcome::Halted => "halted",
            ExperimentOutcome::Interrupted => "interrupted",
            ExperimentOutcome::Failed => "failed",
        }
    }

    pub fn exit_code(self) -> i32 {
        match self {
            ExperimentOutcome::Complete | ExperimentOutcome::Halted => exit_codes::OK,
            ExperimentOutcome::Interrupted | ExperimentOutcome::Failed => exit_codes::FAILURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: ExperimentOutcome,
    pub experiment_state: ExperimentState,
    pub checkpoint_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TierOutcome {
    Complete,
    Halted,
    Interrupted,
    Failed,
}

pub struct Runner<'a> {
    config: ExperimentConfig,
    collaborators: Collaborators<'a>,
    shutdown: ShutdownToken,
}

/// Run `config` with the process-backed adapters and directory fixtures.
pub fn run_experiment(config: ExperimentConfig, shutdown: ShutdownToken) -> Result<RunReport, EngineError> {
    let timeout = Duration::from_secs(config.execution.timeout_secs);
    let agent = CommandAgent {
        command: config.agent.command.clone(),
        timeout,
        output_limit_bytes: config.execution.output_limit_bytes,
    };
    let judge = CommandJudge {
        command: config.judge.command.clone(),
        timeout,
        output_limit_bytes: config.execution.output_limit_bytes,
    };
    let resources = DirectoryResources::new(&config.experiment.tiers_dir);
    let collaborators = Collaborators {
        agent: &agent,
        judge: &judge,
        resources: &resources,
    };
    Runner::new(config, collaborators, shutdown).run()
}

impl<'a> Runner<'a> {
    pub fn new(config: ExperimentConfig, collaborators: Collaborators<'a>, shutdown: ShutdownToken) -> Self {
        Self {
            config,
            collaborators,
            shutdown,
        }
    }

    #[instrument(skip_all, fields(experiment_id = %self.config.experiment.id))]
    pub fn run(&self) -> Result<RunReport, EngineError> {
        let experiment_dir = self.config.experiment_dir();
        let checkpoint_path = checkpoint_store::checkpoint_path(&experiment_dir);
        let mut checkpoint = self.open_checkpoint(&experiment_dir, &checkpoint_path)?;
        checkpoint.pid = std::process::id();
        checkpoint_store::save(&mut checkpoint, &checkpoint_path)?;

        let outcome = match self.drive(&mut checkpoint, &checkpoint_path) {
            Ok(outcome) => outcome,
            Err(err) => {
                checkpoint.reset_experiment_state(ExperimentState::Failed);
                if let Err(save_err) = checkpoint_store::save(&mut checkpoint, &checkpoint_path) {
                    warn!(err = %save_err, "failed to record experiment failure");
                }
                return Err(err);
            }
        };
        info!(
            outcome = ?outcome,
            experiment_state = %checkpoint.experiment_state,
            "experiment finished"
        );
        Ok(RunReport {
            outcome,
            experiment_state: checkpoint.experiment_state,
            checkpoint_path,
        })
    }

    fn open_checkpoint(&self, experiment_dir: &Path, checkpoint_path: &Path) -> Result<Checkpoint, EngineError> {
        let current_hash = self.config.config_hash()?;
        if checkpoint_path.exists() {
            let mut checkpoint = checkpoint_store::load(checkpoint_path)?;
            if checkpoint.config_hash != current_hash {
                return Err(ConfigMismatch {
                    experiment_id: checkpoint.experiment_id.clone(),
                    recorded: checkpoint.config_hash.clone(),
                    current: current_hash,
                }
                .into());
            }
            info!(
                experiment_state = %checkpoint.experiment_state,
                started_at = %checkpoint.started_at,
                "resuming experiment"
            );
            ResumeManager::new(checkpoint_path).reconcile(&mut checkpoint, &self.config)?;
            return Ok(checkpoint);
        }

        fs::create_dir_all(experiment_dir)
            .with_context(|| format!("create experiment dir {}", experiment_dir.display()))?;
        info!(dir = %experiment_dir.display(), "starting new experiment");
        Ok(Checkpoint::new(
            self.config.clone(),
            experiment_dir.to_path_buf(),
            current_hash,
        ))
    }

    fn drive(&self, checkpoint: &mut Checkpoint, path: &Path) -> Result<ExperimentOutcome, EngineError> {
        let config = checkpoint.config.clone();
        let until = config.overrides.until_experiment;

        if !self.wait_out_window(checkpoint, path, &config)? {
            return self.finish_interrupted(checkpoint, path);
        }
        if self.step_experiment(checkpoint, path, ExperimentState::DirCreated, until)?
            || self.step_experiment(checkpoint, path, ExperimentState::TiersRunning, until)?
        {
            return Ok(ExperimentOutcome::Halted);
        }

        let mut halted = false;
        let mut failed = false;
        let mut blocked = false;
        for tier in execution_order(&config.experiment.tiers) {
            if self.shutdown.is_requested() {
                return self.finish_interrupted(checkpoint, path);
            }
            if checkpoint.tier_is_settled(tier) {
                debug!(tier = %tier, "tier already complete");
                continue;
            }
            if waiting_on_dependencies(checkpoint, tier) {
                warn!(tier = %tier, "dependencies unfinished; tier skipped");
                blocked = true;
                continue;
            }
            match self.run_tier(checkpoint, path, &config, tier)? {
                TierOutcome::Complete => {}
                TierOutcome::Halted => halted = true,
                TierOutcome::Interrupted => return self.finish_interrupted(checkpoint, path),
                TierOutcome::Failed => failed = true,
            }
        }
        if failed || (blocked && !halted) {
            checkpoint.reset_experiment_state(ExperimentState::Failed);
            checkpoint_store::save(checkpoint, path)?;
            return Ok(ExperimentOutcome::Failed);
        }
        if halted || blocked {
            return Ok(ExperimentOutcome::Halted);
        }

        if self.step_experiment(checkpoint, path, ExperimentState::TiersComplete, until)? {
            return Ok(ExperimentOutcome::Halted);
        }
        if !checkpoint
            .experiment_state
            .is_at_or_past(ExperimentState::ReportsGenerated)
        {
            write_summary(checkpoint, &config)?;
        }
        if self.step_experiment(checkpoint, path, ExperimentState::ReportsGenerated, until)? {
            return Ok(ExperimentOutcome::Halted);
        }
        self.step_experiment(checkpoint, path, ExperimentState::Complete, until)?;
        Ok(ExperimentOutcome::Complete)
    }

    /// Wait out a rate-limit window left by a previous process. `false` if interrupted.
    fn wait_out_window(
        &self,
        checkpoint: &mut Checkpoint,
        path: &Path,
        config: &ExperimentConfig,
    ) -> Result<bool, EngineError> {
        let Some(window) = checkpoint.rate_limit.clone() else {
            return Ok(true);
        };
        let remaining = (window.resume_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            info!(
                source = %window.info.source,
                remaining_secs = remaining.as_secs_f64(),
                "waiting out recorded rate limit window"
            );
            let poll = Duration::from_millis(config.rate_limit.poll_interval_ms);
            if !self.shutdown.sleep(remaining, poll) {
                return Ok(false);
            }
        }
        checkpoint.rate_limit = None;
        checkpoint_store::save(checkpoint, path)?;
        Ok(true)
    }

    fn finish_interrupted(&self, checkpoint: &mut Checkpoint, path: &Path) -> Result<ExperimentOutcome, EngineError> {
        checkpoint.reset_experiment_state(ExperimentState::Interrupted);
        checkpoint_store::save(checkpoint, path)?;
        info!("experiment interrupted; resume to continue");
        Ok(ExperimentOutcome::Interrupted)
    }

    /// Advance the experiment to `state` unless already there. Returns whether to halt.
    fn step_experiment(
        &self,
        checkpoint: &mut Checkpoint,
        path: &Path,
        state: ExperimentState,
        until: Option<ExperimentState>,
    ) -> Result<bool, EngineError> {
        if !checkpoint.experiment_state.is_at_or_past(state) {
            checkpoint
                .set_experiment_state(state)
                .map_err(anyhow::Error::from)?;
            checkpoint_store::save(checkpoint, path)?;
            info!(state = %state, "experiment state");
        }
        Ok(halt_reached(until, checkpoint.experiment_state))
    }

    fn step_tier(
        &self,
        checkpoint: &mut Checkpoint,
        path: &Path,
        tier: TierId,
        state: TierState,
        until: Option<TierState>,
    ) -> Result<bool, EngineError> {
        let current = checkpoint.tier_state(tier).unwrap_or(TierState::Pending);
        if !current.is_at_or_past(state) {
            checkpoint
                .set_tier_state(tier, state)
                .map_err(anyhow::Error::from)?;
            checkpoint_store::save(checkpoint, path)?;
            debug!(tier = %tier, state = %state, "tier state");
        }
        Ok(halt_reached(until, checkpoint.tier_state(tier).unwrap_or(state)))
    }

    fn fail_tier(&self, checkpoint: &mut Checkpoint, path: &Path, tier: TierId) -> Result<TierOutcome, EngineError> {
        checkpoint.reset_tier_state(tier, TierState::Failed);
        checkpoint_store::save(checkpoint, path)?;
        Ok(TierOutcome::Failed)
    }

    fn resolved_resources(
        &self,
        baseline: Option<&ResourceSpec>,
        tier: TierId,
        subtest: &str,
    ) -> Result<ResourceSpec, EngineError> {
        let own = self
            .collaborators
            .resources
            .resources(tier, subtest)
            .with_context(|| format!("resources for {tier}/{subtest}"))?;
        Ok(match baseline {
            Some(baseline) => baseline.clone().merged(&own),
            None => own,
        })
    }

    #[instrument(skip_all, fields(tier = %tier))]
    fn run_tier(
        &self,
        checkpoint: &mut Checkpoint,
        path: &Path,
        config: &ExperimentConfig,
        tier: TierId,
    ) -> Result<TierOutcome, EngineError> {
        let until = config.overrides.until_tier;
        let experiment_dir = checkpoint.experiment_dir.clone();
        checkpoint.register_tier(tier);
        if halt_reached(until, checkpoint.tier_state(tier).unwrap_or(TierState::Pending)) {
            return Ok(TierOutcome::Halted);
        }

        let loaded = checkpoint
            .tier_state(tier)
            .is_some_and(|state| state.is_at_or_past(TierState::ConfigLoaded));
        if !loaded {
            let mut subtests = self
                .collaborators
                .resources
                .list_subtests(tier)
                .with_context(|| format!("list subtests for {tier}"))?;
            if let Some(max) = config.overrides.max_subtests {
                subtests.truncate(max);
            }
            for subtest in &subtests {
                checkpoint.register_subtest(tier, subtest);
                for run in 1..=config.execution.runs_per_subtest {
                    checkpoint.register_run(tier, subtest, run);
                }
            }
            info!(subtests = subtests.len(), "subtests loaded");
        }
        if self.step_tier(checkpoint, path, tier, TierState::ConfigLoaded, until)? {
            return Ok(TierOutcome::Halted);
        }
        if checkpoint.subtests(tier).is_empty() {
            error!("tier has no subtests");
            return self.fail_tier(checkpoint, path, tier);
        }
        if self.step_tier(checkpoint, path, tier, TierState::SubtestsRunning, until)? {
            return Ok(TierOutcome::Halted);
        }

        let running = !checkpoint
            .tier_state(tier)
            .is_some_and(|state| state.is_at_or_past(TierState::SubtestsComplete));
        if running {
            let baseline = build_baseline(&experiment_dir, tier)?;
            let mut plans = Vec::new();
            for subtest in checkpoint.subtests(tier) {
                let aggregated =
                    checkpoint.subtest_state(tier, &subtest) == Some(SubtestState::Aggregated);
                if aggregated && !checkpoint.subtest_has_incomplete_runs(tier, &subtest) {
                    continue;
                }
                let resources = self.resolved_resources(baseline.as_ref(), tier, &subtest)?;
                plans.push(SubtestPlan::from_checkpoint(
                    checkpoint,
                    tier,
                    &subtest,
                    resources,
                    config.execution.runs_per_subtest,
                ));
            }
            checkpoint_store::save(checkpoint, path)?;

            let ctx = WorkerContext {
                config,
                experiment_dir: &experiment_dir,
                agent: self.collaborators.agent,
                judge: self.collaborators.judge,
                shutdown: &self.shutdown,
                coordinator: None,
            };
            let reports = ParallelSubtestExecutor::new(ctx, path).execute(checkpoint, tier, plans)?;

            let status = |wanted: fn(&SubtestStatus) -> bool| {
                reports.iter().any(|report| wanted(&report.status))
            };
            if self.shutdown.is_requested() || status(|s| matches!(s, SubtestStatus::Interrupted)) {
                return Ok(TierOutcome::Interrupted);
            }
            if status(|s| matches!(s, SubtestStatus::Failed(_))) {
                warn!("tier failed: one or more subtests failed");
                return self.fail_tier(checkpoint, path, tier);
            }
            if status(|s| matches!(s, SubtestStatus::Halted)) {
                return Ok(TierOutcome::Halted);
            }
            let unfinished: Vec<String> = checkpoint
                .subtests(tier)
                .into_iter()
                .filter(|subtest| {
                    checkpoint.subtest_state(tier, subtest) != Some(SubtestState::Aggregated)
                })
                .collect();
            if !unfinished.is_empty() {
                error!(subtests = ?unfinished, "subtests not aggregated");
                return self.fail_tier(checkpoint, path, tier);
            }
        }
        if self.step_tier(checkpoint, path, tier, TierState::SubtestsComplete, until)? {
            return Ok(TierOutcome::Halted);
        }

        let summaries = load_summaries(checkpoint, tier)?;
        let selected = checkpoint
            .tier_state(tier)
            .is_some_and(|state| state.is_at_or_past(TierState::BestSelected));
        if !selected {
            let Some(selection) = select_best_subtest(&summaries, config.execution.tie_epsilon) else {
                error!("no subtest summaries to select from");
                return self.fail_tier(checkpoint, path, tier);
            };
            let baseline = build_baseline(&experiment_dir, tier)?;
            let resources = self.resolved_resources(baseline.as_ref(), tier, &selection.subtest)?;
            let summary = summaries
                .iter()
                .find(|summary| summary.subtest == selection.subtest)
                .cloned()
                .unwrap_or_default();
            write_best_subtest(
                &experiment_dir,
                &BestSubtestRecord {
                    baseline: TierBaseline {
                        tier,
                        subtest: selection.subtest.clone(),
                        resources,
                    },
                    tie_breaker: selection.tie_breaker,
                    summary,
                },
            )?;
            info!(
                subtest = %selection.subtest,
                tie_breaker = ?selection.tie_breaker,
                "best subtest selected"
            );
        }
        if self.step_tier(checkpoint, path, tier, TierState::BestSelected, until)? {
            return Ok(TierOutcome::Halted);
        }

        let reported = checkpoint
            .tier_state(tier)
            .is_some_and(|state| state.is_at_or_past(TierState::ReportsGenerated));
        if !reported {
            let record = load_best_subtest(&experiment_dir, tier)?;
            let selection = Selection {
                subtest: record.baseline.subtest,
                tie_breaker: record.tie_breaker,
            };
            let result = TierResult::new(tier, &selection, summaries)
                .ok_or_else(|| anyhow!("best subtest {} has no summary", selection.subtest))?;
            write_json(&tier_dir(&experiment_dir, tier).join(TIER_RESULT_FILE), &result)?;
        }
        if self.step_tier(checkpoint, path, tier, TierState::ReportsGenerated, until)? {
            return Ok(TierOutcome::Halted);
        }
        self.step_tier(checkpoint, path, tier, TierState::Complete, until)?;
        info!("tier complete");
        Ok(TierOutcome::Complete)
    }
}

/// A dependency belonging to this experiment has not settled yet.
fn waiting_on_dependencies(checkpoint: &Checkpoint, tier: TierId) -> bool {
    !is_schedulable(checkpoint, tier)
        && tier.dependencies().iter().any(|dependency| {
            checkpoint.config.experiment.tiers.contains(dependency)
                && !checkpoint.tier_is_settled(*dependency)
        })
}

fn load_summaries(checkpoint: &Checkpoint, tier: TierId) -> anyhow::Result<Vec<SubtestSummary>> {
    checkpoint
        .subtests(tier)
        .iter()
        .map(|subtest| {
            read_json(&subtest_dir(&checkpoint.experiment_dir, tier, subtest).join(SUBTEST_RESULT_FILE))
        })
        .collect()
}

fn write_summary(checkpoint: &Checkpoint, config: &ExperimentConfig) -> anyhow::Result<()> {
    let mut results = Vec::new();
    for tier in execution_order(&config.experiment.tiers) {
        if checkpoint.tier_state(tier) != Some(TierState::Complete) {
            continue;
        }
        let result: TierResult =
            read_json(&tier_dir(&checkpoint.experiment_dir, tier).join(TIER_RESULT_FILE))?;
        results.push(result);
    }
    let summary = ExperimentSummary::new(&checkpoint.experiment_id, &results);
    write_json(&checkpoint.experiment_dir.join(SUMMARY_FILE), &summary)?;
    info!(
        tiers = summary.tiers.len(),
        frontier_cost_of_pass = ?summary.frontier_cost_of_pass,
        "summary written"
    );
    Ok(())
}
