//! Per-subtest worker: drives each run through the pipeline and aggregates.
//!
//! Workers never touch the checkpoint. Every state change is emitted through a
//! [`ProgressSink`]; the pool owner (or the inline sink) applies and persists it.

use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::sync::mpsc::Sender;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{RateLimitCoordinator, ShutdownToken};
use crate::core::checkpoint::{Checkpoint, ProgressEvent, RateLimitWindow};
use crate::core::resources::ResourceSpec;
use crate::core::selection::{SubtestSummary, summarize_subtest};
use crate::core::states::{Lifecycle, Recorded, RunState, SubtestState, halt_reached};
use crate::core::tier::TierId;
use crate::core::types::{
    AgentOutput, FailureReason, Judgment, RunResult, SubtestFailure, SubtestReport, SubtestStatus,
};
use crate::error::{AdapterError, WorkerError};
use crate::io::agent::{AgentAdapter, AgentRequest};
use crate::io::artifacts::{
    RunPaths, SUBTEST_RESULT_FILE, copy_dir_recursive, read_json, subtest_dir, write_json,
};
use crate::io::checkpoint_store;
use crate::io::config::ExperimentConfig;
use crate::io::judge::{JudgeAdapter, JudgeRequest};

/// Everything a worker needs, shared read-only across the pool.
#[derive(Clone, Copy)]
pub struct WorkerContext<'a> {
    pub config: &'a ExperimentConfig,
    pub experiment_dir: &'a Path,
    pub agent: &'a dyn AgentAdapter,
    pub judge: &'a dyn JudgeAdapter,
    pub shutdown: &'a ShutdownToken,
    /// `None` when the subtest runs inline on the calling thread.
    pub coordinator: Option<&'a RateLimitCoordinator>,
}

impl<'a> WorkerContext<'a> {
    pub fn with_coordinator(self, coordinator: &'a RateLimitCoordinator) -> Self {
        Self {
            coordinator: Some(coordinator),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRun {
    pub number: u32,
    pub state: Recorded<RunState>,
}

/// One unit of pool work.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtestPlan {
    pub tier: TierId,
    pub subtest: String,
    pub state: SubtestState,
    /// Fully resolved resources (baseline merged with the subtest's own).
    pub resources: ResourceSpec,
    pub runs: Vec<PlannedRun>,
}

impl SubtestPlan {
    /// Build a plan from the recorded states, registering missing runs.
    pub fn from_checkpoint(
        checkpoint: &mut Checkpoint,
        tier: TierId,
        subtest: &str,
        resources: ResourceSpec,
        runs_per_subtest: u32,
    ) -> Self {
        checkpoint.register_subtest(tier, subtest);
        let runs = (1..=runs_per_subtest)
            .map(|number| {
                checkpoint.register_run(tier, subtest, number);
                let state = checkpoint
                    .run_state(tier, subtest, number)
                    .cloned()
                    .unwrap_or(Recorded::Known(RunState::Pending));
                PlannedRun { number, state }
            })
            .collect();
        Self {
            tier,
            subtest: subtest.to_string(),
            state: checkpoint
                .subtest_state(tier, subtest)
                .unwrap_or(SubtestState::Pending),
            resources,
            runs,
        }
    }

    /// Re-read run and subtest states (used before retrying after a pool crash).
    pub fn refresh(&mut self, checkpoint: &Checkpoint) {
        for run in &mut self.runs {
            if let Some(state) = checkpoint.run_state(self.tier, &self.subtest, run.number) {
                run.state = state.clone();
            }
        }
        if let Some(state) = checkpoint.subtest_state(self.tier, &self.subtest) {
            self.state = state;
        }
    }
}

/// Receiver of worker progress.
pub trait ProgressSink {
    fn emit(&self, event: ProgressEvent) -> Result<()>;
}

/// Messages from pool workers to the pool owner.
#[derive(Debug)]
pub enum WorkerMessage {
    Progress(ProgressEvent),
    Report(SubtestReport),
}

impl ProgressSink for Sender<WorkerMessage> {
    fn emit(&self, event: ProgressEvent) -> Result<()> {
        self.send(WorkerMessage::Progress(event))
            .map_err(|_| anyhow!("progress channel closed"))
    }
}

/// Applies and persists events directly; used when no pool is involved.
pub struct CheckpointSink<'a> {
    checkpoint: RefCell<&'a mut Checkpoint>,
    path: &'a Path,
}

impl<'a> CheckpointSink<'a> {
    pub fn new(checkpoint: &'a mut Checkpoint, path: &'a Path) -> Self {
        Self {
            checkpoint: RefCell::new(checkpoint),
            path,
        }
    }
}

impl ProgressSink for CheckpointSink<'_> {
    fn emit(&self, event: ProgressEvent) -> Result<()> {
        let mut checkpoint = self.checkpoint.borrow_mut();
        checkpoint.apply(&event)?;
        checkpoint_store::save(&mut **checkpoint, self.path)?;
        Ok(())
    }
}

/// How a worker finished without error.
#[derive(Debug, Clone, PartialEq)]
pub enum SubtestCompletion {
    Aggregated(SubtestSummary),
    /// Every unfinished run reached the `until` target.
    Halted,
}

/// Fold a worker result into the structured report the pool hands back.
pub fn into_report(
    tier: TierId,
    subtest: &str,
    result: Result<SubtestCompletion, WorkerError>,
) -> SubtestReport {
    let status = match result {
        Ok(SubtestCompletion::Aggregated(summary)) => SubtestStatus::Aggregated(summary),
        Ok(SubtestCompletion::Halted) => SubtestStatus::Halted,
        Err(WorkerError::Interrupted) => SubtestStatus::Interrupted,
        Err(WorkerError::RateLimited { info, waits }) => SubtestStatus::Failed(SubtestFailure {
            reason: FailureReason::RateLimited,
            message: format!("rate limit persisted after {waits} waits: {}", info.message),
            rate_limit: Some(info),
        }),
        Err(WorkerError::Failed(err)) => SubtestStatus::Failed(SubtestFailure {
            reason: FailureReason::Error,
            message: format!("{err:#}"),
            rate_limit: None,
        }),
    };
    SubtestReport {
        tier,
        subtest: subtest.to_string(),
        status,
    }
}

enum RunProgress {
    Cleaned,
    Halted,
}

/// Run every unfinished run of `plan`, then aggregate.
#[instrument(skip_all, fields(tier = %plan.tier, subtest = %plan.subtest))]
pub fn run_subtest(
    ctx: &WorkerContext<'_>,
    plan: &SubtestPlan,
    sink: &dyn ProgressSink,
) -> Result<SubtestCompletion, WorkerError> {
    if ctx.shutdown.is_requested() {
        return Err(WorkerError::Interrupted);
    }
    if !plan.state.is_at_or_past(SubtestState::RunsInProgress) {
        emit_subtest(sink, plan, SubtestState::RunsInProgress)?;
    }

    let until = ctx.config.overrides.until_run;
    let mut halted = false;
    let mut cleaned: Vec<u32> = Vec::new();
    for run in &plan.runs {
        if run.state.is_success() {
            cleaned.push(run.number);
            continue;
        }
        if run.state.is_terminal() {
            debug!(run = run.number, state = %run.state, "skipping terminal run");
            continue;
        }
        if let Some(coordinator) = ctx.coordinator
            && !coordinator.check_if_paused()
        {
            return Err(WorkerError::Interrupted);
        }
        if ctx.shutdown.is_requested() {
            return Err(WorkerError::Interrupted);
        }
        match run_single(ctx, plan, run, until, sink) {
            Ok(RunProgress::Cleaned) => cleaned.push(run.number),
            Ok(RunProgress::Halted) => halted = true,
            Err(WorkerError::Interrupted) => {
                emit_run(sink, plan, run.number, RunState::Interrupted)?;
                return Err(WorkerError::Interrupted);
            }
            Err(err) => {
                if matches!(err, WorkerError::Failed(_)) {
                    emit_run(sink, plan, run.number, RunState::Failed)?;
                }
                return Err(err);
            }
        }
    }
    if halted {
        info!("runs halted at until target");
        return Ok(SubtestCompletion::Halted);
    }

    if !plan.state.is_at_or_past(SubtestState::RunsComplete) {
        emit_subtest(sink, plan, SubtestState::RunsComplete)?;
    }
    let summary = aggregate(ctx.experiment_dir, plan, &cleaned)?;
    emit_subtest(sink, plan, SubtestState::Aggregated)?;
    info!(
        passed = summary.passed,
        runs = summary.runs,
        pass_rate = summary.pass_rate,
        "subtest aggregated"
    );
    Ok(SubtestCompletion::Aggregated(summary))
}

fn aggregate(experiment_dir: &Path, plan: &SubtestPlan, cleaned: &[u32]) -> Result<SubtestSummary> {
    let mut results = Vec::with_capacity(cleaned.len());
    for run in cleaned {
        let paths = RunPaths::new(experiment_dir, plan.tier, &plan.subtest, *run);
        let result: RunResult = read_json(&paths.run_result)?;
        results.push(result);
    }
    let summary = summarize_subtest(&plan.subtest, &results);
    write_json(
        &subtest_dir(experiment_dir, plan.tier, &plan.subtest).join(SUBTEST_RESULT_FILE),
        &summary,
    )?;
    Ok(summary)
}

fn emit_subtest(sink: &dyn ProgressSink, plan: &SubtestPlan, state: SubtestState) -> Result<()> {
    sink.emit(ProgressEvent::SubtestState {
        tier: plan.tier,
        subtest: plan.subtest.clone(),
        state,
    })
}

fn emit_run(sink: &dyn ProgressSink, plan: &SubtestPlan, run: u32, state: RunState) -> Result<()> {
    sink.emit(ProgressEvent::RunState {
        tier: plan.tier,
        subtest: plan.subtest.clone(),
        run,
        state,
    })
}

#[instrument(skip_all, fields(run = run.number))]
fn run_single(
    ctx: &WorkerContext<'_>,
    plan: &SubtestPlan,
    run: &PlannedRun,
    until: Option<RunState>,
    sink: &dyn ProgressSink,
) -> Result<RunProgress, WorkerError> {
    let paths = RunPaths::new(ctx.experiment_dir, plan.tier, &plan.subtest, run.number);
    let mut state = match &run.state {
        Recorded::Known(state) if !state.is_side_branch() => *state,
        other => {
            debug!(state = %other, "restarting run from pending");
            sink.emit(ProgressEvent::RunRestored {
                tier: plan.tier,
                subtest: plan.subtest.clone(),
                run: run.number,
                state: RunState::Pending,
            })?;
            RunState::Pending
        }
    };
    if halt_reached(until, state) {
        return Ok(RunProgress::Halted);
    }
    restore_workspace(ctx, plan, &paths, state)?;

    while let Some(next) = state.successor() {
        match next {
            RunState::DirStructureCreated => {
                for dir in [&paths.root, &paths.agent_dir, &paths.judge_dir] {
                    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
                }
            }
            RunState::WorktreeCreated => create_workspace(ctx, &paths)?,
            RunState::ConfigCommitted => write_json(&paths.resources(), &plan.resources)?,
            RunState::PromptWritten => {
                let prompt = compose_prompt(&ctx.config.experiment.task_prompt, &plan.resources);
                fs::write(&paths.prompt, prompt)
                    .with_context(|| format!("write {}", paths.prompt.display()))?;
            }
            RunState::AgentComplete => {
                let output = run_agent(ctx, plan, run.number, &paths, state, sink)?;
                write_json(&paths.agent_result(), &output)?;
            }
            RunState::JudgePipelineRun => {
                let agent: AgentOutput = read_json(&paths.agent_result())?;
                if agent.succeeded() {
                    let judgment = run_judge(ctx, plan, run.number, &paths, &agent, state, sink)?;
                    write_json(&paths.judge_result(), &judgment)?;
                } else {
                    debug!(exit_code = agent.exit_code, "agent failed, judge skipped");
                }
            }
            RunState::RunFinalized => {
                let agent: AgentOutput = read_json(&paths.agent_result())?;
                let judgment: Option<Judgment> = if agent.succeeded() {
                    Some(read_json(&paths.judge_result())?)
                } else {
                    None
                };
                let result = RunResult {
                    tier: plan.tier,
                    subtest: plan.subtest.clone(),
                    run: run.number,
                    agent,
                    judgment,
                    finished_at: chrono::Utc::now(),
                };
                write_json(&paths.run_result, &result)?;
            }
            RunState::WorktreeCleaned => {
                if !ctx.config.experiment.keep_workspaces && paths.workspace.exists() {
                    fs::remove_dir_all(&paths.workspace)
                        .with_context(|| format!("remove {}", paths.workspace.display()))?;
                }
                let result: RunResult = read_json(&paths.run_result)?;
                sink.emit(ProgressEvent::RunCompleted {
                    tier: plan.tier,
                    subtest: plan.subtest.clone(),
                    run: run.number,
                    outcome: result.outcome(),
                })?;
                debug!(outcome = %result.outcome(), "run complete");
                return Ok(RunProgress::Cleaned);
            }
            other => return Err(anyhow!("unexpected forward run state {other}").into()),
        }
        emit_run(sink, plan, run.number, next)?;
        state = next;
        if halt_reached(until, state) {
            return Ok(RunProgress::Halted);
        }
    }
    Ok(RunProgress::Cleaned)
}

fn create_workspace(ctx: &WorkerContext<'_>, paths: &RunPaths) -> Result<()> {
    if paths.workspace.exists() {
        fs::remove_dir_all(&paths.workspace)
            .with_context(|| format!("remove stale {}", paths.workspace.display()))?;
    }
    match &ctx.config.experiment.workspace_template {
        Some(template) => copy_dir_recursive(template, &paths.workspace),
        None => fs::create_dir_all(&paths.workspace)
            .with_context(|| format!("create {}", paths.workspace.display())),
    }
}

/// Rebuild a workspace that the remaining steps need but an earlier pass
/// already cleaned up (a replay of `agent_complete` or `judge_pipeline_run`).
fn restore_workspace(
    ctx: &WorkerContext<'_>,
    plan: &SubtestPlan,
    paths: &RunPaths,
    state: RunState,
) -> Result<()> {
    let needs_workspace = state.is_at_or_past(RunState::WorktreeCreated)
        && !state.is_at_or_past(RunState::JudgePipelineRun);
    if !needs_workspace || paths.workspace.exists() {
        return Ok(());
    }
    info!(state = %state, "recreating cleaned workspace");
    create_workspace(ctx, paths)?;
    if state.is_at_or_past(RunState::ConfigCommitted) {
        write_json(&paths.resources(), &plan.resources)?;
    }
    Ok(())
}

/// Task prompt followed by the resolved prompt blocks.
pub fn compose_prompt(task_prompt: &str, resources: &ResourceSpec) -> String {
    let mut prompt = task_prompt.trim().to_string();
    for block in &resources.prompt_blocks {
        prompt.push_str("\n\n");
        prompt.push_str(block.trim());
    }
    prompt.push('\n');
    prompt
}

fn run_agent(
    ctx: &WorkerContext<'_>,
    plan: &SubtestPlan,
    run: u32,
    paths: &RunPaths,
    state: RunState,
    sink: &dyn ProgressSink,
) -> Result<AgentOutput, WorkerError> {
    let prompt = fs::read_to_string(&paths.prompt)
        .with_context(|| format!("read {}", paths.prompt.display()))?;
    let request = AgentRequest {
        workspace: paths.workspace.clone(),
        model: plan
            .resources
            .model
            .clone()
            .unwrap_or_else(|| ctx.config.execution.model.clone()),
        prompt,
        log_dir: paths.agent_dir.clone(),
    };
    with_rate_limits(ctx, plan, run, state, sink, "agent", || ctx.agent.run(&request))
}

fn run_judge(
    ctx: &WorkerContext<'_>,
    plan: &SubtestPlan,
    run: u32,
    paths: &RunPaths,
    agent: &AgentOutput,
    state: RunState,
    sink: &dyn ProgressSink,
) -> Result<Judgment, WorkerError> {
    let request = JudgeRequest {
        workspace: paths.workspace.clone(),
        task_prompt: ctx.config.experiment.task_prompt.clone(),
        agent_output: agent.output.clone(),
        model: ctx.config.execution.judge_model.clone(),
        log_dir: paths.judge_dir.clone(),
    };
    with_rate_limits(ctx, plan, run, state, sink, "judge", || ctx.judge.judge(&request))
}

/// Call a collaborator, waiting out rate limits and retrying plain failures.
///
/// With a coordinator the wait is global (every worker pauses) and the pool
/// owner records the window. Inline, the window is emitted through `sink`
/// around a local sleep. Either way the run is recorded as `rate_limited` for
/// the duration and restored to `state` afterwards.
fn with_rate_limits<T>(
    ctx: &WorkerContext<'_>,
    plan: &SubtestPlan,
    run: u32,
    state: RunState,
    sink: &dyn ProgressSink,
    label: &str,
    mut call: impl FnMut() -> Result<T, AdapterError>,
) -> Result<T, WorkerError> {
    let limits = &ctx.config.rate_limit;
    let poll = std::time::Duration::from_millis(limits.poll_interval_ms);
    let mut waits = 0u32;
    let mut failures = 0u32;
    loop {
        if let Some(coordinator) = ctx.coordinator
            && !coordinator.check_if_paused()
        {
            return Err(WorkerError::Interrupted);
        }
        match call() {
            Ok(value) => return Ok(value),
            Err(AdapterError::RateLimited(info)) => {
                if waits >= limits.max_waits {
                    warn!(label, waits, "rate limit wait budget exhausted");
                    return Err(WorkerError::RateLimited { info, waits });
                }
                waits += 1;
                emit_run(sink, plan, run, RunState::RateLimited)?;
                match ctx.coordinator {
                    Some(coordinator) => {
                        coordinator.signal_rate_limit(info);
                        if !coordinator.check_if_paused() {
                            return Err(WorkerError::Interrupted);
                        }
                    }
                    None => {
                        let wait = info.wait_duration(
                            limits.default_retry_after_secs,
                            limits.buffer_fraction,
                        );
                        let window = RateLimitWindow::starting_now(info, wait);
                        info!(
                            label,
                            wait_secs = wait.as_secs_f64(),
                            resume_at = %window.resume_at,
                            "rate limit pause"
                        );
                        sink.emit(ProgressEvent::RateLimitWindow(Some(window)))?;
                        if !ctx.shutdown.sleep(wait, poll) {
                            return Err(WorkerError::Interrupted);
                        }
                        sink.emit(ProgressEvent::RateLimitWindow(None))?;
                    }
                }
                sink.emit(ProgressEvent::RunRestored {
                    tier: plan.tier,
                    subtest: plan.subtest.clone(),
                    run,
                    state,
                })?;
            }
            Err(AdapterError::Failed(err)) => {
                failures += 1;
                if failures > ctx.config.execution.run_retries {
                    return Err(WorkerError::Failed(
                        err.context(format!("{label} failed after {failures} attempt(s)")),
                    ));
                }
                let message = format!("{err:#}");
                warn!(label, attempt = failures, err = %message, "retrying after failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{AgentStep, ScriptedAgent, ScriptedJudge, checkpoint, temp_experiment};

    #[derive(Default)]
    struct Recording(RefCell<Vec<ProgressEvent>>);

    impl ProgressSink for Recording {
        fn emit(&self, event: ProgressEvent) -> Result<()> {
            self.0.borrow_mut().push(event);
            Ok(())
        }
    }

    fn single_run_plan(checkpoint: &mut Checkpoint) -> SubtestPlan {
        SubtestPlan::from_checkpoint(checkpoint, TierId::T0, "00-a", ResourceSpec::default(), 1)
    }

    #[test]
    fn inline_rate_limit_pause_opens_and_closes_a_window() {
        let (_temp, config) = temp_experiment(&[TierId::T0]).expect("temp experiment");
        let experiment_dir = config.experiment_dir();
        let plan = single_run_plan(&mut checkpoint(&config));
        let agent = ScriptedAgent::new().on("00-a", [AgentStep::RateLimit(Some(0.0))]);
        let judge = ScriptedJudge::new();
        let shutdown = ShutdownToken::new();
        let ctx = WorkerContext {
            config: &config,
            experiment_dir: &experiment_dir,
            agent: &agent,
            judge: &judge,
            shutdown: &shutdown,
            coordinator: None,
        };
        let sink = Recording::default();

        let completion = run_subtest(&ctx, &plan, &sink).expect("run subtest");

        assert!(matches!(completion, SubtestCompletion::Aggregated(_)));
        assert_eq!(agent.calls(), 2);
        let events = sink.0.into_inner();
        let position = |wanted: fn(&ProgressEvent) -> bool| {
            events.iter().position(wanted).expect("event emitted")
        };
        let limited = position(|event| {
            matches!(event, ProgressEvent::RunState { state: RunState::RateLimited, .. })
        });
        let opened = position(|event| matches!(event, ProgressEvent::RateLimitWindow(Some(_))));
        let closed = position(|event| matches!(event, ProgressEvent::RateLimitWindow(None)));
        let restored = position(|event| {
            matches!(event, ProgressEvent::RunRestored { state: RunState::PromptWritten, .. })
        });
        assert!(limited < opened && opened < closed && closed < restored);
    }

    #[test]
    fn interrupted_inline_pause_keeps_the_window_on_disk() {
        let (_temp, config) = temp_experiment(&[TierId::T0]).expect("temp experiment");
        let experiment_dir = config.experiment_dir();
        fs::create_dir_all(&experiment_dir).expect("experiment dir");
        let path = checkpoint_store::checkpoint_path(&experiment_dir);
        let mut checkpoint = checkpoint(&config);
        let plan = single_run_plan(&mut checkpoint);
        let shutdown = ShutdownToken::new();
        let agent = ScriptedAgent::new()
            .on("00-a", [AgentStep::RateLimit(Some(60.0))])
            .request_shutdown_on(1, shutdown.clone());
        let judge = ScriptedJudge::new();
        let ctx = WorkerContext {
            config: &config,
            experiment_dir: &experiment_dir,
            agent: &agent,
            judge: &judge,
            shutdown: &shutdown,
            coordinator: None,
        };

        let result = {
            let sink = CheckpointSink::new(&mut checkpoint, &path);
            run_subtest(&ctx, &plan, &sink)
        };

        assert!(matches!(result, Err(WorkerError::Interrupted)));
        let saved = checkpoint_store::load(&path).expect("saved checkpoint");
        let window = saved.rate_limit.as_ref().expect("window persisted");
        assert_eq!(window.info.retry_after_secs, Some(60.0));
        assert!(window.resume_at > chrono::Utc::now() + chrono::Duration::seconds(30));
        assert!(
            saved
                .run_state(TierId::T0, "00-a", 1)
                .expect("run state")
                .is(RunState::Interrupted)
        );
    }

    #[test]
    fn replay_rebuilds_a_cleaned_workspace() {
        let (_temp, mut config) = temp_experiment(&[TierId::T0]).expect("temp experiment");
        config.execution.runs_per_subtest = 1;
        let experiment_dir = config.experiment_dir();
        let mut checkpoint = checkpoint(&config);
        let resources = ResourceSpec {
            tools: vec!["linter".to_string()],
            ..ResourceSpec::default()
        };
        let mut plan =
            SubtestPlan::from_checkpoint(&mut checkpoint, TierId::T0, "00-a", resources, 1);
        let agent = ScriptedAgent::new();
        let judge = ScriptedJudge::new();
        let shutdown = ShutdownToken::new();
        let ctx = WorkerContext {
            config: &config,
            experiment_dir: &experiment_dir,
            agent: &agent,
            judge: &judge,
            shutdown: &shutdown,
            coordinator: None,
        };
        run_subtest(&ctx, &plan, &Recording::default()).expect("first pass");
        let paths = RunPaths::new(&experiment_dir, TierId::T0, "00-a", 1);
        assert!(!paths.workspace.exists());

        let mut kept = config.clone();
        kept.experiment.keep_workspaces = true;
        let ctx = WorkerContext {
            config: &kept,
            ..ctx
        };
        plan.state = SubtestState::RunsInProgress;
        plan.runs[0].state = Recorded::Known(RunState::PromptWritten);
        run_subtest(&ctx, &plan, &Recording::default()).expect("replay");

        assert_eq!(agent.calls(), 2);
        assert_eq!(judge.calls(), 2);
        assert!(paths.workspace.is_dir());
        let committed: ResourceSpec = read_json(&paths.resources()).expect("resources.json");
        assert_eq!(committed.tools, vec!["linter".to_string()]);
    }

    #[test]
    fn prompt_appends_blocks() {
        let resources = ResourceSpec {
            prompt_blocks: vec!["Use tools.".to_string(), " Be brief. ".to_string()],
            ..ResourceSpec::default()
        };
        assert_eq!(
            compose_prompt("Fix it.\n", &resources),
            "Fix it.\n\nUse tools.\n\nBe brief.\n"
        );
        assert_eq!(compose_prompt("Fix it.", &ResourceSpec::default()), "Fix it.\n");
    }

    #[test]
    fn worker_errors_map_to_reasons() {
        let report = into_report(
            TierId::T0,
            "01-a",
            Err(WorkerError::Failed(anyhow!("disk full"))),
        );
        assert_eq!(report.failure_reason(), Some(FailureReason::Error));
        assert!(report.rate_limit().is_none());

        let info = crate::core::rate_limit::RateLimitInfo::new(
            crate::core::rate_limit::RateLimitSource::Agent,
            None,
            "429",
        );
        let report = into_report(
            TierId::T0,
            "01-a",
            Err(WorkerError::RateLimited { info, waits: 5 }),
        );
        assert_eq!(report.failure_reason(), Some(FailureReason::RateLimited));
        assert!(report.rate_limit().is_some());

        let report = into_report(TierId::T0, "01-a", Err(WorkerError::Interrupted));
        assert_eq!(report.status, SubtestStatus::Interrupted);
    }
}
