//! Worker pool that runs a tier's subtests concurrently.
//!
//! The calling thread owns the checkpoint. Workers pull plans from a shared
//! queue and report over a channel; the owner applies every event, saves, and
//! handles rate-limit pauses raised through the [`RateLimitCoordinator`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::coordinator::{RateLimitCoordinator, ShutdownToken};
use crate::core::checkpoint::{Checkpoint, RateLimitWindow};
use crate::core::rate_limit::{RateLimitInfo, RateLimitSource, detect_rate_limit};
use crate::core::states::SubtestState;
use crate::core::tier::TierId;
use crate::core::types::{FailureReason, SubtestFailure, SubtestReport, SubtestStatus};
use crate::error::ExecutorError;
use crate::io::artifacts::RunPaths;
use crate::io::checkpoint_store;
use crate::subtest::{
    CheckpointSink, SubtestPlan, WorkerContext, WorkerMessage, into_report, run_subtest,
};

struct Progress {
    completed: usize,
    total: usize,
}

struct PoolOutcome {
    reports: Vec<SubtestReport>,
    cancelled: Vec<String>,
    crashed_workers: usize,
}

pub struct ParallelSubtestExecutor<'a> {
    ctx: WorkerContext<'a>,
    checkpoint_path: &'a Path,
}

impl<'a> ParallelSubtestExecutor<'a> {
    pub fn new(ctx: WorkerContext<'a>, checkpoint_path: &'a Path) -> Self {
        Self {
            ctx,
            checkpoint_path,
        }
    }

    fn poll(&self) -> Duration {
        Duration::from_millis(self.ctx.config.rate_limit.poll_interval_ms)
    }

    /// Run `plans` and return one report per subtest that was not cancelled.
    ///
    /// A single plan runs inline on the calling thread with no coordinator.
    #[instrument(skip_all, fields(tier = %tier, subtests = plans.len()))]
    pub fn execute(
        &self,
        checkpoint: &mut Checkpoint,
        tier: TierId,
        plans: Vec<SubtestPlan>,
    ) -> Result<Vec<SubtestReport>, ExecutorError> {
        if plans.len() <= 1 {
            return match plans.into_iter().next() {
                Some(plan) => self.execute_inline(checkpoint, plan),
                None => Ok(Vec::new()),
            };
        }

        let limits = &self.ctx.config.rate_limit;
        let mut progress = Progress {
            completed: 0,
            total: plans.len(),
        };
        let mut reports = Vec::with_capacity(plans.len());
        let mut pending = plans;
        let mut attempts = 0u32;
        loop {
            let outcome = self.run_pool(checkpoint, tier, &pending, &mut progress)?;
            let settled: BTreeSet<&str> = outcome
                .reports
                .iter()
                .map(|report| report.subtest.as_str())
                .chain(outcome.cancelled.iter().map(String::as_str))
                .collect();
            let missing: Vec<SubtestPlan> = pending
                .iter()
                .filter(|plan| !settled.contains(plan.subtest.as_str()))
                .cloned()
                .collect();
            reports.extend(outcome.reports);
            if missing.is_empty() {
                return Ok(reports);
            }

            attempts += 1;
            let missing_ids: Vec<String> = missing.iter().map(|plan| plan.subtest.clone()).collect();
            let own_evidence: BTreeMap<String, RateLimitInfo> = missing
                .iter()
                .filter_map(|plan| {
                    scan_logs(self.ctx.experiment_dir, plan).map(|info| (plan.subtest.clone(), info))
                })
                .collect();
            let evidence = own_evidence
                .values()
                .next()
                .cloned()
                .or_else(|| reports.iter().find_map(|report| report.rate_limit().cloned()));
            let Some(info) = evidence else {
                error!(
                    crashed_workers = outcome.crashed_workers,
                    missing = ?missing_ids,
                    "worker pool crashed without rate-limit evidence"
                );
                return Err(ExecutorError::PoolCrashed {
                    tier,
                    missing: missing_ids,
                    attempts,
                });
            };

            if attempts > limits.max_pool_retries {
                warn!(attempts, missing = ?missing_ids, "pool retries exhausted; reporting partial results");
                for plan in &missing {
                    let (reason, rate_limit) = match own_evidence.get(&plan.subtest) {
                        Some(own) => (FailureReason::RateLimited, Some(own.clone())),
                        None => (FailureReason::PoolCrash, Some(info.clone())),
                    };
                    let report = SubtestReport {
                        tier,
                        subtest: plan.subtest.clone(),
                        status: SubtestStatus::Failed(SubtestFailure {
                            reason,
                            message: format!("worker pool crashed {attempts} time(s)"),
                            rate_limit,
                        }),
                    };
                    self.record_report(checkpoint, &report, &mut progress)?;
                    reports.push(report);
                }
                return Ok(reports);
            }

            warn!(
                attempt = attempts,
                max = limits.max_pool_retries,
                crashed_workers = outcome.crashed_workers,
                missing = ?missing_ids,
                "worker pool crashed after a rate limit; retrying missing subtests"
            );
            if !self.wait_out(checkpoint, &info)? {
                for plan in &missing {
                    reports.push(SubtestReport {
                        tier,
                        subtest: plan.subtest.clone(),
                        status: SubtestStatus::Interrupted,
                    });
                }
                return Ok(reports);
            }
            pending = missing
                .into_iter()
                .map(|mut plan| {
                    plan.refresh(checkpoint);
                    plan
                })
                .collect();
        }
    }

    fn execute_inline(
        &self,
        checkpoint: &mut Checkpoint,
        plan: SubtestPlan,
    ) -> Result<Vec<SubtestReport>, ExecutorError> {
        let ctx = WorkerContext {
            coordinator: None,
            ..self.ctx
        };
        let result = {
            let sink = CheckpointSink::new(checkpoint, self.checkpoint_path);
            run_subtest(&ctx, &plan, &sink)
        };
        let report = into_report(plan.tier, &plan.subtest, result);
        self.record_report(
            checkpoint,
            &report,
            &mut Progress {
                completed: 0,
                total: 1,
            },
        )?;
        Ok(vec![report])
    }

    fn run_pool(
        &self,
        checkpoint: &mut Checkpoint,
        tier: TierId,
        plans: &[SubtestPlan],
        progress: &mut Progress,
    ) -> Result<PoolOutcome, ExecutorError> {
        let pool_shutdown = ShutdownToken::new();
        let coordinator = RateLimitCoordinator::new(pool_shutdown.clone(), self.poll());
        let ctx = WorkerContext {
            shutdown: &pool_shutdown,
            ..self.ctx
        }
        .with_coordinator(&coordinator);
        let queue = Mutex::new(plans.iter().cloned().collect::<VecDeque<_>>());
        let workers = plans
            .len()
            .min(self.ctx.config.parallel.max_parallel_subtests)
            .max(1);
        let (tx, rx) = mpsc::channel();
        debug!(workers, subtests = plans.len(), "starting worker pool");

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for index in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let spawned = thread::Builder::new()
                    .name(format!("{tier}-worker-{index}"))
                    .spawn_scoped(scope, move || worker_loop(ctx, queue, &tx));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        coordinator.signal_shutdown();
                        return Err(ExecutorError::Spawn(err));
                    }
                }
            }
            drop(tx);

            let driven = self.drive(checkpoint, &coordinator, &rx, &queue, progress);
            if driven.is_err() {
                coordinator.signal_shutdown();
            }
            let crashed_workers = handles
                .into_iter()
                .map(thread::ScopedJoinHandle::join)
                .filter(Result::is_err)
                .count();
            if crashed_workers > 0 {
                warn!(crashed_workers, "worker threads died without finishing");
            }
            let (reports, cancelled) = driven?;
            Ok(PoolOutcome {
                reports,
                cancelled,
                crashed_workers,
            })
        })
    }

    /// Owner loop: persist progress, run pause/resume cycles, honor shutdown.
    fn drive(
        &self,
        checkpoint: &mut Checkpoint,
        coordinator: &RateLimitCoordinator,
        rx: &Receiver<WorkerMessage>,
        queue: &Mutex<VecDeque<SubtestPlan>>,
        progress: &mut Progress,
    ) -> Result<(Vec<SubtestReport>, Vec<String>), ExecutorError> {
        let mut reports = Vec::new();
        let mut cancelled = Vec::new();
        loop {
            match rx.recv_timeout(self.poll()) {
                Ok(WorkerMessage::Progress(event)) => {
                    if let Err(err) = checkpoint.apply(&event) {
                        warn!(%err, "progress event rejected");
                    }
                    checkpoint_store::save(checkpoint, self.checkpoint_path)?;
                }
                Ok(WorkerMessage::Report(report)) => {
                    self.record_report(checkpoint, &report, progress)?;
                    reports.push(report);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if let Some(info) = coordinator.take_rate_limit_info()
                && self.wait_out(checkpoint, &info)?
            {
                coordinator.resume_all_workers();
            }
            if self.ctx.shutdown.is_requested() && !coordinator.is_shutdown_requested() {
                info!("shutdown requested; cancelling queued subtests");
                coordinator.signal_shutdown();
                cancelled.extend(drain(queue));
            }
        }
        if coordinator.is_shutdown_requested() {
            cancelled.extend(drain(queue));
        }
        Ok((reports, cancelled))
    }

    fn record_report(
        &self,
        checkpoint: &mut Checkpoint,
        report: &SubtestReport,
        progress: &mut Progress,
    ) -> Result<(), ExecutorError> {
        if let SubtestStatus::Failed(failure) = &report.status {
            warn!(
                subtest = %report.subtest,
                reason = %failure.reason,
                message = %failure.message,
                "subtest failed"
            );
            checkpoint.reset_subtest_state(report.tier, &report.subtest, SubtestState::Failed);
        }
        checkpoint_store::save(checkpoint, self.checkpoint_path)?;
        progress.completed += 1;
        info!(
            subtest = %report.subtest,
            status = %report.label(),
            completed = progress.completed,
            total = progress.total,
            "subtest complete"
        );
        Ok(())
    }

    /// Persist the pause window and sleep through it. `false` if interrupted;
    /// the window is then left in the checkpoint for the next resume.
    fn wait_out(&self, checkpoint: &mut Checkpoint, info: &RateLimitInfo) -> Result<bool, ExecutorError> {
        let limits = &self.ctx.config.rate_limit;
        let wait = info.wait_duration(limits.default_retry_after_secs, limits.buffer_fraction);
        let window = RateLimitWindow::starting_now(info.clone(), wait);
        let resume_at = window.resume_at;
        checkpoint.rate_limit = Some(window);
        checkpoint_store::save(checkpoint, self.checkpoint_path)?;
        info!(
            source = %info.source,
            wait_secs = wait.as_secs_f64(),
            resume_at = %resume_at,
            "pausing workers for rate limit"
        );
        if !self.ctx.shutdown.sleep(wait, self.poll()) {
            info!("rate limit wait interrupted by shutdown");
            return Ok(false);
        }
        checkpoint.rate_limit = None;
        checkpoint_store::save(checkpoint, self.checkpoint_path)?;
        Ok(true)
    }
}

fn worker_loop(
    ctx: WorkerContext<'_>,
    queue: &Mutex<VecDeque<SubtestPlan>>,
    tx: &Sender<WorkerMessage>,
) {
    loop {
        if ctx.shutdown.is_requested() {
            break;
        }
        let next = queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        let Some(plan) = next else {
            break;
        };
        let result = run_subtest(&ctx, &plan, tx);
        let report = into_report(plan.tier, &plan.subtest, result);
        if tx.send(WorkerMessage::Report(report)).is_err() {
            break;
        }
    }
}

fn drain(queue: &Mutex<VecDeque<SubtestPlan>>) -> Vec<String> {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain(..)
        .map(|plan| plan.subtest)
        .collect()
}

/// Look for a rate-limit fingerprint in the logs a subtest's runs left behind.
fn scan_logs(experiment_dir: &Path, plan: &SubtestPlan) -> Option<RateLimitInfo> {
    plan.runs.iter().find_map(|run| {
        let paths = RunPaths::new(experiment_dir, plan.tier, &plan.subtest, run.number);
        paths.logs().iter().enumerate().find_map(|(index, path)| {
            let source = if index < 2 {
                RateLimitSource::Agent
            } else {
                RateLimitSource::Judge
            };
            let text = fs::read_to_string(path).ok()?;
            detect_rate_limit(source, &text)
        })
    })
}
