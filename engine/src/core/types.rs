//! Shared value types exchanged between the run pipeline, the worker pool and
//! the persisted artifacts.
//!
//! These are plain data: no I/O, stable serde shapes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::rate_limit::RateLimitInfo;
use crate::core::selection::SubtestSummary;
use crate::core::tier::TierId;

/// Outcome recorded in the completed-run index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    Failed,
    /// The agent exited non-zero; the judge was skipped.
    AgentFailed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Passed => "passed",
            RunOutcome::Failed => "failed",
            RunOutcome::AgentFailed => "agent_failed",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = crate::error::StateParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "passed" => Ok(RunOutcome::Passed),
            "failed" => Ok(RunOutcome::Failed),
            "agent_failed" => Ok(RunOutcome::AgentFailed),
            other => Err(crate::error::StateParseError::new("run outcome", other)),
        }
    }
}

/// Telemetry and raw output from one agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentOutput {
    pub exit_code: i32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_secs: f64,
    pub output: String,
}

impl AgentOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Verdict from the judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Judgment {
    /// Normalized score in `[0, 1]`.
    pub score: f64,
    pub passed: bool,
    pub grade: String,
    pub criteria: BTreeMap<String, f64>,
}

/// Everything known about a finished run (`run_result.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub tier: TierId,
    pub subtest: String,
    pub run: u32,
    pub agent: AgentOutput,
    /// `None` when the judge was skipped because the agent failed.
    pub judgment: Option<Judgment>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn outcome(&self) -> RunOutcome {
        match &self.judgment {
            _ if !self.agent.succeeded() => RunOutcome::AgentFailed,
            Some(judgment) if judgment.passed => RunOutcome::Passed,
            _ => RunOutcome::Failed,
        }
    }

    pub fn score(&self) -> f64 {
        self.judgment.as_ref().map_or(0.0, |judgment| judgment.score)
    }
}

/// Why a subtest did not aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RateLimited,
    Error,
    PoolCrash,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::RateLimited => "rate_limited",
            FailureReason::Error => "error",
            FailureReason::PoolCrash => "pool_crash",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtestFailure {
    pub reason: FailureReason,
    pub message: String,
    pub rate_limit: Option<RateLimitInfo>,
}

/// Terminal status a worker reports for its subtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubtestStatus {
    Aggregated(SubtestSummary),
    /// Stopped cleanly at an `until` target.
    Halted,
    /// Cooperative shutdown observed; resumable.
    Interrupted,
    Failed(SubtestFailure),
}

/// Structured report sent from a worker to the pool owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtestReport {
    pub tier: TierId,
    pub subtest: String,
    #[serde(flatten)]
    pub status: SubtestStatus,
}

impl SubtestReport {
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.status {
            SubtestStatus::Failed(failure) => Some(failure.reason),
            _ => None,
        }
    }

    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        match &self.status {
            SubtestStatus::Failed(failure) => failure.rate_limit.as_ref(),
            _ => None,
        }
    }

    /// Status label for logs and tables (`aggregated`, `error`, ...).
    pub fn label(&self) -> String {
        match &self.status {
            SubtestStatus::Aggregated(_) => "aggregated".to_string(),
            SubtestStatus::Halted => "halted".to_string(),
            SubtestStatus::Interrupted => "interrupted".to_string(),
            SubtestStatus::Failed(failure) => failure.reason.to_string(),
        }
    }
}
