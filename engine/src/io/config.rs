//! Experiment configuration (TOML) and its execution fingerprint.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::replay::ResetFilter;
use crate::core::states::{ExperimentState, RunState, TierState};
use crate::core::tier::TierId;
use crate::core::types::RunOutcome;

/// Experiment configuration.
///
/// Missing sections fall back to defaults; `experiment.id` and
/// `experiment.task_prompt` are required by `validate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ExperimentConfig {
    pub experiment: ExperimentSection,
    pub execution: ExecutionConfig,
    pub parallel: ParallelConfig,
    pub rate_limit: RateLimitConfig,
    pub agent: CommandConfig,
    pub judge: CommandConfig,
    /// Per-invocation overrides; stored with the checkpoint, never hashed.
    pub overrides: RunOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExperimentSection {
    /// Slug `[a-z0-9_-]+`; names the experiment directory.
    pub id: String,
    pub task_prompt: String,
    pub tiers: Vec<TierId>,
    /// Resource fixtures: `<tiers_dir>/<tier>/<subtest>.toml`.
    pub tiers_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Copied into every run workspace when set.
    pub workspace_template: Option<PathBuf>,
    pub keep_workspaces: bool,
}

impl Default for ExperimentSection {
    fn default() -> Self {
        Self {
            id: String::new(),
            task_prompt: String::new(),
            tiers: TierId::ALL.to_vec(),
            tiers_dir: PathBuf::from("tiers"),
            results_dir: PathBuf::from("results"),
            workspace_template: None,
            keep_workspaces: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub model: String,
    pub judge_model: String,
    pub runs_per_subtest: u32,
    /// Extra agent attempts after a non-rate-limit adapter error.
    pub run_retries: u32,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub tie_epsilon: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            judge_model: "default".to_string(),
            runs_per_subtest: 3,
            run_retries: 1,
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
            tie_epsilon: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_parallel_subtests: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_parallel_subtests: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_retry_after_secs: u64,
    pub buffer_fraction: f64,
    /// Waits a single run may sit through before its subtest fails as rate limited.
    pub max_waits: u32,
    pub max_pool_retries: u32,
    pub poll_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_retry_after_secs: 60,
            buffer_fraction: 0.1,
            max_waits: 5,
            max_pool_retries: 3,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CommandConfig {
    /// argv of the process-backed adapter (e.g. `["claude", "-p"]`).
    pub command: Vec<String>,
}

/// Per-invocation replay controls and filters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RunOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until_run: Option<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until_tier: Option<TierState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until_experiment: Option<ExperimentState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_run: Option<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_tier: Option<TierState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_experiment: Option<ExperimentState>,
    pub filter_tiers: Vec<TierId>,
    pub filter_subtests: Vec<String>,
    pub filter_runs: Vec<u32>,
    pub filter_status: Vec<RunOutcome>,
    /// Accepted and recorded; has no effect on reset scope.
    pub filter_judge_slots: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subtests: Option<usize>,
}

impl RunOverrides {
    /// Explicit values from `self` win; omitted ones fall back to `saved`.
    pub fn layered_over(&self, saved: &RunOverrides) -> RunOverrides {
        fn pick<T: Clone>(cli: &[T], saved: &[T]) -> Vec<T> {
            if cli.is_empty() {
                saved.to_vec()
            } else {
                cli.to_vec()
            }
        }
        RunOverrides {
            until_run: self.until_run.or(saved.until_run),
            until_tier: self.until_tier.or(saved.until_tier),
            until_experiment: self.until_experiment.or(saved.until_experiment),
            from_run: self.from_run.or(saved.from_run),
            from_tier: self.from_tier.or(saved.from_tier),
            from_experiment: self.from_experiment.or(saved.from_experiment),
            filter_tiers: pick(&self.filter_tiers, &saved.filter_tiers),
            filter_subtests: pick(&self.filter_subtests, &saved.filter_subtests),
            filter_runs: pick(&self.filter_runs, &saved.filter_runs),
            filter_status: pick(&self.filter_status, &saved.filter_status),
            filter_judge_slots: pick(&self.filter_judge_slots, &saved.filter_judge_slots),
            max_subtests: self.max_subtests.or(saved.max_subtests),
        }
    }

    pub fn has_from(&self) -> bool {
        self.from_run.is_some() || self.from_tier.is_some() || self.from_experiment.is_some()
    }

    pub fn reset_filter(&self) -> ResetFilter {
        ResetFilter {
            tiers: self.filter_tiers.clone(),
            subtests: self.filter_subtests.clone(),
            runs: self.filter_runs.clone(),
            outcomes: self.filter_status.clone(),
            judge_slots: self.filter_judge_slots.clone(),
        }
    }
}

/// The subset of the config that changes what a run produces.
#[derive(Serialize)]
struct ExecutionFingerprint<'a> {
    experiment_id: &'a str,
    task_prompt: &'a str,
    tiers_dir: &'a Path,
    workspace_template: Option<&'a Path>,
    execution: &'a ExecutionConfig,
    agent_command: &'a [String],
    judge_command: &'a [String],
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        validate_experiment_id(&self.experiment.id)?;
        if self.experiment.task_prompt.trim().is_empty() {
            bail!("experiment.task_prompt must be non-empty");
        }
        if self.experiment.tiers.is_empty() {
            bail!("experiment.tiers must be a non-empty array");
        }
        if self.execution.runs_per_subtest == 0 {
            bail!("execution.runs_per_subtest must be > 0");
        }
        if self.execution.timeout_secs == 0 {
            bail!("execution.timeout_secs must be > 0");
        }
        if self.execution.output_limit_bytes == 0 {
            bail!("execution.output_limit_bytes must be > 0");
        }
        if self.execution.tie_epsilon.is_nan() || self.execution.tie_epsilon < 0.0 {
            bail!("execution.tie_epsilon must be >= 0");
        }
        if self.parallel.max_parallel_subtests == 0 {
            bail!("parallel.max_parallel_subtests must be > 0");
        }
        if self.rate_limit.buffer_fraction.is_nan() || self.rate_limit.buffer_fraction < 0.0 {
            bail!("rate_limit.buffer_fraction must be >= 0");
        }
        if self.rate_limit.poll_interval_ms == 0 {
            bail!("rate_limit.poll_interval_ms must be > 0");
        }
        if let Some(max) = self.overrides.max_subtests
            && max == 0
        {
            bail!("overrides.max_subtests must be > 0");
        }
        Ok(())
    }

    /// `<results_dir>/<experiment id>`.
    pub fn experiment_dir(&self) -> PathBuf {
        self.experiment.results_dir.join(&self.experiment.id)
    }

    /// Hex SHA-256 over the execution-affecting fields.
    ///
    /// Parallelism, rate-limit knobs, the tier list, workspace retention and
    /// per-invocation overrides do not contribute.
    pub fn config_hash(&self) -> Result<String> {
        let fingerprint = ExecutionFingerprint {
            experiment_id: &self.experiment.id,
            task_prompt: &self.experiment.task_prompt,
            tiers_dir: &self.experiment.tiers_dir,
            workspace_template: self.experiment.workspace_template.as_deref(),
            execution: &self.execution,
            agent_command: &self.agent.command,
            judge_command: &self.judge.command,
        };
        let canonical = serde_json::to_vec(&fingerprint).context("serialize config fingerprint")?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Resolve relative paths against `base` (the config file's directory).
    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        };
        self.experiment.tiers_dir = resolve(&self.experiment.tiers_dir);
        self.experiment.results_dir = resolve(&self.experiment.results_dir);
        self.experiment.workspace_template =
            self.experiment.workspace_template.as_deref().map(resolve);
    }
}

fn validate_experiment_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("experiment.id must be non-empty");
    }
    if id.contains("..") {
        bail!("experiment.id must not contain '..'");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("experiment.id must use [a-z0-9_-] only");
    }
    Ok(())
}

/// Load and validate an experiment config from a TOML file.
pub fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: ExperimentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let base = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let base = fs::canonicalize(base).with_context(|| format!("resolve {}", base.display()))?;
    cfg.resolve_paths(&base);
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    debug!(
        path = %path.display(),
        experiment_id = %cfg.experiment.id,
        tiers = cfg.experiment.tiers.len(),
        "config loaded"
    );
    Ok(cfg)
}
