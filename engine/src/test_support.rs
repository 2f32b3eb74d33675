//! Scripted collaborators and fixture builders for engine tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::coordinator::ShutdownToken;
use crate::core::checkpoint::Checkpoint;
use crate::core::rate_limit::{RateLimitInfo, RateLimitSource};
use crate::core::resources::ResourceSpec;
use crate::core::tier::TierId;
use crate::core::types::{AgentOutput, Judgment};
use crate::error::AdapterError;
use crate::io::agent::{AgentAdapter, AgentRequest};
use crate::io::config::ExperimentConfig;
use crate::io::judge::{JudgeAdapter, JudgeRequest};
use crate::io::resources::ResourceProvider;

/// Config with fast polling, zero default waits and two runs per subtest.
pub fn test_config(results_dir: &Path, tiers: &[TierId]) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.experiment.id = "exp".to_string();
    config.experiment.task_prompt = "Make the tests pass.".to_string();
    config.experiment.tiers = tiers.to_vec();
    config.experiment.results_dir = results_dir.to_path_buf();
    config.execution.runs_per_subtest = 2;
    config.rate_limit.default_retry_after_secs = 0;
    config.rate_limit.buffer_fraction = 0.0;
    config.rate_limit.poll_interval_ms = 5;
    config
}

/// `test_config` rooted in a fresh temp dir; keep the guard alive for the test.
pub fn temp_experiment(tiers: &[TierId]) -> std::io::Result<(tempfile::TempDir, ExperimentConfig)> {
    let temp = tempfile::tempdir()?;
    let config = test_config(temp.path(), tiers);
    Ok((temp, config))
}

/// Fresh checkpoint for `config` rooted at its experiment dir.
pub fn checkpoint(config: &ExperimentConfig) -> Checkpoint {
    Checkpoint::new(
        config.clone(),
        config.experiment_dir(),
        config.config_hash().unwrap_or_default(),
    )
}

/// Subtest id from `<tier>/<subtest>/run_NN/workspace`.
fn subtest_of(workspace: &Path) -> String {
    workspace
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub enum AgentStep {
    Succeed(AgentOutput),
    /// Nonzero exit; the run is recorded as `agent_failed`.
    Exit(i32),
    RateLimit(Option<f64>),
    Fail(String),
    /// Write `stderr.log` (when given) and panic, killing the worker thread.
    Crash(Option<String>),
}

/// Agent whose responses are scripted per subtest; unscripted calls succeed.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    script: Mutex<HashMap<String, VecDeque<AgentStep>>>,
    calls: Mutex<Vec<String>>,
    latency: Duration,
    /// Request shutdown during this (1-based) call.
    shutdown_on: Option<(usize, ShutdownToken)>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, subtest: &str, steps: impl IntoIterator<Item = AgentStep>) -> Self {
        lock(&self.script)
            .entry(subtest.to_string())
            .or_default()
            .extend(steps);
        self
    }

    /// Every call takes at least `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Request `shutdown` while serving call number `call`, which then
    /// answers as scripted.
    pub fn request_shutdown_on(mut self, call: usize, shutdown: ShutdownToken) -> Self {
        self.shutdown_on = Some((call, shutdown));
        self
    }

    pub fn calls(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls_for(&self, subtest: &str) -> usize {
        lock(&self.calls).iter().filter(|id| *id == subtest).count()
    }

    pub fn success(cost_usd: f64) -> AgentOutput {
        AgentOutput {
            exit_code: 0,
            input_tokens: 100,
            output_tokens: 50,
            cost_usd,
            duration_secs: 1.0,
            output: "done".to_string(),
        }
    }
}

impl AgentAdapter for ScriptedAgent {
    fn run(&self, request: &AgentRequest) -> Result<AgentOutput, AdapterError> {
        let subtest = subtest_of(&request.workspace);
        let call = {
            let mut calls = lock(&self.calls);
            calls.push(subtest.clone());
            calls.len()
        };
        if let Some((on, shutdown)) = &self.shutdown_on
            && *on == call
        {
            shutdown.request();
        }
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let step = lock(&self.script)
            .get_mut(&subtest)
            .and_then(VecDeque::pop_front);
        match step {
            None => Ok(Self::success(0.01)),
            Some(AgentStep::Succeed(output)) => Ok(output),
            Some(AgentStep::Exit(code)) => Ok(AgentOutput {
                exit_code: code,
                ..Self::success(0.01)
            }),
            Some(AgentStep::RateLimit(retry)) => Err(AdapterError::RateLimited(
                RateLimitInfo::new(RateLimitSource::Agent, retry, "429 Too Many Requests"),
            )),
            Some(AgentStep::Fail(message)) => Err(AdapterError::Failed(anyhow::anyhow!(message))),
            Some(AgentStep::Crash(log)) => {
                if let Some(log) = log {
                    let _ = fs::create_dir_all(&request.log_dir);
                    let _ = fs::write(request.log_dir.join("stderr.log"), log);
                }
                panic!("scripted agent crash in {subtest}");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum JudgeStep {
    Verdict(Judgment),
    RateLimit(Option<f64>),
    Fail(String),
}

/// Judge with per-subtest scripted verdicts; unscripted calls pass with `default_score`.
#[derive(Debug)]
pub struct ScriptedJudge {
    script: Mutex<HashMap<String, VecDeque<JudgeStep>>>,
    scores: HashMap<String, f64>,
    default_score: f64,
    calls: Mutex<usize>,
}

impl Default for ScriptedJudge {
    fn default() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            scores: HashMap::new(),
            default_score: 1.0,
            calls: Mutex::new(0),
        }
    }
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every verdict for `subtest` scores `score`; it passes at 0.5 or above.
    pub fn score(mut self, subtest: &str, score: f64) -> Self {
        self.scores.insert(subtest.to_string(), score);
        self
    }

    pub fn on(self, subtest: &str, steps: impl IntoIterator<Item = JudgeStep>) -> Self {
        lock(&self.script)
            .entry(subtest.to_string())
            .or_default()
            .extend(steps);
        self
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }

    pub fn verdict(score: f64) -> Judgment {
        Judgment {
            score,
            passed: score >= 0.5,
            grade: if score >= 0.5 { "A" } else { "F" }.to_string(),
            criteria: BTreeMap::from([("correctness".to_string(), score)]),
        }
    }
}

impl JudgeAdapter for ScriptedJudge {
    fn judge(&self, request: &JudgeRequest) -> Result<Judgment, AdapterError> {
        *lock(&self.calls) += 1;
        let subtest = subtest_of(&request.workspace);
        let step = lock(&self.script)
            .get_mut(&subtest)
            .and_then(VecDeque::pop_front);
        match step {
            Some(JudgeStep::Verdict(judgment)) => Ok(judgment),
            Some(JudgeStep::RateLimit(retry)) => Err(AdapterError::RateLimited(
                RateLimitInfo::new(RateLimitSource::Judge, retry, "judge overloaded"),
            )),
            Some(JudgeStep::Fail(message)) => Err(AdapterError::Failed(anyhow::anyhow!(message))),
            None => Ok(Self::verdict(
                self.scores.get(&subtest).copied().unwrap_or(self.default_score),
            )),
        }
    }
}

/// In-memory resource fixtures.
#[derive(Debug, Clone, Default)]
pub struct StaticResources {
    tiers: BTreeMap<TierId, BTreeMap<String, ResourceSpec>>,
}

impl StaticResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tier: TierId, subtest: &str, spec: ResourceSpec) -> Self {
        self.tiers
            .entry(tier)
            .or_default()
            .insert(subtest.to_string(), spec);
        self
    }

    /// Subtests with a single tool named after the subtest.
    pub fn with_subtests(self, tier: TierId, subtests: &[&str]) -> Self {
        subtests.iter().fold(self, |resources, subtest| {
            let spec = ResourceSpec {
                tools: vec![format!("{subtest}-tool")],
                ..ResourceSpec::default()
            };
            resources.with(tier, subtest, spec)
        })
    }
}

impl ResourceProvider for StaticResources {
    fn list_subtests(&self, tier: TierId) -> anyhow::Result<Vec<String>> {
        Ok(self
            .tiers
            .get(&tier)
            .map(|subtests| subtests.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn resources(&self, tier: TierId, subtest: &str) -> anyhow::Result<ResourceSpec> {
        self.tiers
            .get(&tier)
            .and_then(|subtests| subtests.get(subtest))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no fixture for {tier}/{subtest}"))
    }
}
