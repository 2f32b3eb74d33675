//! The checkpoint aggregate: every state in the experiment hierarchy plus the
//! completed-run index.
//!
//! The checkpoint is the only input used to decide what work remains. All
//! mutation goes through the methods here so forward-only transitions and the
//! index invariant (a run is indexed iff it is `worktree_cleaned`) hold.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::rate_limit::RateLimitInfo;
use crate::core::states::{ExperimentState, Lifecycle, Recorded, RunState, SubtestState, TierState};
use crate::core::tier::TierId;
use crate::core::types::RunOutcome;
use crate::error::{CheckpointError, TransitionError};
use crate::io::config::ExperimentConfig;

/// Schema version written by this build.
pub const CURRENT_VERSION: u32 = 3;

pub type SubtestMap<V> = BTreeMap<TierId, BTreeMap<String, V>>;
pub type RunMap<V> = BTreeMap<TierId, BTreeMap<String, BTreeMap<u32, V>>>;

/// A rate-limit pause recorded while the pool owner waits it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    #[serde(flatten)]
    pub info: RateLimitInfo,
    pub resume_at: DateTime<Utc>,
}

impl RateLimitWindow {
    /// Window for a pause of `wait` starting now.
    pub fn starting_now(info: RateLimitInfo, wait: Duration) -> Self {
        let resume_at = Utc::now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        Self { info, resume_at }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub experiment_id: String,
    pub experiment_dir: PathBuf,
    pub config_hash: String,
    pub config: ExperimentConfig,
    pub experiment_state: ExperimentState,
    #[serde(default)]
    pub tier_states: BTreeMap<TierId, TierState>,
    #[serde(default)]
    pub subtest_states: SubtestMap<SubtestState>,
    #[serde(default)]
    pub run_states: RunMap<Recorded<RunState>>,
    #[serde(default)]
    pub completed_runs: RunMap<RunOutcome>,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitWindow>,
}

/// State change reported by a worker and applied by the pool owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Forward transition (or a move to a side branch).
    RunState {
        tier: TierId,
        subtest: String,
        run: u32,
        state: RunState,
    },
    /// A rate-limited run returns to the step it had reached.
    RunRestored {
        tier: TierId,
        subtest: String,
        run: u32,
        state: RunState,
    },
    RunCompleted {
        tier: TierId,
        subtest: String,
        run: u32,
        outcome: RunOutcome,
    },
    SubtestState {
        tier: TierId,
        subtest: String,
        state: SubtestState,
    },
    /// A rate-limit pause started (`Some`) or ended (`None`).
    RateLimitWindow(Option<RateLimitWindow>),
}

impl Checkpoint {
    pub fn new(config: ExperimentConfig, experiment_dir: PathBuf, config_hash: String) -> Self {
        let now = Utc::now();
        let mut checkpoint = Self {
            version: CURRENT_VERSION,
            experiment_id: config.experiment.id.clone(),
            experiment_dir,
            config_hash,
            config,
            experiment_state: ExperimentState::Initializing,
            tier_states: BTreeMap::new(),
            subtest_states: BTreeMap::new(),
            run_states: BTreeMap::new(),
            completed_runs: BTreeMap::new(),
            started_at: now,
            last_updated_at: now,
            pid: std::process::id(),
            rate_limit: None,
        };
        for tier in checkpoint.config.experiment.tiers.clone() {
            checkpoint.register_tier(tier);
        }
        checkpoint
    }

    pub fn register_tier(&mut self, tier: TierId) {
        self.tier_states.entry(tier).or_insert(TierState::Pending);
    }

    pub fn register_subtest(&mut self, tier: TierId, subtest: &str) {
        self.subtest_states
            .entry(tier)
            .or_default()
            .entry(subtest.to_string())
            .or_insert(SubtestState::Pending);
    }

    pub fn register_run(&mut self, tier: TierId, subtest: &str, run: u32) {
        self.run_states
            .entry(tier)
            .or_default()
            .entry(subtest.to_string())
            .or_default()
            .entry(run)
            .or_insert(Recorded::Known(RunState::Pending));
    }

    pub fn tier_state(&self, tier: TierId) -> Option<TierState> {
        self.tier_states.get(&tier).copied()
    }

    pub fn subtest_state(&self, tier: TierId, subtest: &str) -> Option<SubtestState> {
        self.subtest_states
            .get(&tier)
            .and_then(|subtests| subtests.get(subtest))
            .copied()
    }

    pub fn run_state(&self, tier: TierId, subtest: &str, run: u32) -> Option<&Recorded<RunState>> {
        self.run_states
            .get(&tier)
            .and_then(|subtests| subtests.get(subtest))
            .and_then(|runs| runs.get(&run))
    }

    /// Subtest ids registered for `tier`, sorted.
    pub fn subtests(&self, tier: TierId) -> Vec<String> {
        self.subtest_states
            .get(&tier)
            .map(|subtests| subtests.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn runs(&self, tier: TierId, subtest: &str) -> Option<&BTreeMap<u32, Recorded<RunState>>> {
        self.run_states
            .get(&tier)
            .and_then(|subtests| subtests.get(subtest))
    }

    pub fn is_run_completed(&self, tier: TierId, subtest: &str, run: u32) -> bool {
        self.completed_outcome(tier, subtest, run).is_some()
    }

    pub fn completed_outcome(&self, tier: TierId, subtest: &str, run: u32) -> Option<RunOutcome> {
        self.completed_runs
            .get(&tier)
            .and_then(|subtests| subtests.get(subtest))
            .and_then(|runs| runs.get(&run))
            .copied()
    }

    /// Index a finished run. Existing index entries are never overwritten.
    pub fn mark_run_completed(&mut self, tier: TierId, subtest: &str, run: u32, outcome: RunOutcome) {
        self.completed_runs
            .entry(tier)
            .or_default()
            .entry(subtest.to_string())
            .or_default()
            .entry(run)
            .or_insert(outcome);
        self.run_states
            .entry(tier)
            .or_default()
            .entry(subtest.to_string())
            .or_default()
            .insert(run, Recorded::Known(RunState::WorktreeCleaned));
    }

    pub fn set_run_state(
        &mut self,
        tier: TierId,
        subtest: &str,
        run: u32,
        state: RunState,
    ) -> Result<(), TransitionError> {
        let slot = self
            .run_states
            .entry(tier)
            .or_default()
            .entry(subtest.to_string())
            .or_default()
            .entry(run)
            .or_insert(Recorded::Known(RunState::Pending));
        if let Recorded::Known(current) = slot {
            current.check_transition(state)?;
        }
        *slot = Recorded::Known(state);
        Ok(())
    }

    /// Move a run to `state` regardless of ordering. Leaves the index unless
    /// the run is no longer `worktree_cleaned`.
    pub fn reset_run_state(&mut self, tier: TierId, subtest: &str, run: u32, state: RunState) {
        self.run_states
            .entry(tier)
            .or_default()
            .entry(subtest.to_string())
            .or_default()
            .insert(run, Recorded::Known(state));
        if state != RunState::WorktreeCleaned {
            self.unindex_run(tier, subtest, run);
        }
    }

    fn unindex_run(&mut self, tier: TierId, subtest: &str, run: u32) {
        if let Some(runs) = self
            .completed_runs
            .get_mut(&tier)
            .and_then(|subtests| subtests.get_mut(subtest))
        {
            runs.remove(&run);
        }
    }

    pub fn set_subtest_state(
        &mut self,
        tier: TierId,
        subtest: &str,
        state: SubtestState,
    ) -> Result<(), TransitionError> {
        let slot = self
            .subtest_states
            .entry(tier)
            .or_default()
            .entry(subtest.to_string())
            .or_insert(SubtestState::Pending);
        slot.check_transition(state)?;
        *slot = state;
        Ok(())
    }

    pub fn reset_subtest_state(&mut self, tier: TierId, subtest: &str, state: SubtestState) {
        self.subtest_states
            .entry(tier)
            .or_default()
            .insert(subtest.to_string(), state);
    }

    pub fn set_tier_state(&mut self, tier: TierId, state: TierState) -> Result<(), TransitionError> {
        let slot = self.tier_states.entry(tier).or_insert(TierState::Pending);
        slot.check_transition(state)?;
        *slot = state;
        Ok(())
    }

    pub fn reset_tier_state(&mut self, tier: TierId, state: TierState) {
        self.tier_states.insert(tier, state);
    }

    pub fn set_experiment_state(&mut self, state: ExperimentState) -> Result<(), TransitionError> {
        self.experiment_state.check_transition(state)?;
        self.experiment_state = state;
        Ok(())
    }

    pub fn reset_experiment_state(&mut self, state: ExperimentState) {
        self.experiment_state = state;
    }

    /// True when any recorded run of `tier` is non-terminal.
    pub fn tier_has_incomplete_runs(&self, tier: TierId) -> bool {
        self.run_states.get(&tier).is_some_and(|subtests| {
            subtests
                .values()
                .flat_map(BTreeMap::values)
                .any(|state| !state.is_terminal())
        })
    }

    pub fn subtest_has_incomplete_runs(&self, tier: TierId, subtest: &str) -> bool {
        self.runs(tier, subtest)
            .is_some_and(|runs| runs.values().any(|state| !state.is_terminal()))
    }

    /// Complete and with every run terminal: safe to build baselines from.
    pub fn tier_is_settled(&self, tier: TierId) -> bool {
        self.tier_state(tier) == Some(TierState::Complete) && !self.tier_has_incomplete_runs(tier)
    }

    pub fn apply(&mut self, event: &ProgressEvent) -> Result<(), TransitionError> {
        match event {
            ProgressEvent::RunState {
                tier,
                subtest,
                run,
                state,
            } => self.set_run_state(*tier, subtest, *run, *state),
            ProgressEvent::RunRestored {
                tier,
                subtest,
                run,
                state,
            } => {
                self.reset_run_state(*tier, subtest, *run, *state);
                Ok(())
            }
            ProgressEvent::RunCompleted {
                tier,
                subtest,
                run,
                outcome,
            } => {
                self.mark_run_completed(*tier, subtest, *run, *outcome);
                Ok(())
            }
            ProgressEvent::SubtestState {
                tier,
                subtest,
                state,
            } => self.set_subtest_state(*tier, subtest, *state),
            ProgressEvent::RateLimitWindow(window) => {
                self.rate_limit.clone_from(window);
                Ok(())
            }
        }
    }
}

/// Upgrade an older on-disk checkpoint document to the current schema.
///
/// v1 had no completed-run index; v2 stored boolean pass flags in it.
pub fn migrate(mut doc: Value) -> Result<Value, CheckpointError> {
    let Some(object) = doc.as_object_mut() else {
        return Err(CheckpointError::Invalid(
            "checkpoint root must be a JSON object".to_string(),
        ));
    };
    let version = match object.get("version") {
        None => 1,
        Some(value) => value.as_u64().ok_or_else(|| {
            CheckpointError::Invalid(format!("version must be an integer, got {value}"))
        })?,
    };
    if version > u64::from(CURRENT_VERSION) {
        return Err(CheckpointError::UnsupportedVersion {
            found: version,
            supported: CURRENT_VERSION,
        });
    }
    if version < 2 {
        object.insert("completed_runs".to_string(), Value::Object(Default::default()));
    }
    if version == 2
        && let Some(index) = object.get_mut("completed_runs")
    {
        upgrade_bool_index(index);
    }
    object.insert("version".to_string(), Value::from(CURRENT_VERSION));
    Ok(doc)
}

fn upgrade_bool_index(index: &mut Value) {
    let Some(tiers) = index.as_object_mut() else {
        return;
    };
    for runs in tiers
        .values_mut()
        .filter_map(Value::as_object_mut)
        .flat_map(|subtests| subtests.values_mut())
        .filter_map(Value::as_object_mut)
    {
        for value in runs.values_mut() {
            if let Some(passed) = value.as_bool() {
                let outcome = if passed {
                    RunOutcome::Passed
                } else {
                    RunOutcome::Failed
                };
                *value = Value::from(outcome.as_str());
            }
        }
    }
}
