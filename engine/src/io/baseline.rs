//! Tier baselines: recording a tier's winner and inheriting it downstream.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::checkpoint::Checkpoint;
use crate::core::resources::{ResourceSpec, TierBaseline, merge_baselines};
use crate::core::selection::{SubtestSummary, TieBreak};
use crate::core::tier::TierId;
use crate::error::BaselineError;
use crate::io::artifacts::{BEST_SUBTEST_FILE, read_json, tier_dir, write_json};

/// `best_subtest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestSubtestRecord {
    #[serde(flatten)]
    pub baseline: TierBaseline,
    pub tie_breaker: Option<TieBreak>,
    pub summary: SubtestSummary,
}

pub fn best_subtest_path(experiment_dir: &Path, tier: TierId) -> PathBuf {
    tier_dir(experiment_dir, tier).join(BEST_SUBTEST_FILE)
}

pub fn write_best_subtest(experiment_dir: &Path, record: &BestSubtestRecord) -> Result<()> {
    write_json(&best_subtest_path(experiment_dir, record.baseline.tier), record)
}

pub fn has_selection(experiment_dir: &Path, tier: TierId) -> bool {
    best_subtest_path(experiment_dir, tier).is_file()
}

pub fn load_best_subtest(experiment_dir: &Path, tier: TierId) -> Result<BestSubtestRecord> {
    read_json(&best_subtest_path(experiment_dir, tier))
}

/// Whether every dependency of `tier` is usable as a baseline source.
///
/// Dependencies run by this experiment must be complete with every run
/// terminal; others only need a recorded selection on disk.
pub fn is_schedulable(checkpoint: &Checkpoint, tier: TierId) -> bool {
    tier.dependencies().iter().all(|dependency| {
        if checkpoint.config.experiment.tiers.contains(dependency) {
            checkpoint.tier_is_settled(*dependency)
                && has_selection(&checkpoint.experiment_dir, *dependency)
        } else {
            has_selection(&checkpoint.experiment_dir, *dependency)
        }
    })
}

/// Merge the recorded winners of `tier`'s dependencies, in dependency order.
///
/// `None` for tiers without dependencies.
pub fn build_baseline(
    experiment_dir: &Path,
    tier: TierId,
) -> Result<Option<ResourceSpec>, BaselineError> {
    let dependencies = tier.dependencies();
    if dependencies.is_empty() {
        return Ok(None);
    }
    let mut baselines = Vec::with_capacity(dependencies.len());
    for dependency in dependencies {
        if !has_selection(experiment_dir, *dependency) {
            return Err(BaselineError::MissingSelection {
                tier,
                dependency: *dependency,
            });
        }
        let record = load_best_subtest(experiment_dir, *dependency).map_err(|source| {
            BaselineError::Load {
                dependency: *dependency,
                source,
            }
        })?;
        debug!(tier = %tier, dependency = %dependency, subtest = %record.baseline.subtest, "baseline source");
        baselines.push(record.baseline);
    }
    Ok(Some(merge_baselines(&baselines)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::states::TierState;
    use crate::io::config::ExperimentConfig;

    fn record(tier: TierId, tool: &str) -> BestSubtestRecord {
        BestSubtestRecord {
            baseline: TierBaseline {
                tier,
                subtest: format!("{tier}-best"),
                resources: ResourceSpec {
                    tools: vec![tool.to_string()],
                    ..ResourceSpec::default()
                },
            },
            tie_breaker: None,
            summary: SubtestSummary::default(),
        }
    }

    #[test]
    fn independent_tiers_have_no_baseline() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(build_baseline(temp.path(), TierId::T2).expect("baseline"), None);
    }

    #[test]
    fn missing_dependency_selection_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        for tier in [TierId::T0, TierId::T1, TierId::T2, TierId::T3] {
            write_best_subtest(temp.path(), &record(tier, "x")).expect("write");
        }
        let err = build_baseline(temp.path(), TierId::T5).expect_err("missing T4");
        assert!(matches!(
            err,
            BaselineError::MissingSelection {
                tier: TierId::T5,
                dependency: TierId::T4
            }
        ));
    }

    #[test]
    fn hybrid_baseline_unions_dependency_tools() {
        let temp = tempfile::tempdir().expect("tempdir");
        for (tier, tool) in [
            (TierId::T0, "read"),
            (TierId::T1, "write"),
            (TierId::T2, "read"),
            (TierId::T3, "bash"),
            (TierId::T4, "web"),
        ] {
            write_best_subtest(temp.path(), &record(tier, tool)).expect("write");
        }
        let spec = build_baseline(temp.path(), TierId::T5)
            .expect("baseline")
            .expect("has deps");
        assert_eq!(spec.tools, vec!["read", "write", "bash", "web"]);
    }

    #[test]
    fn hybrid_waits_for_settled_dependencies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = ExperimentConfig::default();
        config.experiment.id = "exp".to_string();
        config.experiment.tiers = vec![TierId::T0, TierId::T5];
        let mut cp = Checkpoint::new(config, temp.path().to_path_buf(), "h".to_string());
        for tier in [TierId::T1, TierId::T2, TierId::T3, TierId::T4] {
            write_best_subtest(temp.path(), &record(tier, "x")).expect("write");
        }
        assert!(!is_schedulable(&cp, TierId::T5));

        write_best_subtest(temp.path(), &record(TierId::T0, "x")).expect("write");
        cp.reset_tier_state(TierId::T0, TierState::Complete);
        cp.register_run(TierId::T0, "01-a", 1);
        assert!(!is_schedulable(&cp, TierId::T5));

        cp.mark_run_completed(TierId::T0, "01-a", 1, crate::core::types::RunOutcome::Passed);
        assert!(is_schedulable(&cp, TierId::T5));
        assert!(!is_schedulable(&cp, TierId::T6));
        assert!(is_schedulable(&cp, TierId::T2));
    }
}
