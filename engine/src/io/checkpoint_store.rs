//! Durable checkpoint storage (`<experiment_dir>/checkpoint.json`).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::checkpoint::{Checkpoint, migrate};
use crate::core::states::RunState;
use crate::core::tier::TierId;
use crate::core::types::{RunOutcome, RunResult};
use crate::error::CheckpointError;
use crate::io::artifacts::{RUN_RESULT_FILE, WORKSPACE_DIR, read_json};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

pub fn checkpoint_path(experiment_dir: &Path) -> PathBuf {
    experiment_dir.join(CHECKPOINT_FILE)
}

/// Accept either a checkpoint file or the experiment directory containing it.
pub fn resolve_checkpoint_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        checkpoint_path(path)
    } else {
        path.to_path_buf()
    }
}

/// Atomically write the checkpoint (temp file + rename), stamping `last_updated_at`.
pub fn save(checkpoint: &mut Checkpoint, path: &Path) -> Result<(), CheckpointError> {
    checkpoint.last_updated_at = Utc::now();
    let mut buf = serde_json::to_string_pretty(checkpoint).map_err(CheckpointError::Serialize)?;
    buf.push('\n');
    write_atomic(path, &buf)?;
    debug!(
        path = %path.display(),
        experiment_state = %checkpoint.experiment_state,
        "checkpoint saved"
    );
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), CheckpointError> {
    let write_err = |source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).map_err(write_err)?;
    fs::rename(&tmp_path, path).map_err(write_err)?;
    Ok(())
}

/// Load a checkpoint, migrating older schema versions.
pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    debug!(path = %path.display(), "loading checkpoint");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(CheckpointError::Missing {
                path: path.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(CheckpointError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let parse_err = |source| CheckpointError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let doc: Value = serde_json::from_str(&contents).map_err(parse_err)?;
    let doc = migrate(doc)?;
    let checkpoint: Checkpoint = serde_json::from_value(doc).map_err(parse_err)?;
    debug!(
        experiment_id = %checkpoint.experiment_id,
        experiment_state = %checkpoint.experiment_state,
        tiers = checkpoint.tier_states.len(),
        "checkpoint loaded"
    );
    Ok(checkpoint)
}

/// One run added to the completed-run index by `repair`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairedRun {
    pub tier: TierId,
    pub subtest: String,
    pub run: u32,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub added: Vec<RepairedRun>,
    /// Run result files that could not be parsed.
    pub skipped: Vec<PathBuf>,
}

/// Rebuild the completed-run index from per-run `run_result.json` artifacts.
///
/// Only adds entries. Indexed runs are advanced to `worktree_cleaned` so the
/// state map agrees with the index. Saves only when something changed.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn repair(path: &Path) -> Result<RepairReport> {
    let mut checkpoint = load(path)?;
    let experiment_dir = checkpoint.experiment_dir.clone();
    let mut report = RepairReport::default();
    let mut advanced = 0usize;

    // Agent workspaces hold arbitrary task files and are never run artifacts.
    let mut result_files: Vec<PathBuf> = WalkDir::new(&experiment_dir)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.file_type().is_dir() && entry.file_name() == WORKSPACE_DIR)
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(err = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == RUN_RESULT_FILE)
        .map(walkdir::DirEntry::into_path)
        .collect();
    result_files.sort();

    for file in result_files {
        let result: RunResult = match read_json(&file) {
            Ok(result) => result,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(path = %file.display(), err = %message, "unparsable run result");
                report.skipped.push(file);
                continue;
            }
        };
        let (tier, subtest, run) = (result.tier, result.subtest.as_str(), result.run);
        let cleaned = checkpoint
            .run_state(tier, subtest, run)
            .is_some_and(|state| state.is(RunState::WorktreeCleaned));
        if checkpoint.is_run_completed(tier, subtest, run) && cleaned {
            continue;
        }
        if !cleaned {
            advanced += 1;
        }
        if !checkpoint.is_run_completed(tier, subtest, run) {
            report.added.push(RepairedRun {
                tier,
                subtest: subtest.to_string(),
                run,
                outcome: result.outcome(),
            });
        }
        checkpoint.register_subtest(tier, subtest);
        checkpoint.mark_run_completed(tier, subtest, run, result.outcome());
    }

    if !report.added.is_empty() || advanced > 0 {
        save(&mut checkpoint, path).context("save repaired checkpoint")?;
    }
    info!(
        added = report.added.len(),
        advanced,
        skipped = report.skipped.len(),
        "checkpoint repaired"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::core::states::{Recorded, TierState};
    use crate::core::types::{AgentOutput, Judgment};
    use crate::io::artifacts::{RunPaths, write_json};
    use crate::io::config::ExperimentConfig;

    fn checkpoint(dir: &Path) -> Checkpoint {
        let mut config = ExperimentConfig::default();
        config.experiment.id = "exp".to_string();
        config.experiment.tiers = vec![TierId::T0];
        Checkpoint::new(config, dir.to_path_buf(), "hash".to_string())
    }

    fn write_result(dir: &Path, subtest: &str, run: u32, passed: bool) {
        let result = RunResult {
            tier: TierId::T0,
            subtest: subtest.to_string(),
            run,
            agent: AgentOutput::default(),
            judgment: Some(Judgment {
                score: if passed { 1.0 } else { 0.0 },
                passed,
                ..Judgment::default()
            }),
            finished_at: Utc::now(),
        };
        let paths = RunPaths::new(dir, TierId::T0, subtest, run);
        write_json(&paths.run_result, &result).expect("write result");
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = checkpoint_path(temp.path());
        let mut cp = checkpoint(temp.path());
        cp.register_subtest(TierId::T0, "01-a");
        cp.mark_run_completed(TierId::T0, "01-a", 1, RunOutcome::AgentFailed);
        cp.set_run_state(TierId::T0, "01-a", 2, RunState::AgentComplete)
            .expect("forward");
        cp.set_tier_state(TierId::T0, TierState::SubtestsRunning)
            .expect("forward");

        save(&mut cp, &path).expect("save");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded, cp);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_is_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load(&temp.path().join("checkpoint.json")).expect_err("missing");
        assert!(matches!(err, CheckpointError::Missing { .. }));
    }

    #[test]
    fn load_garbage_is_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            load(&path).expect_err("garbage"),
            CheckpointError::Parse { .. }
        ));
    }

    #[test]
    fn load_preserves_unrecognized_run_tokens() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = checkpoint_path(temp.path());
        let mut cp = checkpoint(temp.path());
        cp.register_run(TierId::T0, "01-a", 1);
        save(&mut cp, &path).expect("save");

        let raw = fs::read_to_string(&path).expect("read");
        let raw = raw.replace("\"1\": \"pending\"", "\"1\": \"half_done\"");
        fs::write(&path, raw).expect("write");

        let loaded = load(&path).expect("load");
        assert_eq!(
            loaded.run_state(TierId::T0, "01-a", 1),
            Some(&Recorded::Unrecognized("half_done".to_string()))
        );
        assert!(loaded.tier_has_incomplete_runs(TierId::T0));
    }

    #[test]
    fn repair_adds_missing_entries_idempotently() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = checkpoint_path(temp.path());
        let mut cp = checkpoint(temp.path());
        cp.register_subtest(TierId::T0, "01-a");
        cp.mark_run_completed(TierId::T0, "01-a", 1, RunOutcome::Passed);
        cp.set_run_state(TierId::T0, "01-a", 2, RunState::RunFinalized)
            .expect("forward");
        save(&mut cp, &path).expect("save");

        write_result(temp.path(), "01-a", 1, false);
        write_result(temp.path(), "01-a", 2, false);
        write_result(temp.path(), "02-b", 1, true);
        let broken = RunPaths::new(temp.path(), TierId::T0, "02-b", 2).run_result;
        fs::create_dir_all(broken.parent().expect("parent")).expect("mkdir");
        fs::write(&broken, "{").expect("write broken");

        let report = repair(&path).expect("repair");
        assert_eq!(report.added.len(), 2);
        assert_eq!(report.skipped, vec![broken]);

        let repaired = load(&path).expect("load");
        assert_eq!(
            repaired.completed_outcome(TierId::T0, "01-a", 1),
            Some(RunOutcome::Passed)
        );
        assert_eq!(
            repaired.completed_outcome(TierId::T0, "01-a", 2),
            Some(RunOutcome::Failed)
        );
        assert!(
            repaired
                .run_state(TierId::T0, "01-a", 2)
                .expect("state")
                .is(RunState::WorktreeCleaned)
        );
        assert!(repaired.is_run_completed(TierId::T0, "02-b", 1));

        let again = repair(&path).expect("repair again");
        assert!(again.added.is_empty());
    }

    #[test]
    fn repair_ignores_files_inside_run_workspaces() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = checkpoint_path(temp.path());
        let mut cp = checkpoint(temp.path());
        save(&mut cp, &path).expect("save");

        write_result(temp.path(), "01-a", 1, true);
        let paths = RunPaths::new(temp.path(), TierId::T0, "01-a", 2);
        let nested = paths.workspace.join("fixtures").join(RUN_RESULT_FILE);
        fs::create_dir_all(nested.parent().expect("parent")).expect("mkdir");
        fs::write(&nested, "not a run result").expect("write stray");
        let result = RunResult {
            tier: TierId::T0,
            subtest: "01-a".to_string(),
            run: 2,
            agent: AgentOutput::default(),
            judgment: None,
            finished_at: Utc::now(),
        };
        write_json(&paths.workspace.join(RUN_RESULT_FILE), &result).expect("write copy");

        let report = repair(&path).expect("repair");

        assert_eq!(report.added.len(), 1);
        assert_eq!(report.added[0].run, 1);
        assert!(report.skipped.is_empty());
        let repaired = load(&path).expect("load");
        assert!(!repaired.is_run_completed(TierId::T0, "01-a", 2));
    }
}
