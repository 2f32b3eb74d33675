//! On-disk layout of an experiment directory and JSON artifact helpers.
//!
//! ```text
//! <experiment_dir>/
//!   checkpoint.json
//!   summary.json
//!   T0/
//!     best_subtest.json
//!     tier_result.json
//!     01-minimal/
//!       subtest_result.json
//!       run_01/
//!         workspace/  prompt.md  run_result.json
//!         agent/{result.json,stdout.log,stderr.log}
//!         judge/{result.json,stdout.log,stderr.log}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::tier::TierId;

pub const SUMMARY_FILE: &str = "summary.json";
pub const BEST_SUBTEST_FILE: &str = "best_subtest.json";
pub const TIER_RESULT_FILE: &str = "tier_result.json";
pub const SUBTEST_RESULT_FILE: &str = "subtest_result.json";
pub const RUN_RESULT_FILE: &str = "run_result.json";
pub const WORKSPACE_DIR: &str = "workspace";

pub fn tier_dir(experiment_dir: &Path, tier: TierId) -> PathBuf {
    experiment_dir.join(tier.as_str())
}

pub fn subtest_dir(experiment_dir: &Path, tier: TierId, subtest: &str) -> PathBuf {
    tier_dir(experiment_dir, tier).join(subtest)
}

pub fn run_dir_name(run: u32) -> String {
    format!("run_{run:02}")
}

/// Parse `run_NN` back into a run number.
pub fn parse_run_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix("run_")?.parse().ok()
}

/// Every path belonging to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub root: PathBuf,
    pub workspace: PathBuf,
    pub prompt: PathBuf,
    pub agent_dir: PathBuf,
    pub judge_dir: PathBuf,
    pub run_result: PathBuf,
}

impl RunPaths {
    pub fn new(experiment_dir: &Path, tier: TierId, subtest: &str, run: u32) -> Self {
        let root = subtest_dir(experiment_dir, tier, subtest).join(run_dir_name(run));
        Self {
            workspace: root.join(WORKSPACE_DIR),
            prompt: root.join("prompt.md"),
            agent_dir: root.join("agent"),
            judge_dir: root.join("judge"),
            run_result: root.join(RUN_RESULT_FILE),
            root,
        }
    }

    pub fn agent_result(&self) -> PathBuf {
        self.agent_dir.join("result.json")
    }

    pub fn judge_result(&self) -> PathBuf {
        self.judge_dir.join("result.json")
    }

    /// Resolved resources committed into the workspace.
    pub fn resources(&self) -> PathBuf {
        self.workspace.join(".bench").join("resources.json")
    }

    /// Logs scanned for rate-limit fingerprints after a pool crash.
    pub fn logs(&self) -> [PathBuf; 4] {
        [
            self.agent_dir.join("stdout.log"),
            self.agent_dir.join("stderr.log"),
            self.judge_dir.join("stdout.log"),
            self.judge_dir.join("stderr.log"),
        ]
    }
}

/// Serialize `value` as pretty JSON (trailing newline) and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_atomic(path, payload.as_bytes())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Write to a temp sibling and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Err(anyhow!("missing {}", src.display()));
    }
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry.context("read entry")?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target).with_context(|| format!("copy {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_paths_are_stable() {
        let paths = RunPaths::new(Path::new("/tmp/exp"), TierId::T2, "03-skills", 7);
        assert_eq!(paths.root, PathBuf::from("/tmp/exp/T2/03-skills/run_07"));
        assert_eq!(
            paths.agent_result(),
            PathBuf::from("/tmp/exp/T2/03-skills/run_07/agent/result.json")
        );
        assert_eq!(parse_run_dir_name("run_07"), Some(7));
        assert_eq!(parse_run_dir_name("run_x"), None);
        assert_eq!(parse_run_dir_name("workspace"), None);
    }

    #[test]
    fn write_json_replaces_atomically() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("value.json");
        write_json(&path, &vec![1, 2]).expect("write");
        write_json(&path, &vec![3]).expect("overwrite");
        let value: Vec<u32> = read_json(&path).expect("read");
        assert_eq!(value, vec![3]);
        assert!(!temp.path().join("nested").join("value.json.tmp").exists());
        let raw = fs::read_to_string(&path).expect("raw");
        assert!(raw.ends_with('\n'));
    }

    #[test]
    fn copy_dir_copies_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("inner")).expect("mkdir");
        fs::write(src.join("inner").join("a.txt"), "a").expect("write");
        let dst = temp.path().join("dst");
        copy_dir_recursive(&src, &dst).expect("copy");
        assert_eq!(
            fs::read_to_string(dst.join("inner").join("a.txt")).expect("read"),
            "a"
        );
    }
}
