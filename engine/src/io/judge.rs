//! Judge adapter: scores an agent's work in its workspace.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::rate_limit::{RateLimitSource, detect_rate_limit};
use crate::core::types::Judgment;
use crate::error::AdapterError;
use crate::io::agent::write_logs;
use crate::io::process::run_command;

#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub workspace: PathBuf,
    pub task_prompt: String,
    pub agent_output: String,
    pub model: String,
    pub log_dir: PathBuf,
}

pub trait JudgeAdapter: Send + Sync {
    fn judge(&self, request: &JudgeRequest) -> Result<Judgment, AdapterError>;
}

/// Judge that spawns `command` in the workspace.
///
/// Receives `{"task_prompt", "agent_output", "model"}` as JSON on stdin and
/// must print a [`Judgment`] JSON object as its last stdout line.
#[derive(Debug, Clone)]
pub struct CommandJudge {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Serialize)]
struct JudgeInput<'a> {
    task_prompt: &'a str,
    agent_output: &'a str,
    model: &'a str,
}

impl JudgeAdapter for CommandJudge {
    #[instrument(skip_all, fields(workspace = %request.workspace.display(), model = %request.model))]
    fn judge(&self, request: &JudgeRequest) -> Result<Judgment, AdapterError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("judge.command is empty"))?;
        let input = serde_json::to_vec(&JudgeInput {
            task_prompt: &request.task_prompt,
            agent_output: &request.agent_output,
            model: &request.model,
        })
        .context("serialize judge input")?;

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workspace);
        let output = run_command(cmd, Some(&input), self.timeout, self.output_limit_bytes)
            .context("run judge command")?;
        write_logs(&request.log_dir, &output)?;

        if !output.success() {
            if let Some(info) = detect_rate_limit(RateLimitSource::Judge, &output.combined()) {
                warn!(retry_after_secs = ?info.retry_after_secs, "judge rate limited");
                return Err(AdapterError::RateLimited(info));
            }
            return Err(anyhow!(
                "judge exited with {:?}{}: {}",
                output.exit_code,
                if output.timed_out { " (timed out)" } else { "" },
                output.stderr.trim()
            )
            .into());
        }

        let verdict = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| anyhow!("judge printed no verdict"))?;
        let mut judgment: Judgment =
            serde_json::from_str(verdict).context("parse judge verdict")?;
        judgment.score = judgment.score.clamp(0.0, 1.0);
        debug!(score = judgment.score, passed = judgment.passed, "judge finished");
        Ok(judgment)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn judge(script: &str) -> CommandJudge {
        CommandJudge {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
        }
    }

    fn request(dir: &std::path::Path) -> JudgeRequest {
        JudgeRequest {
            workspace: dir.to_path_buf(),
            task_prompt: "task".to_string(),
            agent_output: "done".to_string(),
            model: "judge-model".to_string(),
            log_dir: dir.join("judge"),
        }
    }

    #[test]
    fn parses_verdict_and_clamps_score() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = r#"cat > input.json; echo '{"score": 1.4, "passed": true, "grade": "A", "criteria": {"tests": 1.0}}'"#;
        let judgment = judge(script).judge(&request(temp.path())).expect("judge");
        assert_eq!(judgment.score, 1.0);
        assert!(judgment.passed);
        assert_eq!(judgment.grade, "A");
        let input = std::fs::read_to_string(temp.path().join("input.json")).expect("input");
        assert!(input.contains("\"agent_output\":\"done\""));
    }

    #[test]
    fn garbage_verdict_is_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = judge("echo nope").judge(&request(temp.path())).expect_err("bad");
        assert!(matches!(err, AdapterError::Failed(_)));
    }

    #[test]
    fn overloaded_judge_is_rate_limited() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = judge("echo 'upstream overloaded' >&2; exit 1")
            .judge(&request(temp.path()))
            .expect_err("limited");
        assert!(matches!(err, AdapterError::RateLimited(_)));
    }
}
