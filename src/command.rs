//! Shell command jobs.
//!
//! A job file is a JSON array of `{"name", "command", "workdir"?}` objects.
//! [`CommandHandler`] runs each job with `sh -c` and captures its output:
//! - Working directory per job, or a handler-wide default
//! - Output capture and truncation
//! - Child process killed when the task is aborted

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{JobError, TaskError};
use crate::runner::{DispatchedTask, TaskHandler};

/// Maximum captured output per stream before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// One shell command to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandJob {
    /// Label used in logs and the summary.
    pub name: String,
    /// Command line passed to `sh -c`.
    pub command: String,
    /// Working directory (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
}

/// Result of a command that exited successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Combined stdout and stderr, truncated.
    pub output: String,
    pub duration_ms: u64,
}

/// Load and validate a job file.
pub fn load_jobs(path: &Path) -> Result<Vec<CommandJob>, JobError> {
    let raw = std::fs::read_to_string(path).map_err(|source| JobError::Load {
        path: path.to_path_buf(),
        source,
    })?;
    parse_jobs(&raw)
}

/// Parse and validate job-file contents.
pub fn parse_jobs(raw: &str) -> Result<Vec<CommandJob>, JobError> {
    let jobs: Vec<CommandJob> = serde_json::from_str(raw)?;
    for (index, job) in jobs.iter().enumerate() {
        if job.command.trim().is_empty() {
            return Err(JobError::Invalid {
                index,
                reason: format!("job '{}' has an empty command", job.name),
            });
        }
    }
    Ok(jobs)
}

/// Runs [`CommandJob`]s as shell commands.
#[derive(Debug, Default)]
pub struct CommandHandler {
    /// Working directory for jobs that do not set one (if None, uses cwd).
    working_dir: Option<PathBuf>,
}

impl CommandHandler {
    /// Create a handler with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    async fn execute(&self, job: &CommandJob) -> Result<CommandOutput, TaskError> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&job.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = job.workdir.as_ref().or(self.working_dir.as_ref()) {
            command.current_dir(dir);
        }

        let start = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| TaskError::failed(format!("Failed to spawn '{}': {e}", job.name)))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TaskError::failed(format!("Command '{}' failed: {e}", job.name)))?;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let stdout = truncate_output(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate_output(&String::from_utf8_lossy(&output.stderr));
        let combined = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(job = %job.name, exit_code, duration_ms, "Command exited");

        if output.status.success() {
            Ok(CommandOutput {
                exit_code,
                output: combined,
                duration_ms,
            })
        } else {
            Err(TaskError::failed(format!(
                "'{}' exited with code {exit_code}: {}",
                job.name,
                combined.trim()
            )))
        }
    }
}

#[async_trait]
impl TaskHandler<CommandJob, CommandOutput> for CommandHandler {
    async fn run(&self, task: DispatchedTask<CommandJob>) -> Result<CommandOutput, TaskError> {
        self.execute(&task.payload).await
    }
}

/// Cut output to `MAX_OUTPUT_SIZE` bytes on a char boundary.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... (truncated, {} bytes total)", &s[..end], s.len())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use uuid::Uuid;

    use super::*;
    use crate::runner::TaskId;

    fn dispatched(job: CommandJob) -> DispatchedTask<CommandJob> {
        DispatchedTask {
            id: TaskId(0),
            run_id: Uuid::new_v4(),
            payload: job,
        }
    }

    fn job(name: &str, command: &str) -> CommandJob {
        CommandJob {
            name: name.to_string(),
            command: command.to_string(),
            workdir: None,
        }
    }

    #[test]
    fn parses_job_file() {
        let jobs = parse_jobs(
            r#"[
                {"name": "a", "command": "echo a"},
                {"name": "b", "command": "ls", "workdir": "/tmp"}
            ]"#,
        )
        .unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].workdir, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn rejects_empty_command() {
        let err = parse_jobs(r#"[{"name": "a", "command": "  "}]"#).unwrap_err();
        assert!(matches!(err, JobError::Invalid { index: 0, .. }));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_jobs(r#"{"name": "a"}"#).unwrap_err();
        assert!(matches!(err, JobError::Parse(_)));
    }

    #[test]
    fn load_jobs_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "x", "command": "true"}}]"#).unwrap();
        let jobs = load_jobs(file.path()).unwrap();
        assert_eq!(jobs, vec![job("x", "true")]);
    }

    #[test]
    fn load_jobs_missing_file() {
        let err = load_jobs(Path::new("/nonexistent/jobs.json")).unwrap_err();
        assert!(matches!(err, JobError::Load { .. }));
    }

    #[test]
    fn truncates_long_output() {
        let long = "é".repeat(MAX_OUTPUT_SIZE);
        let out = truncate_output(&long);
        assert!(out.contains("truncated"));
        assert!(out.len() < long.len());
        assert_eq!(truncate_output("short"), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_successful_command() {
        let handler = CommandHandler::new();
        let out = handler
            .run(dispatched(job("echo", "echo hello")))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.output.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let handler = CommandHandler::new();
        let err = handler
            .run(dispatched(job("fail", "echo oops >&2; exit 3")))
            .await
            .unwrap_err();
        match err {
            TaskError::Failed { reason } => {
                assert!(reason.contains("code 3"), "{reason}");
                assert!(reason.contains("oops"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uses_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let handler = CommandHandler::new().with_working_dir(dir.path().to_path_buf());
        let out = handler.run(dispatched(job("pwd", "pwd"))).await.unwrap();
        let reported = std::fs::canonicalize(out.output.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }
}
