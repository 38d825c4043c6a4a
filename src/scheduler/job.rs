//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by the job runner:
//!
//! - `Job`: One external process invocation
//! - `JobOutcome`: Result of a finished job, including its exit code
//! - `JobStatus`: How a job ended

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of trailing stderr lines kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// A single external process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Deterministic name used for log correlation (e.g. `preproc-rest01`).
    pub name: String,
    /// Program to execute.
    pub program: String,
    /// Positional arguments.
    pub args: Vec<String>,
    /// File receiving captured stdout and stderr, if any.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Job {
    /// Creates a new job running `program` with no arguments.
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            log_path: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the log file for captured output.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Renders the command line for logging.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Process exited with status zero.
    Succeeded,
    /// Process exited non-zero or was killed by a signal.
    Failed,
    /// Process exceeded the configured timeout and was killed.
    TimedOut,
    /// Process could not be started.
    SpawnFailed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::TimedOut => write!(f, "timed_out"),
            JobStatus::SpawnFailed => write!(f, "spawn_failed"),
        }
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Name of the job.
    pub name: String,
    /// Final status.
    pub status: JobStatus,
    /// Exit code, when the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured standard error.
    pub stderr: String,
    /// When the job was launched.
    pub started_at: DateTime<Utc>,
    /// When the job finished.
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    /// Creates an outcome from a process exit.
    pub fn exited(
        name: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let status = if exit_code == Some(0) {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        Self {
            name: name.into(),
            status,
            exit_code,
            stderr: stderr.into(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Creates an outcome for a job killed after `timeout`.
    pub fn timed_out(name: impl Into<String>, timeout: Duration, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status: JobStatus::TimedOut,
            exit_code: None,
            stderr: format!("killed after {}s timeout", timeout.as_secs()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Creates an outcome for a job that never started.
    pub fn spawn_failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status: JobStatus::SpawnFailed,
            exit_code: None,
            stderr: error.into(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Returns whether the process exited with status zero.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Succeeded
    }

    /// Wall-clock duration of the job.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Last few lines of stderr, for diagnostics.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder() {
        let job = Job::new("bet", "bash")
            .arg("/scripts/run_bet.sh")
            .args(["/data/sub-01_T1w.nii.gz", "/work"])
            .with_log_path("/work/logs/bet.log");

        assert_eq!(job.name, "bet");
        assert_eq!(job.args.len(), 3);
        assert_eq!(
            job.command_line(),
            "bash /scripts/run_bet.sh /data/sub-01_T1w.nii.gz /work"
        );
        assert_eq!(job.log_path, Some(PathBuf::from("/work/logs/bet.log")));
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(format!("{}", JobStatus::Succeeded), "succeeded");
        assert_eq!(format!("{}", JobStatus::Failed), "failed");
        assert_eq!(format!("{}", JobStatus::TimedOut), "timed_out");
        assert_eq!(format!("{}", JobStatus::SpawnFailed), "spawn_failed");
    }

    #[test]
    fn test_outcome_from_exit_code() {
        let started = Utc::now();
        assert!(JobOutcome::exited("a", Some(0), "", started).is_success());

        let failed = JobOutcome::exited("b", Some(2), "boom", started);
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(!failed.is_success());

        let signalled = JobOutcome::exited("c", None, "", started);
        assert_eq!(signalled.status, JobStatus::Failed);
    }

    #[test]
    fn test_outcome_timeout_and_spawn_failure() {
        let timed_out = JobOutcome::timed_out("t", Duration::from_secs(5), Utc::now());
        assert_eq!(timed_out.status, JobStatus::TimedOut);
        assert!(timed_out.stderr.contains("5s"));

        let spawn = JobOutcome::spawn_failed("s", "No such file");
        assert_eq!(spawn.status, JobStatus::SpawnFailed);
        assert!(!spawn.is_success());
    }

    #[test]
    fn test_stderr_tail() {
        let stderr: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let outcome = JobOutcome::exited("x", Some(1), stderr, Utc::now());
        let tail = outcome.stderr_tail();
        assert_eq!(tail.lines().count(), STDERR_TAIL_LINES);
        assert!(tail.ends_with("line 49"));
    }

    #[test]
    fn test_job_serialization() {
        let job = Job::new("topup-01", "bash").arg("run_topup.sh");
        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");
        assert_eq!(parsed, job);
    }
}
