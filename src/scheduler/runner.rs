//! Job runner for external stage processes.
//!
//! Each launched job runs as its own child process on an independent tokio
//! task. Launching never blocks; callers collect results with
//! [`JobRunner::join_all`], which waits for every handle regardless of how
//! the individual processes ended.
//!
//! # Features
//!
//! - Optional bound on concurrently running processes
//! - Optional per-job timeout (the job's whole process group is killed)
//! - Captured stdout/stderr written to a per-job log file
//! - Runner statistics tracking

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobOutcome};
use crate::error::JobError;

/// Configuration for the job runner.
#[derive(Debug, Clone, Default)]
pub struct JobRunnerConfig {
    /// Maximum number of processes running at once. `None` means unbounded.
    pub max_parallel: Option<usize>,
    /// Kill a process that runs longer than this. `None` disables the limit.
    pub timeout: Option<Duration>,
}

impl JobRunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of concurrent processes.
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max);
        self
    }

    /// Sets the per-job timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Statistics about jobs handled by a runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    /// Jobs launched.
    pub launched: u64,
    /// Jobs that exited with status zero.
    pub succeeded: u64,
    /// Jobs that failed, timed out or could not be spawned.
    pub failed: u64,
}

/// Shared state for tracking runner statistics.
#[derive(Default)]
struct SharedRunnerStats {
    launched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl SharedRunnerStats {
    fn snapshot(&self) -> RunnerStats {
        RunnerStats {
            launched: self.launched.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a launched job.
#[derive(Debug)]
pub struct JobHandle {
    name: String,
    handle: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Launches external jobs and waits for them.
pub struct JobRunner {
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
    stats: Arc<SharedRunnerStats>,
}

impl JobRunner {
    /// Creates a new runner.
    pub fn new(config: JobRunnerConfig) -> Self {
        Self {
            semaphore: config
                .max_parallel
                .filter(|max| *max > 0)
                .map(|max| Arc::new(Semaphore::new(max))),
            timeout: config.timeout,
            stats: Arc::new(SharedRunnerStats::default()),
        }
    }

    /// Starts `job` in the background and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(&self, job: Job) -> JobHandle {
        self.stats.launched.fetch_add(1, Ordering::SeqCst);
        info!(job = %job.name, command = %job.command_line(), "Launching job");

        let name = job.name.clone();
        let semaphore = self.semaphore.clone();
        let timeout = self.timeout;

        let handle = tokio::spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            match execute(&job, timeout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job = %job.name, error = %e, "Job could not be executed");
                    JobOutcome::spawn_failed(&job.name, e.to_string())
                }
            }
        });

        JobHandle { name, handle }
    }

    /// Waits for a single job.
    pub async fn join(&self, handle: JobHandle) -> JobOutcome {
        let outcome = match handle.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = JobError::Join {
                    name: handle.name.clone(),
                    reason: e.to_string(),
                };
                JobOutcome::spawn_failed(&handle.name, err.to_string())
            }
        };
        self.record(&outcome);
        outcome
    }

    /// Waits for every handle, in any order.
    ///
    /// Never fails because a job failed; inspect the returned outcomes.
    pub async fn join_all(&self, handles: Vec<JobHandle>) -> Vec<JobOutcome> {
        let futures: Vec<_> = handles.into_iter().map(|h| self.join(h)).collect();
        futures::future::join_all(futures).await
    }

    /// Launches `job` and waits for it.
    pub async fn run(&self, job: Job) -> JobOutcome {
        let handle = self.launch(job);
        self.join(handle).await
    }

    /// Returns the current runner statistics.
    pub fn stats(&self) -> RunnerStats {
        self.stats.snapshot()
    }

    fn record(&self, outcome: &JobOutcome) {
        let elapsed = outcome.duration().num_milliseconds();
        if outcome.is_success() {
            self.stats.succeeded.fetch_add(1, Ordering::SeqCst);
            info!(job = %outcome.name, elapsed_ms = elapsed, "Worker: {} finished", outcome.name);
            if !outcome.stderr.trim().is_empty() {
                debug!(job = %outcome.name, stderr = %outcome.stderr_tail(), "Job stderr");
            }
        } else {
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
            warn!(
                job = %outcome.name,
                status = %outcome.status,
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr_tail(),
                "Job did not succeed"
            );
        }
    }
}

/// How long to keep draining output pipes after a timed-out job is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

async fn execute(job: &Job, timeout: Option<Duration>) -> Result<JobOutcome, JobError> {
    let started_at = Utc::now();

    let mut command = Command::new(&job.program);
    command
        .args(&job.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so a timeout also reaches the tools a script started.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| JobError::Spawn {
        name: job.name.clone(),
        source,
    })?;
    let pid = child.id();
    let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_pipe(pipe)));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_pipe(pipe)));

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => {
                kill_process_group(&job.name, pid);
                if let Err(e) = child.kill().await {
                    debug!(job = %job.name, error = %e, "Child already gone");
                }
                None
            }
        },
        None => Some(child.wait().await?),
    };

    let (stdout, stderr) = match status {
        Some(_) => (collect(stdout).await, collect(stderr).await),
        None => (
            tokio::time::timeout(DRAIN_GRACE, collect(stdout))
                .await
                .unwrap_or_default(),
            tokio::time::timeout(DRAIN_GRACE, collect(stderr))
                .await
                .unwrap_or_default(),
        ),
    };

    let ending = match (status, timeout) {
        (Some(status), _) => status.to_string(),
        (None, Some(limit)) => format!("timed out after {limit:?}, process group killed"),
        (None, None) => "killed".to_string(),
    };
    if let Some(ref path) = job.log_path {
        if let Err(e) = write_log(path, job, &stdout, &stderr, &ending).await {
            warn!(job = %job.name, path = %path.display(), error = %e, "Failed to write job log");
        }
    }

    let outcome = match (status, timeout) {
        (Some(status), _) => JobOutcome::exited(&job.name, status.code(), stderr, started_at),
        (None, limit) => {
            let mut outcome =
                JobOutcome::timed_out(&job.name, limit.unwrap_or_default(), started_at);
            outcome.stderr = format!("{stderr}\n{}", outcome.stderr);
            outcome
        }
    };
    Ok(outcome)
}

async fn read_pipe(mut pipe: impl AsyncRead + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    // A read error leaves whatever arrived before it.
    let _ = pipe.read_to_end(&mut buf).await;
    buf
}

async fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    match reader {
        Some(handle) => handle
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(unix)]
fn kill_process_group(name: &str, pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(job = %name, pgid = pid, error = %e, "Could not kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_name: &str, _pid: Option<u32>) {}

async fn write_log(
    path: &Path,
    job: &Job,
    stdout: &str,
    stderr: &str,
    ending: &str,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(format!("$ {}\n", job.command_line()).as_bytes())
        .await?;
    file.write_all(b"--- stdout ---\n").await?;
    file.write_all(stdout.as_bytes()).await?;
    file.write_all(b"\n--- stderr ---\n").await?;
    file.write_all(stderr.as_bytes()).await?;
    file.write_all(format!("\n--- {ending} ---\n").as_bytes())
        .await?;
    file.flush().await
}
