//! Parallel execution of external stage processes.
//!
//! This module provides the fan-out/fan-in infrastructure used by every
//! pipeline stage:
//!
//! - **Job**: One external process invocation with a deterministic name
//! - **JobRunner**: Launches jobs without blocking and joins them
//! - **JobOutcome**: Exit code and captured diagnostics of a finished job
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Stage Driver │
//!                      └──────┬───────┘
//!                             │ launch()
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Process │         │ Process │         │ Process │
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                             │ join_all()
//!                      ┌──────▼───────┐
//!                      │ JobOutcome[] │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use fmripreproc::scheduler::{Job, JobRunner, JobRunnerConfig};
//!
//! let runner = JobRunner::new(JobRunnerConfig::new().with_max_parallel(4));
//! let handles = vec![
//!     runner.launch(Job::new("preproc-rest01", "bash").args(["run_preprocess.sh", "..."])),
//!     runner.launch(Job::new("preproc-rest02", "bash").args(["run_preprocess.sh", "..."])),
//! ];
//! for outcome in runner.join_all(handles).await {
//!     println!("{}: {}", outcome.name, outcome.status);
//! }
//! ```

pub mod job;
pub mod runner;

pub use job::{Job, JobOutcome, JobStatus};
pub use runner::{JobHandle, JobRunner, JobRunnerConfig, RunnerStats};
