//! Stage sequencing for one participant.
//!
//! # Architecture
//!
//! - **Config**: Paths, flags and concurrency limits for one invocation
//! - **Stage**: The fixed stage sequence, work units and the stage driver
//! - **Stages**: Work unit enumeration per stage against the current layout
//! - **Writer**: Copy plans that save stage outputs under BIDS derivative names
//! - **Orchestrator**: Runs the sequence, saves outputs and reloads the layout
//!
//! # Pipeline Flow
//!
//! 1. Bootstrap the work directory and the derivative dataset description
//! 2. Index the input dataset and the derivative tree
//! 3. For each stage: enumerate units, skip the complete ones, fan out the rest
//! 4. Save the stage outputs and reload the layout
//! 5. Write the run report, or remove the work directory
//!
//! # Example
//!
//! ```rust,ignore
//! use fmripreproc::pipeline::{PipelineConfig, PipelineOrchestrator};
//!
//! let config = PipelineConfig::new("01", "/data/bids", "/data/out")
//!     .with_fsl_dir("/usr/local/fsl")
//!     .with_max_parallel_jobs(4);
//!
//! let orchestrator = PipelineOrchestrator::new(config)?;
//! let report = orchestrator.run().await?;
//! println!("{} jobs launched", report.jobs_launched);
//! ```

pub mod config;
pub mod orchestrator;
pub mod stage;
pub mod stages;
pub mod writer;

// Re-export main types for convenience
pub use config::{ConfigError, PipelineConfig};
pub use orchestrator::{PipelineError, PipelineOrchestrator, PipelineReport};
pub use stage::{Stage, StageDriver, StageReport, UnitReport, UnitState, WorkUnit};
pub use stages::WorkPaths;
pub use writer::{CopyOp, DerivativeWriter};
