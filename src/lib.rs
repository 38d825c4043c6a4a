//! fmripreproc: fMRI minimal preprocessing for one BIDS participant.
//!
//! This library indexes a BIDS dataset, runs the external preprocessing
//! stages in a fixed order with parallel fan-out inside each stage, and
//! saves the results under BIDS derivative names. Completed work is
//! detected from its outputs so re-runs only do what is missing.

pub mod cli;
pub mod confounds;
pub mod entity;
pub mod error;
pub mod fieldmap;
pub mod layout;
pub mod pipeline;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{
    ConfoundsError, FieldmapError, JobError, LayoutError, PatternError, StageError, WriterError,
};
