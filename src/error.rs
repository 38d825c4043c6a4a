//! Error types for fmripreproc operations.
//!
//! Defines error types for the major subsystems:
//! - Path pattern parsing and derivative path building
//! - BIDS layout indexing and sidecar metadata
//! - External job execution
//! - Fieldmap pairing and intended-for matching
//! - Confounds aggregation
//! - Derivative writing
//! - Stage execution

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while parsing or rendering a path pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("Unbalanced '{bracket}' at byte {position} in pattern '{pattern}'")]
    UnbalancedBracket {
        pattern: String,
        bracket: char,
        position: usize,
    },

    #[error("Nested optional segment at byte {position} in pattern '{pattern}'")]
    NestedOptional { pattern: String, position: usize },

    #[error("Empty placeholder at byte {position} in pattern '{pattern}'")]
    EmptyPlaceholder { pattern: String, position: usize },

    #[error("Unknown entity key '{0}' in pattern")]
    UnknownKey(String),

    #[error("Required entity '{key}' is missing")]
    MissingRequired { key: String },
}

/// Errors that can occur while indexing a BIDS dataset.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("BIDS directory does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("Failed to walk dataset tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Invalid sidecar '{path}': {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while launching or awaiting an external job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to spawn job '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Job '{name}' task panicked or was aborted: {reason}")]
    Join { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while pairing fieldmaps or matching them to functional runs.
#[derive(Debug, Error)]
pub enum FieldmapError {
    #[error("Topup cannot be run: found {count} fieldmaps, an even number of AP/PA images is required")]
    OddCount { count: usize },

    #[error("Topup cannot be run: no fieldmaps found for participant")]
    NoFieldmaps,

    #[error("Topup cannot be run: fieldmap group run-{run_id} holds {count} images, expected an AP/PA pair")]
    IncompletePair { run_id: String, count: usize },

    #[error("Topup cannot be run: fieldmap group run-{run_id} is missing the {direction} image")]
    MissingDirection { run_id: String, direction: String },

    #[error("Fieldmap '{file}' is missing required metadata '{key}'")]
    MissingMetadata { file: String, key: String },

    #[error("Cannot identify fieldmap intended for distortion correction of '{file}'")]
    NoMatch { file: String },

    #[error("Fieldmap match for '{file}' is ambiguous: claimed by {}", .dirs.join(", "))]
    AmbiguousMatch { file: String, dirs: Vec<String> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while merging confound metrics.
#[derive(Debug, Error)]
pub enum ConfoundsError {
    #[error("Continuous metric file is missing: {0}")]
    MissingMetric(PathBuf),

    #[error("Metric file '{path}' has no rows")]
    EmptyMetric { path: PathBuf },

    #[error("Column '{column}' has {actual} rows, expected {expected}")]
    RowCountMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid value '{value}' in '{path}' line {line}")]
    InvalidValue {
        path: PathBuf,
        line: usize,
        value: String,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while copying stage outputs into the derivative tree.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Stage output is missing: {0}")]
    MissingSource(PathBuf),

    #[error("Cannot name derivative, no source file: {0}")]
    MissingInput(String),

    #[error("Path pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while enumerating or executing a pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid metadata for '{file}': {reason}")]
    InvalidMetadata { file: String, reason: String },

    #[error("Pre-condition failed: {0}")]
    PreconditionFailed(String),

    #[error("Conflicting work units: {0}")]
    Conflict(String),

    #[error("Stage '{stage}' failed for {} unit(s): {}", .units.len(), .units.join(", "))]
    UnitsFailed { stage: String, units: Vec<String> },

    #[error("Fieldmap error: {0}")]
    Fieldmap(#[from] FieldmapError),

    #[error("Path pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
