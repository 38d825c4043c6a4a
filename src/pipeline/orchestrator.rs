//! Pipeline orchestrator for one participant.
//!
//! This module provides the main `PipelineOrchestrator` that coordinates:
//! - Stage enumeration against the current layout
//! - Stage execution through the stage driver
//! - Saving stage outputs into the derivative tree
//! - Confounds aggregation
//! - Work directory cleanup
//!
//! Stages run strictly in sequence. After every save the layout is reloaded
//! so that later stages see the new derivatives.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::config::{ConfigError, PipelineConfig, PIPELINE_NAME};
use super::stage::{Stage, StageDriver, StageReport};
use super::stages::{self, WorkPaths};
use super::writer::{CopyOp, DerivativeWriter};
use crate::confounds;
use crate::error::{ConfoundsError, LayoutError, StageError, WriterError};
use crate::layout::BidsLayout;

/// File name of the run report inside the log directory.
pub const REPORT_FILE: &str = "pipeline_report.json";

/// BIDS version declared in the derivative dataset description.
const BIDS_VERSION: &str = "1.4.0";

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The input dataset could not be indexed.
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),

    /// A stage could not be enumerated or one of its units failed.
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// Stage outputs could not be saved.
    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),

    /// Confound metrics could not be merged.
    #[error("Confounds error: {0}")]
    Confounds(#[from] ConfoundsError),

    /// Filesystem error outside a stage.
    #[error("IO error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run report could not be serialized.
    #[error("Report error: {0}")]
    Report(#[from] serde_json::Error),
}

/// Summary of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Unique id of this invocation.
    pub run_id: Uuid,
    /// Participant label.
    pub participant: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One report per executed stage, in order.
    pub stages: Vec<StageReport>,
    /// External processes launched across all stages.
    pub jobs_launched: u64,
    /// Files copied into the derivative tree.
    pub derivatives_copied: usize,
    /// Confounds tables (re)written.
    pub confounds_written: usize,
}

impl PipelineReport {
    /// Report of `stage`, if it ran.
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Whether every unit of every stage was skipped.
    pub fn is_up_to_date(&self) -> bool {
        self.jobs_launched == 0
    }
}

/// Main pipeline orchestrator.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    writer: DerivativeWriter,
}

impl PipelineOrchestrator {
    /// Creates a new orchestrator with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the configuration is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let writer = DerivativeWriter::new(&config)?;
        Ok(Self { config, writer })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every stage for the participant.
    ///
    /// Any error aborts the run immediately; completed outputs stay in place
    /// and are skipped on the next invocation.
    #[instrument(skip(self), fields(participant = %self.config.participant))]
    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, work_dir = %self.config.work_dir.display(), "Starting pipeline");

        create_dir(&self.config.work_dir)?;
        create_dir(&self.config.logs_dir())?;
        self.write_dataset_description()?;

        let derivatives = self.config.derivatives_root();
        let mut layout = BidsLayout::load(&self.config.input_dir, Some(&derivatives))?;
        let driver = StageDriver::new(&self.config);

        let mut stage_reports = Vec::new();
        let mut derivatives_copied = 0;
        let mut confounds_written = 0;

        for stage in Stage::SEQUENCE {
            if stage.is_aroma() && !self.config.run_aroma {
                debug!(stage = %stage, "AROMA disabled");
                continue;
            }

            let units = stages::enumerate(stage, &self.config, &layout)?;
            let report = driver.run_stage(stage, units).await?;
            let mut force = report.ran_any();
            stage_reports.push(report);

            if stage == Stage::Outliers {
                confounds_written += self.aggregate_confounds(&layout)?;
                force |= confounds_written > 0;
            }

            if let Some(plan) = self.save_plan(stage, &layout)? {
                derivatives_copied += self.writer.apply(&plan, force)?;
                layout = layout.reload()?;
            }
        }

        let report = PipelineReport {
            run_id,
            participant: self.config.participant.clone(),
            started_at,
            finished_at: Utc::now(),
            stages: stage_reports,
            jobs_launched: driver.runner_stats().launched,
            derivatives_copied,
            confounds_written,
        };

        if self.config.clean_work_dir {
            info!(work_dir = %self.config.work_dir.display(), "Removing work directory");
            fs::remove_dir_all(&self.config.work_dir).map_err(|source| PipelineError::Io {
                path: self.config.work_dir.clone(),
                source,
            })?;
        } else {
            self.write_report(&report)?;
        }

        info!(
            %run_id,
            jobs = report.jobs_launched,
            copied = report.derivatives_copied,
            "Pipeline finished"
        );
        Ok(report)
    }

    /// Copy plan saving the outputs of `stage`, if it has any.
    fn save_plan(
        &self,
        stage: Stage,
        layout: &BidsLayout,
    ) -> Result<Option<Vec<CopyOp>>, WriterError> {
        let plan = match stage {
            Stage::BrainExtraction => self.writer.plan_brain_extraction(layout)?,
            Stage::MotionCorrection => self.writer.plan_motion_correction(layout)?,
            Stage::Segmentation => self.writer.plan_segmentation(layout)?,
            Stage::Registration => self.writer.plan_registration(layout)?,
            Stage::Snr => self.writer.plan_snr(layout)?,
            Stage::Outliers => self.writer.plan_confounds(layout)?,
            Stage::AromaClassify => self.writer.plan_aroma(layout)?,
            Stage::Topup | Stage::DistortionCorrection | Stage::AromaIca => return Ok(None),
        };
        Ok(Some(plan))
    }

    /// Merges each run's metrics into `confounds.tsv`.
    ///
    /// Returns how many tables changed on disk.
    fn aggregate_confounds(&self, layout: &BidsLayout) -> Result<usize, PipelineError> {
        let work = WorkPaths::new(&self.config.work_dir);
        let mut written = 0;
        for func in stages::native_preproc_bold(&self.config, layout) {
            let key = stages::run_key(func)?;
            let run_dir = work.confounds_dir(&key);
            let table = confounds::aggregate(&run_dir, &key)?;
            if table.write_tsv(&confounds::table_path(&run_dir))? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Writes `dataset_description.json` at the derivative root if absent.
    fn write_dataset_description(&self) -> Result<(), PipelineError> {
        let root = self.config.derivatives_root();
        let path = root.join("dataset_description.json");
        if path.exists() {
            return Ok(());
        }
        create_dir(&root)?;

        let description = json!({
            "Name": format!("{PIPELINE_NAME} derivatives"),
            "BIDSVersion": BIDS_VERSION,
            "DatasetType": "derivative",
            "GeneratedBy": [{
                "Name": PIPELINE_NAME,
                "Version": env!("CARGO_PKG_VERSION"),
            }],
        });
        write_file(&path, &serde_json::to_string_pretty(&description)?)?;
        info!(path = %path.display(), "Created derivative dataset description");
        Ok(())
    }

    fn write_report(&self, report: &PipelineReport) -> Result<(), PipelineError> {
        let path = self.config.logs_dir().join(REPORT_FILE);
        write_file(&path, &serde_json::to_string_pretty(report)?)?;
        debug!(path = %path.display(), "Wrote pipeline report");
        Ok(())
    }
}

fn create_dir(dir: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(dir).map_err(|source| PipelineError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, content: &str) -> Result<(), PipelineError> {
    fs::write(path, content).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> PipelineConfig {
        let root = dir.path();
        fs::create_dir_all(root.join("bids/sub-01/anat")).unwrap();
        fs::create_dir_all(root.join("scripts")).unwrap();
        PipelineConfig::new("01", root.join("bids"), root.join("out"))
            .with_scripts_dir(root.join("scripts"))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = config(&dir).with_scripts_dir(dir.path().join("missing"));
        assert!(matches!(
            PipelineOrchestrator::new(config),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_t1w_aborts_before_launching() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let orchestrator = PipelineOrchestrator::new(config(&dir)).unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage(StageError::MissingInput(_))
        ));
        // bootstrap happened before the failure
        let description = orchestrator
            .config()
            .derivatives_root()
            .join("dataset_description.json");
        let content = fs::read_to_string(description).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["DatasetType"], "derivative");
        assert_eq!(value["GeneratedBy"][0]["Name"], "fmripreproc");
    }

    #[test]
    fn test_dataset_description_not_overwritten() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let orchestrator = PipelineOrchestrator::new(config(&dir)).unwrap();
        let root = orchestrator.config().derivatives_root();
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("dataset_description.json"), "{\"Name\": \"mine\"}").unwrap();

        orchestrator.write_dataset_description().unwrap();
        assert_eq!(
            fs::read_to_string(root.join("dataset_description.json")).unwrap(),
            "{\"Name\": \"mine\"}"
        );
    }

    #[test]
    fn test_report_helpers() {
        let report = PipelineReport {
            run_id: Uuid::new_v4(),
            participant: "01".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            stages: vec![StageReport::empty(Stage::BrainExtraction)],
            jobs_launched: 0,
            derivatives_copied: 0,
            confounds_written: 0,
        };
        assert!(report.is_up_to_date());
        assert!(report.stage(Stage::BrainExtraction).is_some());
        assert!(report.stage(Stage::Snr).is_none());

        let json = serde_json::to_string(&report).unwrap();
        let parsed: PipelineReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.run_id, report.run_id);
    }
}
