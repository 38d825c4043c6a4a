//! Stage driver: the skip / launch / join / verify template shared by every
//! pipeline stage.
//!
//! A stage is described by a list of [`WorkUnit`]s. Units whose expected
//! outputs already exist are skipped (unless overwrite is requested), the
//! rest are launched concurrently through the [`JobRunner`] and joined before
//! the driver returns. A unit only counts as done when its process exited
//! zero and every expected output is present afterwards. A failed unit's
//! outputs are deleted so that a later invocation does not skip it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use super::config::PipelineConfig;
use crate::error::StageError;
use crate::scheduler::{Job, JobOutcome, JobRunner, JobRunnerConfig, RunnerStats};

/// The fixed pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BrainExtraction,
    Topup,
    DistortionCorrection,
    MotionCorrection,
    Segmentation,
    Registration,
    Snr,
    Outliers,
    AromaIca,
    AromaClassify,
}

impl Stage {
    /// Every stage in execution order.
    pub const SEQUENCE: [Stage; 10] = [
        Stage::BrainExtraction,
        Stage::Topup,
        Stage::DistortionCorrection,
        Stage::MotionCorrection,
        Stage::Segmentation,
        Stage::Registration,
        Stage::Snr,
        Stage::Outliers,
        Stage::AromaIca,
        Stage::AromaClassify,
    ];

    /// Script invoked for each unit of this stage.
    pub fn script_name(&self) -> &'static str {
        match self {
            Stage::BrainExtraction => "run_bet.sh",
            Stage::Topup => "run_topup.sh",
            Stage::DistortionCorrection => "run_distcorrepi.sh",
            Stage::MotionCorrection => "run_preprocess.sh",
            Stage::Segmentation => "run_seg.sh",
            Stage::Registration => "run_registration.sh",
            Stage::Snr => "run_snr.sh",
            Stage::Outliers => "run_outliers.sh",
            Stage::AromaIca => "run_aroma_ica.sh",
            Stage::AromaClassify => "run_aroma_classify.sh",
        }
    }

    /// Short name used in job names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BrainExtraction => "bet",
            Stage::Topup => "topup",
            Stage::DistortionCorrection => "distcorrepi",
            Stage::MotionCorrection => "preproc",
            Stage::Segmentation => "seg",
            Stage::Registration => "registration",
            Stage::Snr => "snr",
            Stage::Outliers => "outliers",
            Stage::AromaIca => "aroma-ica",
            Stage::AromaClassify => "aroma-classify",
        }
    }

    /// Whether the stage only runs when AROMA is enabled.
    pub fn is_aroma(&self) -> bool {
        matches!(self, Stage::AromaIca | Stage::AromaClassify)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One external invocation within a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Deterministic job name, `<stage>-<task><run>[-<suffix>]`.
    pub name: String,
    /// Files that must exist before the unit can run.
    pub inputs: Vec<PathBuf>,
    /// Positional arguments passed to the stage script.
    pub args: Vec<String>,
    /// Files whose joint existence means the unit is complete.
    pub expected_outputs: Vec<PathBuf>,
    /// Directory created before launching.
    pub work_dir: PathBuf,
}

impl WorkUnit {
    pub fn new(name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            args: Vec::new(),
            expected_outputs: Vec::new(),
            work_dir: work_dir.into(),
        }
    }

    /// Adds an input file, also passed as the next positional argument.
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.args.push(path.display().to_string());
        self.inputs.push(path);
        self
    }

    /// Adds a positional argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds an expected output.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.expected_outputs.push(path.into());
        self
    }

    /// Expected outputs not present on disk.
    pub fn missing_outputs(&self) -> Vec<&PathBuf> {
        self.expected_outputs.iter().filter(|p| !p.exists()).collect()
    }

    /// Whether every expected output exists.
    pub fn is_complete(&self) -> bool {
        !self.expected_outputs.is_empty() && self.missing_outputs().is_empty()
    }
}

/// Lifecycle of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Skipped,
    Running,
    Done,
    Failed,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Pending => write!(f, "pending"),
            UnitState::Skipped => write!(f, "skipped"),
            UnitState::Running => write!(f, "running"),
            UnitState::Done => write!(f, "done"),
            UnitState::Failed => write!(f, "failed"),
        }
    }
}

/// Final state of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub name: String,
    pub state: UnitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Why the unit failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl UnitReport {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: UnitState::Pending,
            exit_code: None,
            duration_ms: None,
            detail: None,
        }
    }

    fn skipped(name: &str) -> Self {
        Self {
            state: UnitState::Skipped,
            ..Self::pending(name)
        }
    }

    fn finished(unit: &WorkUnit, outcome: &JobOutcome) -> Self {
        let missing = unit.missing_outputs();
        let (state, detail) = if !outcome.is_success() {
            let reason = match outcome.exit_code {
                Some(code) => format!("{} with exit code {code}", outcome.status),
                None => outcome.status.to_string(),
            };
            (UnitState::Failed, Some(reason))
        } else if !missing.is_empty() {
            let paths: Vec<String> = missing.iter().map(|p| p.display().to_string()).collect();
            (
                UnitState::Failed,
                Some(format!("exited 0 but outputs are missing: {}", paths.join(", "))),
            )
        } else {
            (UnitState::Done, None)
        };

        Self {
            name: unit.name.clone(),
            state,
            exit_code: outcome.exit_code,
            duration_ms: Some(outcome.duration().num_milliseconds()),
            detail,
        }
    }
}

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub units: Vec<UnitReport>,
}

impl StageReport {
    /// Report for a stage that was not run at all.
    pub fn empty(stage: Stage) -> Self {
        Self {
            stage,
            units: Vec::new(),
        }
    }

    /// Whether any unit was executed in this invocation.
    pub fn ran_any(&self) -> bool {
        self.launched() > 0
    }

    pub fn launched(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.state, UnitState::Done | UnitState::Failed))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.count(UnitState::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(UnitState::Failed)
    }

    fn count(&self, state: UnitState) -> usize {
        self.units.iter().filter(|u| u.state == state).count()
    }
}

/// Rejects units that share a job name or an expected output.
///
/// Run keys carry only task and run, so the same run in two sessions maps
/// onto one name and one set of work files.
pub fn check_distinct(units: &[WorkUnit]) -> Result<(), StageError> {
    let mut names = HashSet::new();
    let mut outputs = HashSet::new();
    for unit in units {
        if !names.insert(unit.name.as_str()) {
            return Err(StageError::Conflict(format!(
                "job name '{}' is used by more than one unit",
                unit.name
            )));
        }
        if let Some(path) = unit.expected_outputs.iter().find(|p| !outputs.insert(p.as_path())) {
            return Err(StageError::Conflict(format!(
                "{} is an output of more than one unit",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Deletes whatever a failed unit left at its expected output paths.
fn discard_outputs(unit: &WorkUnit) {
    for path in unit.expected_outputs.iter().filter(|p| p.is_file()) {
        match std::fs::remove_file(path) {
            Ok(()) => info!(unit = %unit.name, path = %path.display(), "Removed output of failed unit"),
            Err(e) => error!(
                unit = %unit.name,
                path = %path.display(),
                error = %e,
                "Could not remove output of failed unit"
            ),
        }
    }
}

/// Runs stages through a shared job runner.
pub struct StageDriver<'a> {
    config: &'a PipelineConfig,
    runner: JobRunner,
}

impl<'a> StageDriver<'a> {
    /// Creates a driver whose runner honours the configured limits.
    pub fn new(config: &'a PipelineConfig) -> Self {
        let mut runner_config = JobRunnerConfig::new();
        if let Some(max) = config.max_parallel_jobs {
            runner_config = runner_config.with_max_parallel(max);
        }
        if let Some(timeout) = config.job_timeout {
            runner_config = runner_config.with_timeout(timeout);
        }
        Self {
            config,
            runner: JobRunner::new(runner_config),
        }
    }

    /// Statistics of every job launched so far.
    pub fn runner_stats(&self) -> RunnerStats {
        self.runner.stats()
    }

    /// Executes the outstanding units of `stage` and waits for all of them.
    ///
    /// # Errors
    ///
    /// - `Conflict` when two units share a job name or an expected output
    /// - `MissingInput` when an outstanding unit's input does not exist
    /// - `UnitsFailed` when any launched unit failed; every unit is joined
    ///   before this is returned
    #[instrument(skip(self, units), fields(stage = %stage, units = units.len()))]
    pub async fn run_stage(
        &self,
        stage: Stage,
        units: Vec<WorkUnit>,
    ) -> Result<StageReport, StageError> {
        check_distinct(&units)?;

        let mut reports: Vec<UnitReport> = Vec::with_capacity(units.len());
        let mut pending: Vec<(WorkUnit, usize)> = Vec::new();

        for unit in units {
            if !self.config.overwrite && unit.is_complete() {
                info!(unit = %unit.name, "Skipping {}: outputs already exist", unit.name);
                reports.push(UnitReport::skipped(&unit.name));
            } else {
                reports.push(UnitReport::pending(&unit.name));
                pending.push((unit, reports.len() - 1));
            }
        }

        // Nothing is launched unless every outstanding unit can run.
        for (unit, _) in &pending {
            if let Some(missing) = unit.inputs.iter().find(|p| !p.exists()) {
                return Err(StageError::MissingInput(format!(
                    "{} (needed by {})",
                    missing.display(),
                    unit.name
                )));
            }
        }

        let mut handles = Vec::with_capacity(pending.len());
        for (unit, index) in &pending {
            std::fs::create_dir_all(&unit.work_dir)?;
            let job = Job::new(&unit.name, &self.config.shell)
                .arg(self.config.script_path(stage.script_name()).display().to_string())
                .args(unit.args.iter().cloned())
                .with_log_path(self.config.logs_dir().join(format!("{}.log", unit.name)));
            handles.push(self.runner.launch(job));
            reports[*index].state = UnitState::Running;
        }

        if handles.is_empty() {
            info!("Stage {} is up to date", stage);
            return Ok(StageReport {
                stage,
                units: reports,
            });
        }

        let outcomes: HashMap<String, JobOutcome> = self
            .runner
            .join_all(handles)
            .await
            .into_iter()
            .map(|o| (o.name.clone(), o))
            .collect();

        let mut failures = Vec::new();
        for (unit, index) in &pending {
            let report = match outcomes.get(&unit.name) {
                Some(outcome) => UnitReport::finished(unit, outcome),
                None => UnitReport {
                    name: unit.name.clone(),
                    state: UnitState::Failed,
                    exit_code: None,
                    duration_ms: None,
                    detail: Some("job was never joined".to_string()),
                },
            };
            if report.state == UnitState::Failed {
                let detail = report.detail.as_deref().unwrap_or("failed");
                warn!(unit = %unit.name, detail, "Unit failed");
                discard_outputs(unit);
                failures.push(format!("{} ({detail})", unit.name));
            }
            reports[*index] = report;
        }

        let report = StageReport {
            stage,
            units: reports,
        };
        info!(
            launched = report.launched(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Stage {} finished",
            stage
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(StageError::UnitsFailed {
                stage: stage.to_string(),
                units: failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        config: PipelineConfig,
    }

    /// Config whose "shell" is `sh` and whose scripts live in a temp dir.
    fn fixture(scripts: &[(&str, &str)]) -> Fixture {
        let dir = TempDir::new().expect("failed to create temp dir");
        let root = dir.path().to_path_buf();
        let scripts_dir = root.join("scripts");
        fs::create_dir_all(&scripts_dir).unwrap();
        fs::create_dir_all(root.join("bids")).unwrap();
        for (name, body) in scripts {
            fs::write(scripts_dir.join(name), body).unwrap();
        }
        let config = PipelineConfig::new("01", root.join("bids"), root.join("out"))
            .with_scripts_dir(scripts_dir)
            .with_shell("sh");
        Fixture {
            _dir: dir,
            root,
            config,
        }
    }

    fn touch_unit(fx: &Fixture, name: &str) -> WorkUnit {
        let out = fx.root.join("work").join(format!("{name}.out"));
        WorkUnit::new(name, fx.root.join("work"))
            .arg(out.display().to_string())
            .output(out)
    }

    #[test]
    fn test_stage_sequence_and_names() {
        assert_eq!(Stage::SEQUENCE.len(), 10);
        assert_eq!(Stage::SEQUENCE[0], Stage::BrainExtraction);
        assert_eq!(Stage::SEQUENCE[9], Stage::AromaClassify);
        assert_eq!(Stage::Topup.script_name(), "run_topup.sh");
        assert_eq!(Stage::MotionCorrection.as_str(), "preproc");
        assert_eq!(Stage::AromaIca.to_string(), "aroma-ica");
        assert!(Stage::AromaClassify.is_aroma());
        assert!(!Stage::Snr.is_aroma());
    }

    #[test]
    fn test_work_unit_builder() {
        let unit = WorkUnit::new("bet", "/work")
            .input("/bids/sub-01_T1w.nii.gz")
            .arg("/work")
            .output("/work/bet/t1bet/struc_acpc_brain.nii.gz");
        assert_eq!(unit.args, vec!["/bids/sub-01_T1w.nii.gz", "/work"]);
        assert_eq!(unit.inputs.len(), 1);
        assert!(!unit.is_complete());
        assert_eq!(unit.missing_outputs().len(), 1);
    }

    #[test]
    fn test_unit_without_outputs_is_never_complete() {
        assert!(!WorkUnit::new("x", "/work").is_complete());
    }

    #[tokio::test]
    async fn test_runs_outstanding_units() {
        let fx = fixture(&[("run_snr.sh", "touch \"$1\"\n")]);
        let driver = StageDriver::new(&fx.config);

        let units = vec![touch_unit(&fx, "snr-rest01"), touch_unit(&fx, "snr-rest02")];
        let report = driver.run_stage(Stage::Snr, units).await.unwrap();

        assert!(report.ran_any());
        assert_eq!(report.launched(), 2);
        assert!(report.units.iter().all(|u| u.state == UnitState::Done));
        assert!(fx.root.join("work/snr-rest02.out").exists());
        assert!(fx.config.logs_dir().join("snr-rest01.log").exists());
        assert_eq!(driver.runner_stats().launched, 2);
    }

    #[tokio::test]
    async fn test_skips_complete_units() {
        let fx = fixture(&[("run_snr.sh", "touch \"$1\"\n")]);
        let driver = StageDriver::new(&fx.config);
        let unit = touch_unit(&fx, "snr-rest01");
        fs::create_dir_all(&unit.work_dir).unwrap();
        fs::write(&unit.expected_outputs[0], "done").unwrap();

        let report = driver.run_stage(Stage::Snr, vec![unit]).await.unwrap();
        assert!(!report.ran_any());
        assert_eq!(report.skipped(), 1);
        assert_eq!(driver.runner_stats().launched, 0);
    }

    #[tokio::test]
    async fn test_overwrite_reruns_complete_units() {
        let mut fx = fixture(&[("run_snr.sh", "touch \"$1\"\n")]);
        fx.config.overwrite = true;
        let driver = StageDriver::new(&fx.config);
        let unit = touch_unit(&fx, "snr-rest01");
        fs::create_dir_all(&unit.work_dir).unwrap();
        fs::write(&unit.expected_outputs[0], "done").unwrap();

        let report = driver.run_stage(Stage::Snr, vec![unit]).await.unwrap();
        assert!(report.ran_any());
        assert_eq!(driver.runner_stats().launched, 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_stage() {
        let fx = fixture(&[("run_snr.sh", "touch \"$1\"\nexit 2\n")]);
        let driver = StageDriver::new(&fx.config);

        let err = driver
            .run_stage(Stage::Snr, vec![touch_unit(&fx, "snr-rest01")])
            .await
            .unwrap_err();
        match err {
            StageError::UnitsFailed { stage, units } => {
                assert_eq!(stage, "snr");
                assert_eq!(units.len(), 1);
                assert!(units[0].contains("exit code 2"));
            }
            other => panic!("expected UnitsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_unit_is_not_skipped_on_rerun() {
        let fx = fixture(&[("run_snr.sh", "touch \"$1\"\nexit 2\n")]);

        let first = StageDriver::new(&fx.config);
        assert!(first
            .run_stage(Stage::Snr, vec![touch_unit(&fx, "snr-rest01")])
            .await
            .is_err());
        assert!(!fx.root.join("work/snr-rest01.out").exists());

        let second = StageDriver::new(&fx.config);
        assert!(matches!(
            second
                .run_stage(Stage::Snr, vec![touch_unit(&fx, "snr-rest01")])
                .await,
            Err(StageError::UnitsFailed { .. })
        ));
        assert_eq!(second.runner_stats().launched, 1);
    }

    #[tokio::test]
    async fn test_duplicate_units_are_rejected() {
        let fx = fixture(&[("run_preprocess.sh", "touch \"$1\"\n")]);
        let driver = StageDriver::new(&fx.config);

        let units = vec![
            touch_unit(&fx, "preproc-rest01"),
            touch_unit(&fx, "preproc-rest01"),
        ];
        assert!(matches!(
            driver.run_stage(Stage::MotionCorrection, units).await,
            Err(StageError::Conflict(_))
        ));
        assert_eq!(driver.runner_stats().launched, 0);
    }

    #[test]
    fn test_shared_output_is_a_conflict() {
        let units = vec![
            WorkUnit::new("preproc-ses-pre", "/work").output("/work/preproc/rest01_mcf.nii.gz"),
            WorkUnit::new("preproc-ses-post", "/work").output("/work/preproc/rest01_mcf.nii.gz"),
        ];
        assert!(matches!(check_distinct(&units), Err(StageError::Conflict(_))));
        assert!(check_distinct(&units[..1]).is_ok());
    }

    #[tokio::test]
    async fn test_zero_exit_without_outputs_fails_stage() {
        let fx = fixture(&[("run_snr.sh", "exit 0\n")]);
        let driver = StageDriver::new(&fx.config);

        let units = vec![touch_unit(&fx, "snr-rest01"), touch_unit(&fx, "snr-rest02")];
        let err = driver.run_stage(Stage::Snr, units).await.unwrap_err();
        match err {
            StageError::UnitsFailed { units, .. } => {
                assert_eq!(units.len(), 2);
                assert!(units[0].contains("outputs are missing"));
            }
            other => panic!("expected UnitsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_input_is_reported() {
        let fx = fixture(&[("run_bet.sh", "exit 0\n")]);
        let driver = StageDriver::new(&fx.config);
        let unit = WorkUnit::new("bet", fx.root.join("work"))
            .input(fx.root.join("bids/sub-01_T1w.nii.gz"))
            .output(fx.root.join("work/bet.out"));

        assert!(matches!(
            driver.run_stage(Stage::BrainExtraction, vec![unit]).await,
            Err(StageError::MissingInput(_))
        ));
        assert_eq!(driver.runner_stats().launched, 0);
    }

    #[test]
    fn test_report_serialization() {
        let report = StageReport {
            stage: Stage::DistortionCorrection,
            units: vec![UnitReport::skipped("distcorrepi-rest01-bold")],
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"distortion_correction\""));
        assert!(json.contains("\"skipped\""));
        assert!(!json.contains("exit_code"));
    }
}
