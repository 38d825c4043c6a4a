//! Pipeline configuration for the orchestrator.
//!
//! One immutable `PipelineConfig` is built per invocation (from the command
//! line) and passed by reference into every stage. It carries the participant,
//! the input/output/work locations, the external tool locations and the
//! behavioural flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Directory holding the stage scripts when none is given.
pub const DEFAULT_SCRIPTS_DIR: &str = "/opt/fmripreproc/scripts";

/// Volumes removed from the start of every functional run by default.
pub const DEFAULT_TRIM_VOLUMES: u32 = 10;

/// Name of the derivative dataset under the output root.
pub const PIPELINE_NAME: &str = "fmripreproc";

/// Standard-space template, relative to the FSL installation.
const STANDARD_TEMPLATE: &str = "data/standard/MNI152_T1_2mm_brain.nii.gz";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is missing.
    #[error("Missing required setting: {0}")]
    Missing(String),

    /// A setting has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for one participant run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Participant and locations
    /// Participant label without the `sub-` prefix.
    pub participant: String,
    /// Root of the raw BIDS dataset.
    pub input_dir: PathBuf,
    /// Root of the output tree; derivatives go under `<output>/fmripreproc`.
    pub output_dir: PathBuf,
    /// Scratch directory for stage outputs.
    pub work_dir: PathBuf,

    // External tools
    /// Directory holding the `run_*.sh` stage scripts.
    pub scripts_dir: PathBuf,
    /// FSL installation, used to locate the standard template.
    pub fsl_dir: Option<PathBuf>,
    /// Program used to run the stage scripts.
    pub shell: String,

    // Behaviour
    /// Re-run units whose outputs already exist.
    pub overwrite: bool,
    /// Remove the work directory after a successful run.
    pub clean_work_dir: bool,
    /// Run the ICA-AROMA stages.
    pub run_aroma: bool,
    /// Volumes trimmed from the start of each functional run.
    pub trim_volumes: u32,

    // Execution
    /// Kill a stage process running longer than this.
    pub job_timeout: Option<Duration>,
    /// Bound on concurrently running stage processes.
    pub max_parallel_jobs: Option<usize>,
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    ///
    /// A `sub-` prefix on `participant` is stripped. The work directory
    /// defaults to `<output>/scratch/sub-<participant>`.
    pub fn new(
        participant: impl Into<String>,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let participant = participant.into();
        let participant = participant
            .strip_prefix("sub-")
            .unwrap_or(&participant)
            .to_string();
        let output_dir = output_dir.into();
        let work_dir = output_dir
            .join("scratch")
            .join(format!("sub-{participant}"));

        Self {
            participant,
            input_dir: input_dir.into(),
            output_dir,
            work_dir,

            scripts_dir: PathBuf::from(DEFAULT_SCRIPTS_DIR),
            fsl_dir: None,
            shell: "bash".to_string(),

            overwrite: false,
            clean_work_dir: false,
            run_aroma: false,
            trim_volumes: DEFAULT_TRIM_VOLUMES,

            job_timeout: None,
            max_parallel_jobs: None,
        }
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any value is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.participant.is_empty() {
            return Err(ConfigError::Missing("participant label".to_string()));
        }

        if !self
            .participant
            .chars()
            .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(ConfigError::InvalidValue {
                key: "participant".to_string(),
                message: format!("'{}' must be alphanumeric", self.participant),
            });
        }

        if !self.input_dir.is_dir() {
            return Err(ConfigError::ValidationFailed(format!(
                "input directory does not exist: {}",
                self.input_dir.display()
            )));
        }

        if !self.scripts_dir.is_dir() {
            return Err(ConfigError::ValidationFailed(format!(
                "scripts directory does not exist: {}",
                self.scripts_dir.display()
            )));
        }

        if self.shell.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "shell cannot be empty".to_string(),
            ));
        }

        // The work directory may be removed after the run.
        let shadows = |dir: &Path| dir == self.work_dir || is_within(dir, &self.work_dir);
        if shadows(&self.input_dir) || shadows(&self.output_dir) {
            return Err(ConfigError::ValidationFailed(
                "work_dir must not contain the input or output directory".to_string(),
            ));
        }

        if self.max_parallel_jobs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_parallel_jobs must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Root of the derivative dataset, `<output>/fmripreproc`.
    pub fn derivatives_root(&self) -> PathBuf {
        self.output_dir.join(PIPELINE_NAME)
    }

    /// Directory receiving per-job logs and the run report.
    pub fn logs_dir(&self) -> PathBuf {
        self.work_dir.join("logs")
    }

    /// Full path of a stage script.
    pub fn script_path(&self, script: &str) -> PathBuf {
        self.scripts_dir.join(script)
    }

    /// Location of the MNI152 2mm brain template, if FSL is configured.
    pub fn standard_template(&self) -> Option<PathBuf> {
        self.fsl_dir.as_deref().map(|dir| dir.join(STANDARD_TEMPLATE))
    }

    /// Builder method to set the work directory.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Builder method to set the scripts directory.
    pub fn with_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_dir = dir.into();
        self
    }

    /// Builder method to set the FSL directory.
    pub fn with_fsl_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fsl_dir = Some(dir.into());
        self
    }

    /// Builder method to set the shell program.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Builder method to enable or disable overwriting.
    pub fn with_overwrite(mut self, enabled: bool) -> Self {
        self.overwrite = enabled;
        self
    }

    /// Builder method to enable or disable work directory cleanup.
    pub fn with_clean_work_dir(mut self, enabled: bool) -> Self {
        self.clean_work_dir = enabled;
        self
    }

    /// Builder method to enable or disable the AROMA stages.
    pub fn with_aroma(mut self, enabled: bool) -> Self {
        self.run_aroma = enabled;
        self
    }

    /// Builder method to set the trimmed volume count.
    pub fn with_trim_volumes(mut self, volumes: u32) -> Self {
        self.trim_volumes = volumes;
        self
    }

    /// Builder method to set the per-job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Builder method to bound concurrent stage processes.
    pub fn with_max_parallel_jobs(mut self, max: usize) -> Self {
        self.max_parallel_jobs = Some(max);
        self
    }
}

/// Returns whether `path` lies inside `dir`.
fn is_within(path: &Path, dir: &Path) -> bool {
    path.starts_with(dir) && path != dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config(dir: &TempDir) -> PipelineConfig {
        let input = dir.path().join("bids");
        let scripts = dir.path().join("scripts");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&scripts).unwrap();
        PipelineConfig::new("01", input, dir.path().join("out")).with_scripts_dir(scripts)
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::new("sub-01", "/data/bids", "/data/out");
        assert_eq!(config.participant, "01");
        assert_eq!(config.work_dir, PathBuf::from("/data/out/scratch/sub-01"));
        assert_eq!(config.scripts_dir, PathBuf::from(DEFAULT_SCRIPTS_DIR));
        assert_eq!(config.shell, "bash");
        assert_eq!(config.trim_volumes, 10);
        assert!(!config.overwrite);
        assert!(!config.clean_work_dir);
        assert!(!config.run_aroma);
        assert!(config.job_timeout.is_none());
        assert!(config.max_parallel_jobs.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new("02", "/in", "/out")
            .with_work_dir("/scratch/sub-02")
            .with_scripts_dir("/opt/scripts")
            .with_fsl_dir("/usr/local/fsl")
            .with_shell("sh")
            .with_overwrite(true)
            .with_clean_work_dir(true)
            .with_aroma(true)
            .with_trim_volumes(4)
            .with_job_timeout(Duration::from_secs(60))
            .with_max_parallel_jobs(2);

        assert_eq!(config.work_dir, PathBuf::from("/scratch/sub-02"));
        assert_eq!(config.shell, "sh");
        assert!(config.overwrite);
        assert!(config.clean_work_dir);
        assert!(config.run_aroma);
        assert_eq!(config.trim_volumes, 4);
        assert_eq!(config.job_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_parallel_jobs, Some(2));
        assert_eq!(
            config.standard_template(),
            Some(PathBuf::from(
                "/usr/local/fsl/data/standard/MNI152_T1_2mm_brain.nii.gz"
            ))
        );
    }

    #[test]
    fn test_derived_paths() {
        let config = PipelineConfig::new("01", "/in", "/out").with_scripts_dir("/s");
        assert_eq!(config.derivatives_root(), PathBuf::from("/out/fmripreproc"));
        assert_eq!(config.logs_dir(), PathBuf::from("/out/scratch/sub-01/logs"));
        assert_eq!(config.script_path("run_bet.sh"), PathBuf::from("/s/run_bet.sh"));
        assert!(config.standard_template().is_none());
    }

    #[test]
    fn test_validation_valid_config() {
        let dir = TempDir::new().expect("failed to create temp dir");
        assert!(valid_config(&dir).validate().is_ok());
    }

    #[test]
    fn test_validation_missing_input() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let mut config = valid_config(&dir);
        config.input_dir = dir.path().join("missing");
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("input directory"));
    }

    #[test]
    fn test_validation_missing_scripts() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = valid_config(&dir).with_scripts_dir(dir.path().join("nope"));
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("scripts directory"));
    }

    #[test]
    fn test_validation_invalid_participant() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let mut config = valid_config(&dir);
        config.participant = "01_bad".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        config.participant = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_validation_zero_limits() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let result = valid_config(&dir).with_max_parallel_jobs(0).validate();
        assert!(result.unwrap_err().to_string().contains("max_parallel_jobs"));

        let result = valid_config(&dir)
            .with_job_timeout(Duration::ZERO)
            .validate();
        assert!(result.unwrap_err().to_string().contains("job_timeout"));
    }

    #[test]
    fn test_validation_work_dir_containing_input() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = valid_config(&dir).with_work_dir(dir.path());
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("work_dir"));
    }

    #[test]
    fn test_validation_accepts_default_work_dir_under_output() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = valid_config(&dir);
        assert!(is_within(&config.work_dir, &config.output_dir));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_is_within() {
        assert!(is_within(Path::new("/out/scratch/sub-01"), Path::new("/out")));
        assert!(!is_within(Path::new("/out"), Path::new("/out")));
        assert!(!is_within(Path::new("/other"), Path::new("/out")));
    }
}
