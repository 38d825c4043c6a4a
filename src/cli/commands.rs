//! CLI definition for fmripreproc.
//!
//! One invocation preprocesses one participant: it builds a
//! `PipelineConfig` from the arguments, runs the orchestrator and prints a
//! summary of what was launched and what was skipped.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::pipeline::{PipelineConfig, PipelineOrchestrator, PipelineReport};

/// fMRI preprocessing for a single BIDS participant.
#[derive(Parser, Debug)]
#[command(name = "fmripreproc")]
#[command(about = "Run the fMRI preprocessing pipeline for one BIDS participant")]
#[command(version)]
#[command(
    long_about = "fmripreproc runs brain extraction, fieldmap-based distortion correction, motion correction, segmentation, registration, SNR and confound estimation for one participant of a BIDS dataset.\n\nCompleted steps are detected from their outputs and skipped on re-runs.\n\nExample usage:\n  fmripreproc --in /data/bids --out /data/derivatives --participant-label 01 --fsl-dir /usr/local/fsl"
)]
pub struct Cli {
    /// Root of the input BIDS dataset.
    #[arg(short = 'i', long = "in", value_name = "BIDS_DIR")]
    pub input: PathBuf,

    /// Output root; derivatives are written under <OUT>/fmripreproc.
    #[arg(short = 'o', long = "out", value_name = "OUT_DIR")]
    pub output: PathBuf,

    /// Participant label, with or without the "sub-" prefix.
    #[arg(long)]
    pub participant_label: String,

    /// Work directory (default: <OUT>/scratch/sub-<label>).
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Directory containing the run_*.sh stage scripts.
    #[arg(long, env = "FMRIPREPROC_SCRIPTS_DIR", default_value = crate::pipeline::config::DEFAULT_SCRIPTS_DIR)]
    pub scripts_dir: PathBuf,

    /// FSL installation directory (standard templates).
    #[arg(long, env = "FSLDIR")]
    pub fsl_dir: Option<PathBuf>,

    /// Re-run steps whose outputs already exist.
    #[arg(long)]
    pub overwrite: bool,

    /// Remove the work directory after a successful run.
    #[arg(long)]
    pub clean_work_dir: bool,

    /// Run ICA-AROMA denoising.
    #[arg(long)]
    pub run_aroma: bool,

    /// Number of volumes trimmed from the start of each functional run.
    #[arg(long, default_value_t = crate::pipeline::config::DEFAULT_TRIM_VOLUMES)]
    pub trim_vols: u32,

    /// Maximum number of stage processes running at once (default: unbounded).
    #[arg(long)]
    pub nprocs: Option<usize>,

    /// Kill a stage process running longer than this many seconds.
    #[arg(long)]
    pub job_timeout_secs: Option<u64>,

    /// Print the run report as JSON instead of a text summary.
    #[arg(long)]
    pub json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Builds the pipeline configuration from the arguments.
    pub fn to_config(&self) -> PipelineConfig {
        let mut config =
            PipelineConfig::new(&self.participant_label, &self.input, &self.output)
                .with_scripts_dir(&self.scripts_dir)
                .with_overwrite(self.overwrite)
                .with_clean_work_dir(self.clean_work_dir)
                .with_aroma(self.run_aroma)
                .with_trim_volumes(self.trim_vols);

        if let Some(ref dir) = self.work_dir {
            config = config.with_work_dir(dir);
        }
        if let Some(ref dir) = self.fsl_dir {
            config = config.with_fsl_dir(dir);
        }
        if let Some(nprocs) = self.nprocs {
            config = config.with_max_parallel_jobs(nprocs);
        }
        if let Some(secs) = self.job_timeout_secs {
            config = config.with_job_timeout(Duration::from_secs(secs));
        }
        config
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows the caller to access parsed arguments (like log_level) before
/// running the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the pipeline.
///
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the pipeline with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = cli.to_config();
    info!(
        participant = %config.participant,
        input = %config.input_dir.display(),
        output = %config.output_dir.display(),
        "Preprocessing participant"
    );

    let orchestrator = PipelineOrchestrator::new(config)?;
    let report = orchestrator.run().await?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{json}");
    } else {
        print_summary(&report, orchestrator.config());
    }
    Ok(())
}

fn print_summary(report: &PipelineReport, config: &PipelineConfig) {
    println!("\n=== fmripreproc sub-{} ===", report.participant);
    println!("Run id:         {}", report.run_id);
    for stage in &report.stages {
        println!(
            "  {:<16} launched {:>3}  skipped {:>3}",
            stage.stage.as_str(),
            stage.launched(),
            stage.skipped()
        );
    }
    println!("Jobs launched:  {}", report.jobs_launched);
    println!("Files saved:    {}", report.derivatives_copied);
    println!("Derivatives:    {}", config.derivatives_root().display());
    if report.is_up_to_date() {
        println!("✓ Everything was already up to date");
    } else {
        println!("✓ Pipeline completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_arguments() {
        let cli = Cli::try_parse_from([
            "fmripreproc",
            "--in",
            "/data/bids",
            "--out",
            "/data/out",
            "--participant-label",
            "sub-07",
            "--scripts-dir",
            "/opt/scripts",
        ])
        .unwrap();
        let config = cli.to_config();

        assert_eq!(config.participant, "07");
        assert_eq!(config.input_dir, PathBuf::from("/data/bids"));
        assert_eq!(config.work_dir, PathBuf::from("/data/out/scratch/sub-07"));
        assert_eq!(config.scripts_dir, PathBuf::from("/opt/scripts"));
        assert_eq!(config.trim_volumes, 10);
        assert!(!config.run_aroma);
        assert!(config.max_parallel_jobs.is_none());
    }

    #[test]
    fn test_all_options() {
        let cli = Cli::try_parse_from([
            "fmripreproc",
            "-i",
            "/in",
            "-o",
            "/out",
            "--participant-label",
            "02",
            "--work-dir",
            "/scratch",
            "--scripts-dir",
            "/s",
            "--fsl-dir",
            "/fsl",
            "--overwrite",
            "--clean-work-dir",
            "--run-aroma",
            "--trim-vols",
            "5",
            "--nprocs",
            "3",
            "--job-timeout-secs",
            "600",
            "--json",
        ])
        .unwrap();
        let config = cli.to_config();

        assert_eq!(config.work_dir, PathBuf::from("/scratch"));
        assert_eq!(config.fsl_dir, Some(PathBuf::from("/fsl")));
        assert!(config.overwrite);
        assert!(config.clean_work_dir);
        assert!(config.run_aroma);
        assert_eq!(config.trim_volumes, 5);
        assert_eq!(config.max_parallel_jobs, Some(3));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(600)));
        assert!(cli.json);
    }

    #[test]
    fn test_participant_label_is_required() {
        assert!(Cli::try_parse_from(["fmripreproc", "--in", "/in", "--out", "/out"]).is_err());
    }
}
