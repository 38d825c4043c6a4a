//! Work unit enumeration for each pipeline stage.
//!
//! Every function here inspects the layout (raw inputs and the derivatives
//! written so far) and returns the units of one stage, with the stage
//! script's positional arguments and the fixed relative paths its outputs
//! land at inside the work directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::config::PipelineConfig;
use super::stage::{check_distinct, Stage, WorkUnit};
use crate::error::StageError;
use crate::fieldmap::{self, FieldmapFile};
use crate::layout::{BidsLayout, FileRecord, Query, Scope};

/// Space label of derivatives still in acquisition space.
pub const NATIVE_SPACE: &str = "native";
/// Space label of anatomical-space derivatives.
pub const T1W_SPACE: &str = "T1w";
/// Space label of standard-space derivatives.
pub const STANDARD_SPACE: &str = "MNI152Nonlin2006";

/// Fixed locations of stage outputs inside the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPaths {
    root: PathBuf,
}

impl WorkPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `bet/t1bet`
    pub fn bet_dir(&self) -> PathBuf {
        self.root.join("bet").join("t1bet")
    }

    /// `topup`, parent of the per-pair `topup-NN` directories.
    pub fn topup_root(&self) -> PathBuf {
        self.root.join("topup")
    }

    pub fn distcorr_dir(&self) -> PathBuf {
        self.root.join("distcorrepi")
    }

    pub fn preproc_dir(&self) -> PathBuf {
        self.root.join("preproc")
    }

    pub fn seg_dir(&self) -> PathBuf {
        self.root.join("seg")
    }

    /// `reg/<key>`
    pub fn reg_dir(&self, key: &str) -> PathBuf {
        self.root.join("reg").join(key)
    }

    /// `snr/<key>/snr_calc/<task>/snr.nii.gz`
    pub fn snr_output(&self, key: &str, task: &str) -> PathBuf {
        self.root
            .join("snr")
            .join(key)
            .join("snr_calc")
            .join(task)
            .join("snr.nii.gz")
    }

    /// `confounds/<key>`
    pub fn confounds_dir(&self, key: &str) -> PathBuf {
        self.root.join("confounds").join(key)
    }

    /// `aroma/<key>`
    pub fn aroma_dir(&self, key: &str) -> PathBuf {
        self.root.join("aroma").join(key)
    }

    /// ICA model written by the AROMA ICA stage.
    pub fn melodic_output(&self, key: &str) -> PathBuf {
        self.aroma_dir(key)
            .join("melodic.ica")
            .join("melodic_IC.nii.gz")
    }
}

/// Enumerates the units of `stage`.
pub fn enumerate(
    stage: Stage,
    config: &PipelineConfig,
    layout: &BidsLayout,
) -> Result<Vec<WorkUnit>, StageError> {
    let units = match stage {
        Stage::BrainExtraction => brain_extraction(config, layout)?,
        Stage::Topup => topup(config, layout)?,
        Stage::DistortionCorrection => distortion_correction(config, layout)?,
        Stage::MotionCorrection => motion_correction(config, layout)?,
        Stage::Segmentation => segmentation(config, layout)?,
        Stage::Registration => registration(config, layout)?,
        Stage::Snr => snr(config, layout)?,
        Stage::Outliers => outliers(config, layout)?,
        Stage::AromaIca => aroma_ica(config, layout)?,
        Stage::AromaClassify => aroma_classify(config, layout)?,
    };
    check_distinct(&units)?;
    debug!(stage = %stage, units = units.len(), "Enumerated work units");
    Ok(units)
}

fn raw(config: &PipelineConfig) -> Query {
    Query::new(&config.participant)
        .extension("nii.gz")
        .scope(Scope::Raw)
}

fn derived(config: &PipelineConfig) -> Query {
    Query::new(&config.participant)
        .extension("nii.gz")
        .scope(Scope::Derivatives)
}

/// Motion-corrected functional runs in the derivative tree.
pub fn native_preproc_bold<'l>(config: &PipelineConfig, layout: &'l BidsLayout) -> Vec<&'l FileRecord> {
    layout.get(
        &derived(config)
            .suffix("bold")
            .space(NATIVE_SPACE)
            .desc("preproc"),
    )
}

/// Canonical run key of a functional file.
pub fn run_key(record: &FileRecord) -> Result<String, StageError> {
    record
        .entities
        .run_key()
        .ok_or_else(|| StageError::InvalidMetadata {
            file: record.filename.clone(),
            reason: "file has no task entity".to_string(),
        })
}

fn suffix_of(record: &FileRecord) -> &str {
    record.entities.suffix.as_deref().unwrap_or("unknown")
}

fn brain_t1w<'l>(config: &PipelineConfig, layout: &'l BidsLayout) -> Result<&'l FileRecord, StageError> {
    layout
        .first(
            &derived(config)
                .suffix("T1w")
                .space(T1W_SPACE)
                .desc("brain"),
        )
        .ok_or_else(|| StageError::MissingInput("brain-extracted T1w derivative".to_string()))
}

fn head_t1w<'l>(config: &PipelineConfig, layout: &'l BidsLayout) -> Result<&'l FileRecord, StageError> {
    layout
        .first(
            &derived(config)
                .suffix("T1w")
                .space(T1W_SPACE)
                .desc("skull"),
        )
        .ok_or_else(|| StageError::MissingInput("skull-on T1w derivative".to_string()))
}

fn brain_extraction(
    config: &PipelineConfig,
    layout: &BidsLayout,
) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let t1w = layout
        .first(&raw(config).suffix("T1w"))
        .ok_or_else(|| {
            StageError::MissingInput(format!("T1w image for sub-{}", config.participant))
        })?;

    Ok(vec![WorkUnit::new(Stage::BrainExtraction.as_str(), work.root())
        .input(&t1w.path)
        .arg(work.root().display().to_string())
        .output(work.bet_dir().join("struc_acpc_brain.nii.gz"))])
}

fn topup(config: &PipelineConfig, layout: &BidsLayout) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let mut fieldmaps = Vec::new();
    for record in layout.get(&raw(config).suffix("epi")) {
        fieldmaps.push(FieldmapFile {
            path: record.path.clone(),
            filename: record.filename.clone(),
            entities: record.entities.clone(),
            metadata: record.metadata()?,
        });
    }

    let topup_root = work.topup_root();
    let mut units = Vec::new();
    for pair in fieldmap::pair_fieldmaps(&fieldmaps)? {
        let pair_dir = pair.work_dir(&topup_root);
        // Later stages resolve their pair through this list, even when
        // topup itself is skipped.
        fieldmap::persist_intended_for(&pair, &pair_dir)?;

        units.push(
            WorkUnit::new(format!("topup-{}", pair.run_id), &pair_dir)
                .input(&pair.ap)
                .input(&pair.pa)
                .arg(pair_dir.display().to_string())
                .arg(pair.total_readout_time.to_string())
                .output(pair_dir.join("topup4_field_APPA.nii.gz")),
        );
    }
    Ok(units)
}

/// Acquisition parameters and topup field for a phase-encoding direction.
fn phase_encoding_params(record: &FileRecord) -> Result<(&'static str, &'static str), StageError> {
    let metadata = record.metadata()?;
    let direction = metadata
        .get("PhaseEncodingDirection")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StageError::InvalidMetadata {
            file: record.filename.clone(),
            reason: "missing PhaseEncodingDirection".to_string(),
        })?;
    match direction {
        "j-" => Ok(("topup4_field_APPA", "acqparams_AP.txt")),
        "j" => Ok(("topup4_field_PAAP", "acqparams_PA.txt")),
        other => Err(StageError::InvalidMetadata {
            file: record.filename.clone(),
            reason: format!("unsupported PhaseEncodingDirection '{other}'"),
        }),
    }
}

fn distortion_correction(
    config: &PipelineConfig,
    layout: &BidsLayout,
) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let topup_root = work.topup_root();
    let mut units = Vec::new();

    for func in layout.get(&raw(config).suffix("bold").suffix("sbref")) {
        let (field, params) = phase_encoding_params(func)?;
        let topup_dir = fieldmap::resolve_topup_dir(&topup_root, &func.filename)?;
        let key = run_key(func)?;

        units.push(
            WorkUnit::new(
                format!("{}-{key}-{}", Stage::DistortionCorrection, suffix_of(func)),
                work.distcorr_dir(),
            )
            .input(&func.path)
            .arg(field)
            .arg(params)
            .arg(work.root().display().to_string())
            .arg(topup_dir.display().to_string())
            .output(work.distcorr_dir().join(format!("dc_{}", func.filename))),
        );
    }
    Ok(units)
}

fn motion_correction(
    config: &PipelineConfig,
    layout: &BidsLayout,
) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let mut units = Vec::new();

    for func in layout.get(&raw(config).suffix("bold")) {
        let key = run_key(func)?;
        units.push(
            WorkUnit::new(format!("{}-{key}", Stage::MotionCorrection), work.preproc_dir())
                .input(&func.path)
                .arg(key.as_str())
                .arg(work.root().display().to_string())
                .arg(config.trim_volumes.to_string())
                .output(work.preproc_dir().join(format!("{key}_mcf.nii.gz"))),
        );
    }
    Ok(units)
}

fn segmentation(
    config: &PipelineConfig,
    layout: &BidsLayout,
) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let t1_brain = brain_t1w(config, layout)?;

    let mut unit = WorkUnit::new(Stage::Segmentation.as_str(), work.seg_dir())
        .input(&t1_brain.path)
        .arg(work.root().display().to_string());
    for class in 0..3 {
        unit = unit.output(
            work.seg_dir()
                .join(format!("struc_acpc_brain_pve_{class}.nii.gz")),
        );
    }
    Ok(vec![unit])
}

fn registration(
    config: &PipelineConfig,
    layout: &BidsLayout,
) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let template = config.standard_template().ok_or_else(|| {
        StageError::MissingInput("FSL directory is not set (use --fsl-dir or FSLDIR)".to_string())
    })?;
    if !template.is_file() {
        return Err(StageError::MissingInput(format!(
            "standard template {}",
            template.display()
        )));
    }
    let t1_brain = brain_t1w(config, layout)?;
    let t1_head = head_t1w(config, layout)?;

    let mut units = Vec::new();
    for func in native_preproc_bold(config, layout) {
        let key = run_key(func)?;
        units.push(
            WorkUnit::new(
                format!("{}-{key}-{}", Stage::Registration, suffix_of(func)),
                work.reg_dir(&key),
            )
            .input(&func.path)
            .input(&t1_head.path)
            .input(&t1_brain.path)
            .input(&template)
            .arg(work.root().display().to_string())
            .output(work.reg_dir(&key).join("func_data2standard.nii.gz")),
        );
    }
    Ok(units)
}

fn snr(config: &PipelineConfig, layout: &BidsLayout) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let t1_brain = brain_t1w(config, layout)?;

    let mut units = Vec::new();
    for func in native_preproc_bold(config, layout) {
        let key = run_key(func)?;
        if !work.reg_dir(&key).join("func_data2standard.nii.gz").exists() {
            debug!(run = %key, "Run is not registered, no SNR unit");
            continue;
        }
        let task = func.entities.task.as_deref().unwrap_or_default();
        units.push(
            WorkUnit::new(
                format!("{}-{key}-{}", Stage::Snr, suffix_of(func)),
                work.root().join("snr").join(&key),
            )
            .input(&func.path)
            .input(&t1_brain.path)
            .arg(work.root().display().to_string())
            .output(work.snr_output(&key, task)),
        );
    }
    Ok(units)
}

fn outliers(config: &PipelineConfig, layout: &BidsLayout) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let mut units = Vec::new();

    for mcf in native_preproc_bold(config, layout) {
        let key = run_key(mcf)?;
        let raw_bold = layout
            .first(&raw(config).suffix("bold").like(&mcf.entities))
            .ok_or_else(|| {
                StageError::MissingInput(format!("raw functional image for {}", mcf.filename))
            })?;
        let dir = work.confounds_dir(&key);

        units.push(
            WorkUnit::new(format!("{}-{key}", Stage::Outliers), &dir)
                .input(&raw_bold.path)
                .input(&mcf.path)
                .arg(work.root().display().to_string())
                .arg(key.as_str())
                .output(dir.join("dvars_metrics.txt"))
                .output(dir.join("fd_metrics.txt")),
        );
    }
    Ok(units)
}

fn aroma_ica(config: &PipelineConfig, layout: &BidsLayout) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let mut units = Vec::new();

    for func in native_preproc_bold(config, layout) {
        let key = run_key(func)?;
        units.push(
            WorkUnit::new(format!("{}-{key}", Stage::AromaIca), work.aroma_dir(&key))
                .input(&func.path)
                .arg(work.root().display().to_string())
                .arg(key.as_str())
                .output(work.melodic_output(&key)),
        );
    }
    Ok(units)
}

fn aroma_classify(
    config: &PipelineConfig,
    layout: &BidsLayout,
) -> Result<Vec<WorkUnit>, StageError> {
    let work = WorkPaths::new(&config.work_dir);
    let mut units = Vec::new();

    for func in native_preproc_bold(config, layout) {
        let key = run_key(func)?;
        let model = work.melodic_output(&key);
        if !model.exists() {
            return Err(StageError::PreconditionFailed(format!(
                "ICA model {} is missing for run {key}",
                model.display()
            )));
        }
        units.push(
            WorkUnit::new(format!("{}-{key}", Stage::AromaClassify), work.aroma_dir(&key))
                .input(&func.path)
                .input(work.reg_dir(&key))
                .arg(work.root().display().to_string())
                .arg(key.as_str())
                .output(work.aroma_dir(&key).join("denoised_func_data_nonaggr.nii.gz")),
        );
    }
    Ok(units)
}
