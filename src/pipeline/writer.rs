//! Derivative writer.
//!
//! Copies stage outputs from the work directory into the BIDS-derivative
//! tree. Destination names are always rendered from an [`Entity`] through
//! the derivative [`PathPattern`]s; stage code only chooses the overrides.
//!
//! Writing is split in two steps: `plan_*` computes the copy operations for a
//! stage, [`DerivativeWriter::apply`] performs them.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::config::PipelineConfig;
use super::stages::{WorkPaths, NATIVE_SPACE, STANDARD_SPACE, T1W_SPACE};
use crate::confounds;
use crate::entity::{
    Entity, EntityOverrides, PathPattern, DERIVATIVE_DIR_PATTERN, DERIVATIVE_PATTERN,
};
use crate::error::WriterError;
use crate::layout::{BidsLayout, FileRecord, Query, Scope};

/// One copy from the work directory into the derivative tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOp {
    /// Copy a single file.
    File { src: PathBuf, dst: PathBuf },
    /// Copy every file of `src` with the given extension into `dst`.
    Directory {
        src: PathBuf,
        dst: PathBuf,
        extension: String,
    },
}

impl CopyOp {
    pub fn destination(&self) -> &Path {
        match self {
            CopyOp::File { dst, .. } | CopyOp::Directory { dst, .. } => dst,
        }
    }
}

/// Names and writes derivative files for one participant.
#[derive(Debug, Clone)]
pub struct DerivativeWriter {
    participant: String,
    output_root: PathBuf,
    work: WorkPaths,
    file_pattern: PathPattern,
    dir_pattern: PathPattern,
}

impl DerivativeWriter {
    /// Creates a writer rooted at the configured output directory.
    pub fn new(config: &PipelineConfig) -> Result<Self, WriterError> {
        Ok(Self {
            participant: config.participant.clone(),
            output_root: config.output_dir.clone(),
            work: WorkPaths::new(&config.work_dir),
            file_pattern: PathPattern::parse(DERIVATIVE_PATTERN)?,
            dir_pattern: PathPattern::parse(DERIVATIVE_DIR_PATTERN)?,
        })
    }

    /// Absolute destination of a derivative file.
    pub fn file_path(&self, entity: &Entity) -> Result<PathBuf, WriterError> {
        Ok(self.output_root.join(self.file_pattern.build(entity)?))
    }

    /// Absolute destination of a derivative directory.
    pub fn dir_path(&self, entity: &Entity) -> Result<PathBuf, WriterError> {
        Ok(self.output_root.join(self.dir_pattern.build(entity)?))
    }

    fn copy_file(
        &self,
        src: PathBuf,
        source: &Entity,
        overrides: EntityOverrides,
    ) -> Result<CopyOp, WriterError> {
        Ok(CopyOp::File {
            src,
            dst: self.file_path(&source.derive(&overrides))?,
        })
    }

    fn raw(&self) -> Query {
        Query::new(&self.participant)
            .extension("nii.gz")
            .scope(Scope::Raw)
    }

    fn brain_t1w<'l>(&self, layout: &'l BidsLayout) -> Result<&'l FileRecord, WriterError> {
        layout
            .first(
                &Query::new(&self.participant)
                    .extension("nii.gz")
                    .scope(Scope::Derivatives)
                    .suffix("T1w")
                    .space(T1W_SPACE)
                    .desc("brain"),
            )
            .ok_or_else(|| WriterError::MissingInput("brain-extracted T1w".to_string()))
    }

    fn native_runs<'l>(
        &self,
        layout: &'l BidsLayout,
    ) -> Result<Vec<(&'l FileRecord, String)>, WriterError> {
        let mut runs = Vec::new();
        for func in layout.get(
            &Query::new(&self.participant)
                .extension("nii.gz")
                .scope(Scope::Derivatives)
                .suffix("bold")
                .space(NATIVE_SPACE)
                .desc("preproc"),
        ) {
            let key = func
                .entities
                .run_key()
                .ok_or_else(|| WriterError::MissingInput(format!("task of {}", func.filename)))?;
            runs.push((func, key));
        }
        Ok(runs)
    }

    /// Brain, brain mask and skull-on T1w in T1w space.
    pub fn plan_brain_extraction(&self, layout: &BidsLayout) -> Result<Vec<CopyOp>, WriterError> {
        let t1w = layout
            .first(&self.raw().suffix("T1w"))
            .ok_or_else(|| WriterError::MissingInput("raw T1w".to_string()))?;
        let bet = self.work.bet_dir();
        let anat = || EntityOverrides::new().datatype("anat").space(T1W_SPACE);

        Ok(vec![
            self.copy_file(
                bet.join("struc_acpc_brain.nii.gz"),
                &t1w.entities,
                anat().desc("brain"),
            )?,
            self.copy_file(
                bet.join("struc_acpc_brain_mask.nii.gz"),
                &t1w.entities,
                anat().desc("brain").suffix("mask"),
            )?,
            self.copy_file(
                bet.join("struc_acpc.nii.gz"),
                &t1w.entities,
                anat().desc("skull").suffix("T1w"),
            )?,
        ])
    }

    /// Motion-corrected runs and their reference volumes, in native space.
    pub fn plan_motion_correction(&self, layout: &BidsLayout) -> Result<Vec<CopyOp>, WriterError> {
        let preproc = self.work.preproc_dir();
        let mut plan = Vec::new();

        for func in layout.get(&self.raw().suffix("bold")) {
            let key = func
                .entities
                .run_key()
                .ok_or_else(|| WriterError::MissingInput(format!("task of {}", func.filename)))?;
            let native = || {
                EntityOverrides::new()
                    .datatype("func")
                    .space(NATIVE_SPACE)
                    .desc("preproc")
            };

            plan.push(self.copy_file(
                preproc.join(format!("{key}_mcf.nii.gz")),
                &func.entities,
                native(),
            )?);

            let sbref = preproc.join(format!("{key}_SBRef_bet.nii.gz"));
            let reference = if sbref.exists() {
                sbref
            } else {
                preproc.join(format!("{key}_meanvol_bet.nii.gz"))
            };
            plan.push(self.copy_file(reference, &func.entities, native().suffix("sbref"))?);
        }
        Ok(plan)
    }

    /// CSF, grey and white matter masks in T1w space.
    pub fn plan_segmentation(&self, layout: &BidsLayout) -> Result<Vec<CopyOp>, WriterError> {
        let t1_brain = self.brain_t1w(layout)?;
        let seg = self.work.seg_dir();

        ["CSF", "GM", "WM"]
            .iter()
            .enumerate()
            .map(|(class, tissue)| {
                self.copy_file(
                    seg.join(format!("struc_acpc_brain_pve_{class}.nii.gz")),
                    &t1_brain.entities,
                    EntityOverrides::new()
                        .datatype("anat")
                        .space(T1W_SPACE)
                        .desc(*tissue)
                        .suffix("mask"),
                )
            })
            .collect()
    }

    /// Standard-space runs, transforms, and the standard-space T1w.
    pub fn plan_registration(&self, layout: &BidsLayout) -> Result<Vec<CopyOp>, WriterError> {
        let mut plan = Vec::new();
        let runs = self.native_runs(layout)?;

        for (func, key) in &runs {
            let reg = self.work.reg_dir(key);
            let standard = || {
                EntityOverrides::new()
                    .datatype("func")
                    .space(STANDARD_SPACE)
                    .desc("preproc")
            };

            plan.push(self.copy_file(
                reg.join("func_data2standard.nii.gz"),
                &func.entities,
                standard(),
            )?);
            plan.push(self.copy_file(
                reg.join("example_func2standard.nii.gz"),
                &func.entities,
                standard().suffix("sbref"),
            )?);

            let transforms = func.entities.derive(
                &EntityOverrides::new()
                    .datatype("func")
                    .clear_desc()
                    .suffix("reg"),
            );
            plan.push(CopyOp::Directory {
                src: reg,
                dst: self.dir_path(&transforms)?,
                extension: "mat".to_string(),
            });
        }

        // The anatomical images are identical across runs; take the first.
        if let Some((_, key)) = runs.first() {
            let t1_brain = self.brain_t1w(layout)?;
            let reg = self.work.reg_dir(key);
            let anat = || {
                EntityOverrides::new()
                    .datatype("anat")
                    .space(STANDARD_SPACE)
                    .desc("brain")
            };
            plan.push(self.copy_file(
                reg.join("highres2standard.nii.gz"),
                &t1_brain.entities,
                anat(),
            )?);
            plan.push(self.copy_file(
                reg.join("mask2standard.nii.gz"),
                &t1_brain.entities,
                anat().suffix("mask"),
            )?);
        }
        Ok(plan)
    }

    /// Standard-space SNR maps of registered runs.
    pub fn plan_snr(&self, layout: &BidsLayout) -> Result<Vec<CopyOp>, WriterError> {
        let mut plan = Vec::new();
        for (func, key) in self.native_runs(layout)? {
            if !self.work.reg_dir(&key).join("func_data2standard.nii.gz").exists() {
                continue;
            }
            let task = func.entities.task.as_deref().unwrap_or_default();
            plan.push(self.copy_file(
                self.work.snr_output(&key, task),
                &func.entities,
                EntityOverrides::new()
                    .datatype("func")
                    .space(STANDARD_SPACE)
                    .desc("preproc")
                    .suffix("snr"),
            )?);
        }
        Ok(plan)
    }

    /// Per-run confounds tables.
    pub fn plan_confounds(&self, layout: &BidsLayout) -> Result<Vec<CopyOp>, WriterError> {
        let mut plan = Vec::new();
        for (func, key) in self.native_runs(layout)? {
            plan.push(self.copy_file(
                confounds::table_path(&self.work.confounds_dir(&key)),
                &func.entities,
                EntityOverrides::new()
                    .datatype("func")
                    .clear_space()
                    .desc("confounds")
                    .suffix("timeseries")
                    .extension("tsv"),
            )?);
        }
        Ok(plan)
    }

    /// Non-aggressively denoised runs.
    pub fn plan_aroma(&self, layout: &BidsLayout) -> Result<Vec<CopyOp>, WriterError> {
        let mut plan = Vec::new();
        for (func, key) in self.native_runs(layout)? {
            plan.push(self.copy_file(
                self.work
                    .aroma_dir(&key)
                    .join("denoised_func_data_nonaggr.nii.gz"),
                &func.entities,
                EntityOverrides::new()
                    .datatype("func")
                    .space(NATIVE_SPACE)
                    .desc("nonaggrAROMA"),
            )?);
        }
        Ok(plan)
    }

    /// Executes `plan`.
    ///
    /// With `force` every destination is rewritten; otherwise only missing
    /// destinations are copied. Returns the number of files copied.
    ///
    /// # Errors
    ///
    /// `MissingSource` when a stage output to copy does not exist.
    pub fn apply(&self, plan: &[CopyOp], force: bool) -> Result<usize, WriterError> {
        let mut copied = 0;
        for op in plan {
            match op {
                CopyOp::File { src, dst } => {
                    if !src.is_file() {
                        return Err(WriterError::MissingSource(src.clone()));
                    }
                    if copy_if_needed(src, dst, force)? {
                        copied += 1;
                    }
                }
                CopyOp::Directory {
                    src,
                    dst,
                    extension,
                } => {
                    if !src.is_dir() {
                        return Err(WriterError::MissingSource(src.clone()));
                    }
                    let entries = fs::read_dir(src).map_err(|source| WriterError::Io {
                        path: src.clone(),
                        source,
                    })?;
                    let mut files = Vec::new();
                    for entry in entries {
                        let path = entry
                            .map_err(|source| WriterError::Io {
                                path: src.clone(),
                                source,
                            })?
                            .path();
                        if path.is_file()
                            && path.extension().and_then(|e| e.to_str()) == Some(extension.as_str())
                        {
                            files.push(path);
                        }
                    }
                    files.sort();
                    create_dir(dst)?;
                    for file in files {
                        if let Some(name) = file.file_name() {
                            if copy_if_needed(&file, &dst.join(name), force)? {
                                copied += 1;
                            }
                        }
                    }
                }
            }
        }

        if copied > 0 {
            info!(copied, operations = plan.len(), "Saved derivatives");
        } else {
            debug!(operations = plan.len(), "Derivatives already up to date");
        }
        Ok(copied)
    }
}

fn create_dir(dir: &Path) -> Result<(), WriterError> {
    fs::create_dir_all(dir).map_err(|source| WriterError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn copy_if_needed(src: &Path, dst: &Path, force: bool) -> Result<bool, WriterError> {
    if !force && dst.exists() {
        return Ok(false);
    }
    if let Some(parent) = dst.parent() {
        create_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|source| WriterError::Io {
        path: dst.to_path_buf(),
        source,
    })?;
    debug!(src = %src.display(), dst = %dst.display(), "Copied");
    Ok(true)
}
