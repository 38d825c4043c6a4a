//! BIDS dataset index.
//!
//! Walks a raw BIDS dataset (and optionally a derivative tree), parses every
//! `sub-*` file name into an [`Entity`] and answers filtered queries. Sidecar
//! metadata is resolved lazily following the BIDS inheritance principle.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::entity::{Entity, EntityKey};
use crate::error::LayoutError;

/// Directory names that identify a BIDS datatype.
const DATATYPES: &[&str] = &["anat", "func", "fmap", "dwi", "perf", "beh"];

/// Which tree a file was indexed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The raw BIDS input dataset.
    Raw,
    /// The derivative tree produced by this pipeline.
    Derivatives,
    /// Either tree.
    Any,
}

/// One indexed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute (or root-relative, as given) path to the file.
    pub path: PathBuf,
    /// File name without directories.
    pub filename: String,
    /// Entities parsed from the path.
    pub entities: Entity,
    /// Tree the file belongs to.
    pub scope: Scope,
    dataset_root: PathBuf,
}

impl FileRecord {
    /// Returns the merged JSON sidecar metadata for this file.
    ///
    /// Sidecars in the file's directory and every ancestor up to the dataset
    /// root apply when their entities are a subset of this file's and their
    /// suffix matches. Nearer sidecars override farther ones.
    pub fn metadata(&self) -> Result<Map<String, Value>, LayoutError> {
        let mut directories = Vec::new();
        let mut current = self.path.parent();
        while let Some(dir) = current {
            directories.push(dir.to_path_buf());
            if dir == self.dataset_root.as_path() || !dir.starts_with(&self.dataset_root) {
                break;
            }
            current = dir.parent();
        }

        let mut merged = Map::new();
        // farthest first so nearer sidecars win
        for dir in directories.iter().rev() {
            let mut sidecars = Vec::new();
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let sidecar = parse_entities(&path);
                if applies_to(&sidecar, &self.entities) {
                    sidecars.push((specificity(&sidecar), path));
                }
            }
            sidecars.sort();

            for (_, path) in sidecars {
                let content = fs::read_to_string(&path)?;
                let value: Value =
                    serde_json::from_str(&content).map_err(|source| LayoutError::Sidecar {
                        path: path.clone(),
                        source,
                    })?;
                if let Value::Object(fields) = value {
                    merged.extend(fields);
                }
            }
        }

        Ok(merged)
    }
}

/// Filter for [`BidsLayout::get`].
#[derive(Debug, Clone)]
pub struct Query {
    subject: String,
    suffixes: Vec<String>,
    extension: Option<String>,
    desc: Option<String>,
    space: Option<String>,
    datatype: Option<String>,
    like: Option<Entity>,
    scope: Scope,
}

impl Query {
    /// Creates a query for all files of `subject` in any tree.
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            suffixes: Vec::new(),
            extension: None,
            desc: None,
            space: None,
            datatype: None,
            like: None,
            scope: Scope::Any,
        }
    }

    /// Adds an accepted suffix. Several calls accept any of them.
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffixes.push(suffix.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = Some(datatype.into());
        self
    }

    /// Restricts results to files with the same session, task, acquisition and run.
    pub fn like(mut self, entity: &Entity) -> Self {
        self.like = Some(entity.clone());
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    fn matches(&self, record: &FileRecord) -> bool {
        let entities = &record.entities;
        if self.scope != Scope::Any && self.scope != record.scope {
            return false;
        }
        if entities.subject.as_deref() != Some(self.subject.as_str()) {
            return false;
        }
        if !self.suffixes.is_empty()
            && !self
                .suffixes
                .iter()
                .any(|s| entities.suffix.as_deref() == Some(s.as_str()))
        {
            return false;
        }
        let wants = |wanted: &Option<String>, actual: &Option<String>| match wanted {
            Some(wanted) => actual.as_deref() == Some(wanted.as_str()),
            None => true,
        };
        if !wants(&self.extension, &entities.extension)
            || !wants(&self.desc, &entities.desc)
            || !wants(&self.space, &entities.space)
            || !wants(&self.datatype, &entities.datatype)
        {
            return false;
        }
        match &self.like {
            Some(like) => like.same_acquisition(entities),
            None => true,
        }
    }
}

/// Index over a raw BIDS dataset and, optionally, a derivative tree.
#[derive(Debug, Clone)]
pub struct BidsLayout {
    root: PathBuf,
    derivatives: Option<PathBuf>,
    records: Vec<FileRecord>,
}

impl BidsLayout {
    /// Indexes `root` and, if given and present, `derivatives`.
    ///
    /// # Errors
    ///
    /// Returns `LayoutError::RootMissing` when `root` does not exist.
    pub fn load(root: &Path, derivatives: Option<&Path>) -> Result<Self, LayoutError> {
        if !root.is_dir() {
            return Err(LayoutError::RootMissing(root.to_path_buf()));
        }

        let mut records = index_tree(root, Scope::Raw)?;
        if let Some(derivatives) = derivatives {
            if derivatives.is_dir() {
                records.extend(index_tree(derivatives, Scope::Derivatives)?);
            }
        }
        records.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            root = %root.display(),
            files = records.len(),
            "Indexed BIDS layout"
        );

        Ok(Self {
            root: root.to_path_buf(),
            derivatives: derivatives.map(Path::to_path_buf),
            records,
        })
    }

    /// Re-walks both trees, picking up files written since the last load.
    pub fn reload(&self) -> Result<Self, LayoutError> {
        Self::load(&self.root, self.derivatives.as_deref())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns every record matching `query`, sorted by path.
    pub fn get(&self, query: &Query) -> Vec<&FileRecord> {
        self.records.iter().filter(|r| query.matches(r)).collect()
    }

    /// Returns the first record matching `query`.
    pub fn first(&self, query: &Query) -> Option<&FileRecord> {
        self.records.iter().find(|r| query.matches(r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn index_tree(root: &Path, scope: Scope) -> Result<Vec<FileRecord>, LayoutError> {
    let mut records = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry, scope));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(filename) = entry.file_name().to_str() else {
            continue;
        };
        if !filename.starts_with("sub-") || filename.ends_with(".json") {
            continue;
        }
        records.push(FileRecord {
            path: entry.path().to_path_buf(),
            filename: filename.to_string(),
            entities: parse_entities(entry.path()),
            scope,
            dataset_root: root.to_path_buf(),
        });
    }
    Ok(records)
}

fn is_skipped_dir(entry: &DirEntry, scope: Scope) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.')
        || (scope == Scope::Raw && (name == "derivatives" || name == "sourcedata"))
}

/// Parses the BIDS entities encoded in a file path.
///
/// Key-value tokens (`sub-01`, `run-2`) fill the matching fields, the final
/// token without a dash is the suffix, everything after the first dot is the
/// extension and the parent directory supplies the datatype when it is one of
/// the BIDS datatype names.
pub fn parse_entities(path: &Path) -> Entity {
    let mut entity = Entity::new();
    let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
        return entity;
    };

    let (stem, extension) = match filename.split_once('.') {
        Some((stem, extension)) => (stem, Some(extension)),
        None => (filename, None),
    };
    if let Some(extension) = extension {
        entity.set_text(EntityKey::Extension, extension);
    }

    for token in stem.split('_') {
        match token.split_once('-') {
            Some((label, value)) => {
                if let Some(key) = EntityKey::from_bids_label(label) {
                    if !entity.set_text(key, value) {
                        debug!(file = filename, label, value, "Ignoring unparsable entity");
                    }
                }
            }
            None => {
                entity.set_text(EntityKey::Suffix, token);
            }
        }
    }

    if let Some(dir) = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
    {
        if DATATYPES.contains(&dir) {
            entity.set_text(EntityKey::Datatype, dir);
        }
    }

    entity
}

fn applies_to(sidecar: &Entity, target: &Entity) -> bool {
    if sidecar.suffix.is_none() || sidecar.suffix != target.suffix {
        return false;
    }
    let subset = |candidate: &Option<String>, actual: &Option<String>| {
        candidate.is_none() || candidate == actual
    };
    subset(&sidecar.subject, &target.subject)
        && subset(&sidecar.session, &target.session)
        && subset(&sidecar.task, &target.task)
        && subset(&sidecar.acquisition, &target.acquisition)
        && subset(&sidecar.reconstruction, &target.reconstruction)
        && subset(&sidecar.direction, &target.direction)
        && subset(&sidecar.space, &target.space)
        && subset(&sidecar.desc, &target.desc)
        && (sidecar.run.is_none() || sidecar.run == target.run)
        && (sidecar.echo.is_none() || sidecar.echo == target.echo)
}

fn specificity(entity: &Entity) -> usize {
    [
        entity.subject.is_some(),
        entity.session.is_some(),
        entity.task.is_some(),
        entity.acquisition.is_some(),
        entity.reconstruction.is_some(),
        entity.run.is_some(),
        entity.echo.is_some(),
        entity.direction.is_some(),
        entity.space.is_some(),
        entity.desc.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count()
}
