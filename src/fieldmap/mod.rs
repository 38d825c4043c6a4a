//! Fieldmap pairing and intended-for matching.
//!
//! Distortion correction needs complete pairs of fieldmaps acquired with
//! opposite phase-encoding directions (AP and PA). Pairs are rediscovered on
//! every invocation from the participant's fieldmap collection. Each pair
//! gets its own working directory `topup/topup-NN/`, and the list of
//! functional files it is intended for is persisted there as
//! `intendedfor.list` so per-file stages can look the pair up again.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::entity::{Entity, EntityKey};
use crate::error::FieldmapError;

/// Side file holding one intended-for entry per line.
pub const INTENDED_FOR_FILE: &str = "intendedfor.list";

/// Prefix of every per-pair working directory.
pub const TOPUP_DIR_PREFIX: &str = "topup-";

/// Pair id used when the fieldmaps carry no run entity.
const SINGLE_PAIR_ID: &str = "01";

/// A fieldmap image together with what the pairing needs to know about it.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldmapFile {
    pub path: PathBuf,
    pub filename: String,
    pub entities: Entity,
    pub metadata: Map<String, Value>,
}

/// Two fieldmaps sharing a run index with opposite phase-encoding directions.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldmapPair {
    /// Two-digit run index (`01`), also naming the working directory.
    pub run_id: String,
    /// Fieldmap acquired anterior→posterior.
    pub ap: PathBuf,
    /// Fieldmap acquired posterior→anterior.
    pub pa: PathBuf,
    /// Functional files this pair should correct, as listed in `IntendedFor`.
    pub intended_for: Vec<String>,
    /// Total readout time of the AP acquisition, in seconds.
    pub total_readout_time: f64,
}

impl FieldmapPair {
    /// Dedicated working directory of this pair under `topup_root`.
    pub fn work_dir(&self, topup_root: &Path) -> PathBuf {
        topup_root.join(format!("{TOPUP_DIR_PREFIX}{}", self.run_id))
    }
}

/// Groups a participant's fieldmaps into AP/PA pairs.
///
/// # Errors
///
/// - `NoFieldmaps` / `OddCount` when the collection cannot form complete pairs
/// - `IncompletePair` when a run group does not hold exactly two images
/// - `MissingDirection` when a group lacks its AP or PA image
/// - `MissingMetadata` when the AP image has no `TotalReadoutTime`
pub fn pair_fieldmaps(fieldmaps: &[FieldmapFile]) -> Result<Vec<FieldmapPair>, FieldmapError> {
    if fieldmaps.is_empty() {
        return Err(FieldmapError::NoFieldmaps);
    }
    if fieldmaps.len() % 2 != 0 {
        return Err(FieldmapError::OddCount {
            count: fieldmaps.len(),
        });
    }

    let mut groups: BTreeMap<String, Vec<&FieldmapFile>> = BTreeMap::new();
    if fieldmaps.iter().any(|f| f.entities.run.is_none()) {
        debug!("Fieldmaps without run entity, treating collection as a single pair");
        groups.insert(SINGLE_PAIR_ID.to_string(), fieldmaps.iter().collect());
    } else {
        for fieldmap in fieldmaps {
            let run_id = fieldmap
                .entities
                .value(EntityKey::Run)
                .unwrap_or_else(|| SINGLE_PAIR_ID.to_string());
            groups.entry(run_id).or_default().push(fieldmap);
        }
    }

    let mut pairs = Vec::with_capacity(groups.len());
    for (run_id, group) in groups {
        if group.len() != 2 {
            return Err(FieldmapError::IncompletePair {
                run_id,
                count: group.len(),
            });
        }

        let ap = group
            .iter()
            .position(|f| has_direction(f, "AP"))
            .ok_or_else(|| FieldmapError::MissingDirection {
                run_id: run_id.clone(),
                direction: "AP".to_string(),
            })?;
        let pa = group
            .iter()
            .enumerate()
            .position(|(i, f)| i != ap && has_direction(f, "PA"))
            .ok_or_else(|| FieldmapError::MissingDirection {
                run_id: run_id.clone(),
                direction: "PA".to_string(),
            })?;
        let (ap, pa) = (group[ap], group[pa]);

        let total_readout_time = ap
            .metadata
            .get("TotalReadoutTime")
            .and_then(Value::as_f64)
            .ok_or_else(|| FieldmapError::MissingMetadata {
                file: ap.filename.clone(),
                key: "TotalReadoutTime".to_string(),
            })?;

        let mut intended_for = Vec::new();
        for entry in intended_for_entries(&ap.metadata)
            .into_iter()
            .chain(intended_for_entries(&pa.metadata))
        {
            if !intended_for.contains(&entry) {
                intended_for.push(entry);
            }
        }

        info!(
            run = %run_id,
            ap = %ap.filename,
            pa = %pa.filename,
            intended_for = intended_for.len(),
            "Paired fieldmaps"
        );

        pairs.push(FieldmapPair {
            run_id,
            ap: ap.path.clone(),
            pa: pa.path.clone(),
            intended_for,
            total_readout_time,
        });
    }

    Ok(pairs)
}

fn has_direction(fieldmap: &FieldmapFile, direction: &str) -> bool {
    fieldmap
        .entities
        .direction
        .as_deref()
        .is_some_and(|d| d.contains(direction))
}

fn intended_for_entries(metadata: &Map<String, Value>) -> Vec<String> {
    match metadata.get("IntendedFor") {
        Some(Value::String(entry)) => vec![entry.clone()],
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Writes the pair's intended-for list into `dir`, one entry per line.
///
/// The file is left untouched when its content is already current.
pub fn persist_intended_for(pair: &FieldmapPair, dir: &Path) -> Result<PathBuf, FieldmapError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(INTENDED_FOR_FILE);

    let mut content = pair.intended_for.join("\n");
    content.push('\n');

    let current = fs::read_to_string(&path).ok();
    if current.as_deref() != Some(content.as_str()) {
        fs::write(&path, content)?;
    }
    Ok(path)
}

/// Finds the topup working directory whose intended-for list names `filename`.
///
/// An entry matches when its last path component equals `filename`.
///
/// # Errors
///
/// `NoMatch` when no list names the file, `AmbiguousMatch` when more than one does.
pub fn resolve_topup_dir(topup_root: &Path, filename: &str) -> Result<PathBuf, FieldmapError> {
    let mut matches = Vec::new();

    if topup_root.is_dir() {
        for entry in fs::read_dir(topup_root)? {
            let dir = entry?.path();
            let is_pair_dir = dir.is_dir()
                && dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(TOPUP_DIR_PREFIX));
            if !is_pair_dir {
                continue;
            }
            let list = dir.join(INTENDED_FOR_FILE);
            let Ok(content) = fs::read_to_string(&list) else {
                continue;
            };
            let claimed = content.lines().map(str::trim).any(|line| {
                Path::new(line)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n == filename)
            });
            if claimed {
                matches.push(dir);
            }
        }
    }

    matches.sort();
    match matches.len() {
        0 => Err(FieldmapError::NoMatch {
            file: filename.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        _ => Err(FieldmapError::AmbiguousMatch {
            file: filename.to_string(),
            dirs: matches.iter().map(|d| d.display().to_string()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn fieldmap(run: Option<u32>, direction: &str, metadata: Value) -> FieldmapFile {
        let run_token = run.map(|r| format!("_run-{r:02}")).unwrap_or_default();
        let filename = format!("sub-01_dir-{direction}{run_token}_epi.nii.gz");
        let mut entities = Entity::new()
            .with_subject("01")
            .with_direction(direction)
            .with_suffix("epi");
        entities.run = run;
        FieldmapFile {
            path: PathBuf::from(format!("/bids/sub-01/fmap/{filename}")),
            filename,
            entities,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
        }
    }

    fn ap_meta(intended: &[&str]) -> Value {
        json!({"TotalReadoutTime": 0.05, "IntendedFor": intended})
    }

    #[test]
    fn test_even_collection_pairs() {
        let fieldmaps = vec![
            fieldmap(Some(1), "AP", ap_meta(&["func/sub-01_task-rest_run-01_bold.nii.gz"])),
            fieldmap(Some(1), "PA", json!({})),
            fieldmap(Some(2), "PA", json!({})),
            fieldmap(Some(2), "AP", ap_meta(&["func/sub-01_task-rest_run-02_bold.nii.gz"])),
        ];

        let pairs = pair_fieldmaps(&fieldmaps).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].run_id, "01");
        assert_eq!(pairs[1].run_id, "02");
        assert!(pairs[1].ap.to_string_lossy().contains("dir-AP"));
        assert!(pairs[1].pa.to_string_lossy().contains("dir-PA"));
        assert!((pairs[0].total_readout_time - 0.05).abs() < f64::EPSILON);
        assert_eq!(
            pairs[0].intended_for,
            vec!["func/sub-01_task-rest_run-01_bold.nii.gz".to_string()]
        );
    }

    #[test]
    fn test_odd_collection_fails() {
        let fieldmaps = vec![
            fieldmap(Some(1), "AP", ap_meta(&[])),
            fieldmap(Some(1), "PA", json!({})),
            fieldmap(Some(2), "AP", ap_meta(&[])),
        ];
        assert!(matches!(
            pair_fieldmaps(&fieldmaps),
            Err(FieldmapError::OddCount { count: 3 })
        ));
    }

    #[test]
    fn test_empty_collection_fails() {
        assert!(matches!(pair_fieldmaps(&[]), Err(FieldmapError::NoFieldmaps)));
    }

    #[test]
    fn test_missing_direction_fails() {
        let fieldmaps = vec![
            fieldmap(Some(1), "AP", ap_meta(&[])),
            fieldmap(Some(1), "AP", ap_meta(&[])),
        ];
        assert!(matches!(
            pair_fieldmaps(&fieldmaps),
            Err(FieldmapError::MissingDirection { ref direction, .. }) if direction == "PA"
        ));
    }

    #[test]
    fn test_unbalanced_groups_fail() {
        let fieldmaps = vec![
            fieldmap(Some(1), "AP", ap_meta(&[])),
            fieldmap(Some(1), "PA", json!({})),
            fieldmap(Some(1), "PA", json!({})),
            fieldmap(Some(2), "AP", ap_meta(&[])),
        ];
        assert!(matches!(
            pair_fieldmaps(&fieldmaps),
            Err(FieldmapError::IncompletePair { count: 3, .. })
        ));
    }

    #[test]
    fn test_single_pair_fallback_without_run() {
        let fieldmaps = vec![
            fieldmap(None, "PA", json!({"IntendedFor": "func/sub-01_task-rest_bold.nii.gz"})),
            fieldmap(None, "AP", ap_meta(&["func/sub-01_task-rest_bold.nii.gz"])),
        ];
        let pairs = pair_fieldmaps(&fieldmaps).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].run_id, "01");
        // union is deduplicated
        assert_eq!(pairs[0].intended_for.len(), 1);
    }

    #[test]
    fn test_missing_readout_time_fails() {
        let fieldmaps = vec![
            fieldmap(Some(1), "AP", json!({})),
            fieldmap(Some(1), "PA", json!({})),
        ];
        assert!(matches!(
            pair_fieldmaps(&fieldmaps),
            Err(FieldmapError::MissingMetadata { .. })
        ));
    }

    #[test]
    fn test_persist_and_resolve() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let topup_root = dir.path().join("topup");
        let fieldmaps = vec![
            fieldmap(Some(1), "AP", ap_meta(&["ses-1/func/sub-01_task-rest_run-01_bold.nii.gz"])),
            fieldmap(Some(1), "PA", json!({})),
            fieldmap(Some(2), "AP", ap_meta(&["bids::sub-01/func/sub-01_task-rest_run-02_bold.nii.gz"])),
            fieldmap(Some(2), "PA", json!({})),
        ];
        for pair in pair_fieldmaps(&fieldmaps).unwrap() {
            persist_intended_for(&pair, &pair.work_dir(&topup_root)).unwrap();
        }

        let resolved =
            resolve_topup_dir(&topup_root, "sub-01_task-rest_run-02_bold.nii.gz").unwrap();
        assert_eq!(resolved, topup_root.join("topup-02"));

        let content = fs::read_to_string(topup_root.join("topup-01").join(INTENDED_FOR_FILE)).unwrap();
        assert_eq!(content, "ses-1/func/sub-01_task-rest_run-01_bold.nii.gz\n");
    }

    #[test]
    fn test_resolve_no_match() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let pair_dir = dir.path().join("topup-01");
        fs::create_dir_all(&pair_dir).unwrap();
        fs::write(pair_dir.join(INTENDED_FOR_FILE), "func/sub-01_task-a_bold.nii.gz\n").unwrap();

        assert!(matches!(
            resolve_topup_dir(dir.path(), "sub-01_task-b_bold.nii.gz"),
            Err(FieldmapError::NoMatch { .. })
        ));
        // partial names do not match
        assert!(matches!(
            resolve_topup_dir(dir.path(), "task-a_bold.nii.gz"),
            Err(FieldmapError::NoMatch { .. })
        ));
    }

    #[test]
    fn test_resolve_ambiguous_match_fails() {
        let dir = TempDir::new().expect("failed to create temp dir");
        for id in ["01", "02"] {
            let pair_dir = dir.path().join(format!("topup-{id}"));
            fs::create_dir_all(&pair_dir).unwrap();
            fs::write(pair_dir.join(INTENDED_FOR_FILE), "func/sub-01_task-a_bold.nii.gz\n").unwrap();
        }

        match resolve_topup_dir(dir.path(), "sub-01_task-a_bold.nii.gz") {
            Err(FieldmapError::AmbiguousMatch { dirs, .. }) => assert_eq!(dirs.len(), 2),
            other => panic!("expected ambiguous match, got {other:?}"),
        }
    }
}
