//! Per-run confounds table.
//!
//! The outlier stage leaves headerless, whitespace-separated metric files in
//! `<work>/confounds/<key>/`. Continuous metrics (`dvars_metrics.txt`,
//! `fd_metrics.txt`) are mandatory; discrete outlier indicators
//! (`dvars_outliers.txt`, `fd_outliers.txt`) are present only when outliers
//! were found. All columns are aligned by row position into one table.

use std::fs;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, Trim, WriterBuilder};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ConfoundsError;

/// Continuous metric files, in column order.
pub const CONTINUOUS_METRICS: [&str; 2] = ["dvars_metrics.txt", "fd_metrics.txt"];

/// Optional discrete outlier files, in column order.
pub const OUTLIER_METRICS: [&str; 2] = ["dvars_outliers.txt", "fd_outliers.txt"];

/// Name of the merged table inside the run directory.
pub const CONFOUNDS_FILE: &str = "confounds.tsv";

/// One named column of the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    /// Values as written by the metric tool.
    pub values: Vec<String>,
}

/// Confound regressors of one functional run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfoundsTable {
    pub run_key: String,
    pub columns: Vec<Column>,
}

impl ConfoundsTable {
    /// Number of rows (time points).
    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Renders the table as tab-separated text with a header row.
    ///
    /// Fails with `RowCountMismatch` when the columns differ in length.
    pub fn to_tsv(&self) -> Result<String, ConfoundsError> {
        let expected = self.row_count();
        if let Some(bad) = self.columns.iter().find(|c| c.values.len() != expected) {
            return Err(ConfoundsError::RowCountMismatch {
                column: bad.name.clone(),
                expected,
                actual: bad.values.len(),
            });
        }

        let mut writer = WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(Vec::new());

        writer.write_record(self.columns.iter().map(|c| c.name.as_str()))?;
        for row in 0..self.row_count() {
            writer.write_record(
                self.columns
                    .iter()
                    .map(|c| c.values.get(row).map_or("", String::as_str)),
            )?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| ConfoundsError::Io(e.into_error()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Writes the table to `path`.
    ///
    /// Returns `false` without touching the file when it already holds the
    /// same content.
    pub fn write_tsv(&self, path: &Path) -> Result<bool, ConfoundsError> {
        let content = self.to_tsv()?;
        if fs::read_to_string(path).is_ok_and(|current| current == content) {
            debug!(path = %path.display(), "Confounds table unchanged");
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(true)
    }
}

/// Merges the metric files in `run_dir` into one table.
///
/// # Errors
///
/// - `MissingMetric` when a continuous metric file is absent
/// - `EmptyMetric` / `InvalidValue` for unreadable metric content
/// - `RowCountMismatch` when columns disagree on the number of time points
pub fn aggregate(run_dir: &Path, run_key: &str) -> Result<ConfoundsTable, ConfoundsError> {
    let mut columns = Vec::new();

    for file in CONTINUOUS_METRICS {
        let path = run_dir.join(file);
        if !path.is_file() {
            return Err(ConfoundsError::MissingMetric(path));
        }
        let stem = metric_stem(file);
        let name = stem.strip_suffix("_metrics").unwrap_or(stem);
        let parsed = read_metric(&path)?;
        if parsed.len() == 1 {
            columns.extend(parsed.into_iter().map(|values| Column {
                name: name.to_string(),
                values,
            }));
        } else {
            columns.extend(numbered(name, parsed));
        }
    }

    for file in OUTLIER_METRICS {
        let path = run_dir.join(file);
        if !path.is_file() {
            debug!(run = %run_key, file, "No outlier file");
            continue;
        }
        columns.extend(numbered(metric_stem(file), read_metric(&path)?));
    }

    let expected = columns.first().map_or(0, |c| c.values.len());
    if let Some(bad) = columns.iter().find(|c| c.values.len() != expected) {
        return Err(ConfoundsError::RowCountMismatch {
            column: bad.name.clone(),
            expected,
            actual: bad.values.len(),
        });
    }

    info!(
        run = %run_key,
        columns = columns.len(),
        rows = expected,
        "Aggregated confounds"
    );

    Ok(ConfoundsTable {
        run_key: run_key.to_string(),
        columns,
    })
}

/// Location of the merged table for one run.
pub fn table_path(run_dir: &Path) -> PathBuf {
    run_dir.join(CONFOUNDS_FILE)
}

fn metric_stem(file: &str) -> &str {
    file.strip_suffix(".txt").unwrap_or(file)
}

fn numbered(stem: &str, parsed: Vec<Vec<String>>) -> impl Iterator<Item = Column> + '_ {
    parsed.into_iter().enumerate().map(move |(i, values)| Column {
        name: format!("{stem}_{:02}", i + 1),
        values,
    })
}

/// Reads a headerless whitespace-separated numeric file column by column.
fn read_metric(path: &Path) -> Result<Vec<Vec<String>>, ConfoundsError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)?;

    let mut columns: Vec<Vec<String>> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let fields: Vec<&str> = record.iter().flat_map(str::split_whitespace).collect();
        if fields.is_empty() {
            continue;
        }
        for (index, field) in fields.into_iter().enumerate() {
            if field.parse::<f64>().is_err() {
                return Err(ConfoundsError::InvalidValue {
                    path: path.to_path_buf(),
                    line: line + 1,
                    value: field.to_string(),
                });
            }
            if columns.len() <= index {
                columns.push(Vec::new());
            }
            columns[index].push(field.to_string());
        }
    }

    if columns.is_empty() {
        return Err(ConfoundsError::EmptyMetric {
            path: path.to_path_buf(),
        });
    }
    Ok(columns)
}
