//! CSV normalization: canonical column names, no artifact index column.

use crate::contract::ColumnMapping;
use crate::error::{IngestError, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of cleaning one raw file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedCsv {
    pub path: PathBuf,
    pub columns: Vec<String>,
    pub rows: usize,
}

/// Index column left behind by dataframe writers: empty header or `Unnamed: <n>`.
pub fn is_artifact_index_column(header: &str) -> bool {
    let header = header.trim();
    if header.is_empty() {
        return true;
    }
    match header.strip_prefix("Unnamed: ") {
        Some(rest) => !rest.is_empty() && rest.chars().all(|ch| ch.is_ascii_digit()),
        None => false,
    }
}

/// Rewrite `src` into `dest` with canonical headers.
///
/// The output is written to a hidden sibling file and renamed into place, so
/// `dest` either holds a complete cleaned file or is untouched. `src` is
/// never modified.
pub fn clean_csv(src: &Path, dest: &Path, mapping: &ColumnMapping) -> Result<CleanedCsv> {
    let cleaning_error = |reason: String| IngestError::Cleaning {
        path: src.to_path_buf(),
        reason,
    };

    let mut reader = csv::Reader::from_path(src).map_err(|e| cleaning_error(e.to_string()))?;
    let raw_headers = reader
        .headers()
        .map_err(|e| cleaning_error(e.to_string()))?
        .clone();

    let mut keep = Vec::with_capacity(raw_headers.len());
    let mut columns = Vec::with_capacity(raw_headers.len());
    for (index, header) in raw_headers.iter().enumerate() {
        if is_artifact_index_column(header) {
            continue;
        }
        keep.push(index);
        columns.push(mapping.rename(header).to_string());
    }

    let mut seen = BTreeSet::new();
    if let Some(dup) = columns.iter().find(|col| !seen.insert(col.as_str())) {
        return Err(cleaning_error(format!(
            "column '{}' appears more than once after renaming",
            dup
        )));
    }

    let missing: Vec<String> = mapping
        .canonical_columns()
        .into_iter()
        .filter(|col| !seen.contains(col.as_str()))
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::MissingColumns {
            path: src.to_path_buf(),
            missing,
        });
    }

    let tmp = partial_path(dest);
    let rows = match write_projection(&mut reader, &tmp, &columns, &keep) {
        Ok(rows) => rows,
        Err(reason) => {
            let _ = fs::remove_file(&tmp);
            return Err(cleaning_error(reason));
        }
    };
    if let Err(e) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(IngestError::io(dest, e));
    }

    Ok(CleanedCsv {
        path: dest.to_path_buf(),
        columns,
        rows,
    })
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.partial", name))
}

fn write_projection(
    reader: &mut csv::Reader<fs::File>,
    out: &Path,
    columns: &[String],
    keep: &[usize],
) -> std::result::Result<usize, String> {
    let mut writer = csv::Writer::from_path(out).map_err(|e| e.to_string())?;
    writer.write_record(columns).map_err(|e| e.to_string())?;

    let mut rows = 0;
    for record in reader.records() {
        let record = record.map_err(|e| e.to_string())?;
        writer
            .write_record(keep.iter().map(|&i| record.get(i).unwrap_or("")))
            .map_err(|e| e.to_string())?;
        rows += 1;
    }
    writer.flush().map_err(|e| e.to_string())?;
    Ok(rows)
}
